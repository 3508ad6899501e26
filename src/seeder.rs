use crate::error::{BittorrentError, Result};
use crate::peer::{read_message, write_message, Bitfield, BlockInfo, Handshake, PeerMessage};
use crate::piece::{PieceManager, BLOCK_SIZE};
use crate::storage::{PositionalFile, StorageManager};
use crate::torrent::{Metainfo, TorrentInfo};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// A connection that sends nothing for this long is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Serves the pieces of one local file to any peer that asks.
pub struct Seeder {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    info: TorrentInfo,
    path: PathBuf,
    handshake: Handshake,
    bitfield: Bitfield,
}

impl Seeder {
    /// Validate `path` against `meta` and start listening on `listen_addr`.
    /// Only pieces whose hash matches are advertised.
    pub async fn bind<P: AsRef<Path>>(
        listen_addr: SocketAddr,
        meta: &Metainfo,
        path: P,
        peer_id: [u8; 20],
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = StorageManager::open_existing(&path, meta.info.total_length).await?;

        let mut manager = PieceManager::new(&meta.info);
        let missing = manager.resume(&mut file).await?;
        if !missing.is_empty() {
            warn!(
                "{} of {} pieces in {:?} do not match the torrent and will not be served",
                missing.len(),
                manager.piece_count(),
                path
            );
        }

        let listener = TcpListener::bind(listen_addr).await?;
        info!("Seeding {} on {}", meta.info.name, listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                info: meta.info.clone(),
                path,
                handshake: Handshake::new(meta.info_hash, peer_id),
                bitfield: manager.bitfield().clone(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. Open connections are
    /// dropped on return.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let (stream, addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
                // Reap finished connections so the set does not grow.
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };

            debug!("Accepted connection from {}", addr);
            let shared = self.shared.clone();
            connections.spawn(
                async move {
                    match serve(stream, &shared).await {
                        Ok(()) => debug!("Peer {} disconnected", addr),
                        Err(e) => warn!("Closing connection to {}: {}", addr, e),
                    }
                }
                .instrument(info_span!("seed", peer = %addr)),
            );
        }

        connections.shutdown().await;
        info!("Seeder stopped");
        Ok(())
    }
}

async fn serve(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    shared.handshake.respond(&mut stream, HANDSHAKE_TIMEOUT).await?;

    let bitfield = PeerMessage::Bitfield {
        bitfield: shared.bitfield.as_bytes().to_vec(),
    };
    write_message(&mut stream, &bitfield).await?;
    write_message(&mut stream, &PeerMessage::Unchoke).await?;

    let mut file = StorageManager::open_existing(&shared.path, shared.info.total_length).await?;

    loop {
        let message = match timeout(IDLE_TIMEOUT, read_message(&mut stream)).await {
            Err(_) => return Err(BittorrentError::Timeout("idle connection".to_string())),
            Ok(Err(BittorrentError::IoError(e))) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Ok(message) => message?,
        };

        match message {
            PeerMessage::Request { block } => {
                shared.check_request(&block)?;
                let offset = shared.info.piece_offset(block.piece_index as usize) + block.offset as u64;
                let data = file.read_at(offset, block.length as usize).await?;
                let reply = PeerMessage::Piece {
                    piece_index: block.piece_index,
                    offset: block.offset,
                    data,
                };
                write_message(&mut stream, &reply).await?;
            }
            other => debug!("Ignoring message kind {:?}", other.id()),
        }
    }
}

impl Shared {
    fn check_request(&self, block: &BlockInfo) -> Result<()> {
        let index = block.piece_index as usize;
        if !self.bitfield.has_piece(index) {
            return Err(BittorrentError::UnexpectedFrame(format!(
                "request for piece {} which is not served",
                index
            )));
        }
        if block.length == 0 || block.length > BLOCK_SIZE {
            return Err(BittorrentError::UnexpectedFrame(format!(
                "request length {} outside 1..={}",
                block.length, BLOCK_SIZE
            )));
        }
        let end = block.offset as u64 + block.length as u64;
        if end > self.info.piece_size(index) {
            return Err(BittorrentError::UnexpectedFrame(format!(
                "request {}..{} past end of piece {}",
                block.offset, end, index
            )));
        }
        Ok(())
    }
}
