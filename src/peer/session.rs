use super::message::MAX_FRAME_LENGTH;
use super::{read_message, write_message, Bitfield, BlockInfo, Handshake, PeerMessage, PeerState, Timeouts};
use crate::error::{BittorrentError, Result};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// An established connection: handshake done and the peer's bitfield known.
///
/// Only the owning worker reads from a session; there is never more than one
/// outstanding read.
pub struct PeerSession {
    addr: SocketAddr,
    stream: TcpStream,
    state: PeerState,
    peer_id: [u8; 20],
    bitfield: Bitfield,
    /// Set by an explicit `choke` frame, cleared by `unchoke`.
    choke_received: bool,
}

impl PeerSession {
    /// Dial `addr`, exchange handshakes, and read the peer's bitfield.
    ///
    /// Nothing is returned unless every step succeeds; on failure the
    /// connection is dropped.
    pub async fn open(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        num_pieces: usize,
        timeouts: &Timeouts,
    ) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let mut stream = timeout(timeouts.connect, TcpStream::connect(addr))
            .await
            .map_err(|_| BittorrentError::ConnectError {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| BittorrentError::ConnectError { addr, source })?;

        let reply = Handshake::new(info_hash, our_peer_id)
            .initiate(&mut stream, timeouts.handshake)
            .await?;

        let first = timeout(timeouts.bitfield, read_message(&mut stream))
            .await
            .map_err(|_| BittorrentError::Timeout("bitfield".to_string()))??;
        let bitfield = match first {
            PeerMessage::Bitfield { bitfield } => Bitfield::from_bytes(&bitfield, num_pieces),
            other => {
                return Err(BittorrentError::UnexpectedFrame(format!(
                    "expected bitfield, got kind {:?}",
                    other.id()
                )))
            }
        };

        info!(
            "Session established with {} ({} of {} pieces available)",
            addr,
            bitfield.count(),
            num_pieces
        );

        Ok(Self {
            addr,
            stream,
            state: PeerState::default(),
            peer_id: reply.peer_id,
            choke_received: false,
            bitfield,
        })
    }

    /// Block until one frame (or keep-alive) arrives.
    pub async fn read(&mut self) -> Result<PeerMessage> {
        let message = read_message(&mut self.stream).await?;
        self.handle_message(&message);
        Ok(message)
    }

    /// Apply every frame that has fully arrived without waiting for more.
    ///
    /// A frame is only consumed once all of its bytes are buffered, so a
    /// partial frame stays intact for the next `read`. Returns how many
    /// frames were handled.
    pub async fn drain_ready(&mut self) -> Result<usize> {
        // Give the driver a turn to notice bytes that have landed.
        tokio::task::yield_now().await;

        let mut drained = 0;
        loop {
            let mut header = [0u8; 4];
            match timeout(Duration::ZERO, self.stream.peek(&mut header)).await {
                Ok(Ok(4)) => {}
                Ok(Ok(_)) | Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
            }

            let length = u32::from_be_bytes(header) as usize;
            if length <= MAX_FRAME_LENGTH {
                let mut frame = vec![0u8; 4 + length];
                match timeout(Duration::ZERO, self.stream.peek(&mut frame)).await {
                    Ok(Ok(n)) if n == frame.len() => {}
                    Ok(Ok(_)) | Err(_) => break,
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
            // An oversized header fails here with the usual error.
            let message = self.read().await?;
            debug!("Drained {:?} from {}", message.id(), self.addr);
            drained += 1;
        }
        Ok(drained)
    }

    fn handle_message(&mut self, message: &PeerMessage) {
        match message {
            PeerMessage::Choke => {
                self.state.peer_choking = true;
                self.choke_received = true;
            }
            PeerMessage::Unchoke => {
                self.state.peer_choking = false;
                self.choke_received = false;
            }
            PeerMessage::Interested => self.state.peer_interested = true,
            PeerMessage::NotInterested => self.state.peer_interested = false,
            PeerMessage::Have { piece_index } => self.bitfield.set_piece(*piece_index as usize),
            PeerMessage::Bitfield { bitfield } => {
                self.bitfield = Bitfield::from_bytes(bitfield, self.bitfield.piece_count());
            }
            _ => {}
        }
    }

    async fn send(&mut self, message: &PeerMessage) -> Result<()> {
        write_message(&mut self.stream, message).await?;

        match message {
            PeerMessage::Choke => self.state.am_choking = true,
            PeerMessage::Unchoke => self.state.am_choking = false,
            PeerMessage::Interested => self.state.am_interested = true,
            PeerMessage::NotInterested => self.state.am_interested = false,
            _ => {}
        }

        debug!("Sent message to {}: {:?}", self.addr, message.id());
        Ok(())
    }

    pub async fn request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send(&PeerMessage::Request {
            block: BlockInfo::new(index, begin, length),
        })
        .await
    }

    pub async fn send_have(&mut self, index: u32) -> Result<()> {
        self.send(&PeerMessage::Have { piece_index: index }).await
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send(&PeerMessage::Interested).await
    }

    pub async fn send_not_interested(&mut self) -> Result<()> {
        self.send(&PeerMessage::NotInterested).await
    }

    pub async fn send_unchoke(&mut self) -> Result<()> {
        self.send(&PeerMessage::Unchoke).await
    }

    /// Whether the peer is refusing our requests.
    ///
    /// Only an explicit `choke` counts. `state().peer_choking` starts out
    /// true, but a peer that never sends `unchoke` is still asked.
    pub fn is_choked(&self) -> bool {
        self.choke_received
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }
}
