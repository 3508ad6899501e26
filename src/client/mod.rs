mod queue;
mod swarm;
mod worker;

pub use queue::WorkQueue;
pub use swarm::Swarm;
pub use worker::{Worker, WorkerEvent};

use crate::discovery::PeerSource;
use crate::error::{BittorrentError, Result};
use crate::peer::{generate_peer_id, Timeouts};
use crate::piece::{PieceManager, BLOCK_SIZE, MAX_BACKLOG};
use crate::storage::{PositionalFile, StorageManager};
use crate::torrent::Metainfo;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: [u8; 20],
    /// Port reported to trackers
    pub listen_port: u16,
    pub timeouts: Timeouts,
    /// Deadline for fetching one whole piece
    pub piece_timeout: Duration,
    pub block_size: u32,
    pub max_backlog: usize,
    /// Pause after handing back a piece the peer does not have
    pub requeue_backoff: Duration,
    /// Send `have` to the peer a piece came from
    pub announce_have: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            listen_port: 6881,
            timeouts: Timeouts::default(),
            piece_timeout: Duration::from_secs(20),
            block_size: BLOCK_SIZE,
            max_backlog: MAX_BACKLOG,
            requeue_backoff: Duration::from_millis(10),
            announce_have: false,
        }
    }
}

/// Pieces verified on disk out of the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }
}

/// How a finished transfer was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub total: usize,
    /// Pieces that already validated on disk
    pub resumed: usize,
    /// Pieces fetched from peers
    pub fetched: usize,
}

/// Main BitTorrent client
pub struct TorrentClient {
    config: Arc<ClientConfig>,
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        info!("Client initialized with peer_id: {}", hex::encode(config.peer_id));
        let (progress, _) = watch::channel(Progress::default());

        Self {
            config: Arc::new(config),
            progress,
            cancel: CancellationToken::new(),
        }
    }

    /// Progress updates, starting from the latest value.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Cancelling this token aborts a running `download`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Download into `path`, resuming from whatever valid pieces it holds.
    pub async fn download_to<S, P>(&self, meta: &Metainfo, peers: &S, path: P) -> Result<TransferSummary>
    where
        S: PeerSource,
        P: AsRef<Path>,
    {
        let mut storage = StorageManager::create(path, meta.info.total_length).await?;
        self.download(meta, peers, &mut storage).await
    }

    /// Run one transfer into `file`.
    ///
    /// Pieces already valid in `file` are kept; peers are only asked for if
    /// something is missing. One worker runs per peer while this task
    /// writes finished pieces. Per-peer failures are absorbed; a write
    /// failure, an unobtainable piece, or losing every peer ends the
    /// transfer with an error.
    pub async fn download<S, F>(&self, meta: &Metainfo, peers: &S, file: &mut F) -> Result<TransferSummary>
    where
        S: PeerSource,
        F: PositionalFile,
    {
        let info = &meta.info;
        info!("Starting download for {} ({} bytes, {} pieces)", info.name, info.total_length, info.num_pieces());

        let mut manager = PieceManager::new(info);
        let work = manager.resume(file).await?;
        let resumed = manager.complete_count();
        self.publish(&manager);

        let mut summary = TransferSummary {
            total: manager.piece_count(),
            resumed,
            fetched: 0,
        };
        if work.is_empty() {
            info!("All {} pieces already present", summary.total);
            return Ok(summary);
        }

        let addrs = tokio::select! {
            _ = self.cancel.cancelled() => return Err(BittorrentError::Cancelled),
            addrs = peers.peers() => addrs?,
        };
        if addrs.is_empty() {
            return Err(BittorrentError::PeersExhausted {
                remaining: manager.remaining(),
            });
        }
        info!("Connecting to {} peers for {} pieces", addrs.len(), work.len());

        let queue = Arc::new(WorkQueue::new(work));
        let swarm = Arc::new(Swarm::new(addrs.len()));
        let (events_tx, mut events) = mpsc::channel(addrs.len());
        let stop_workers = self.cancel.child_token();
        let mut workers = JoinSet::new();

        for (id, addr) in addrs.into_iter().enumerate() {
            let worker = Worker {
                id,
                addr,
                info_hash: meta.info_hash,
                num_pieces: info.num_pieces(),
                config: self.config.clone(),
                queue: queue.clone(),
                swarm: swarm.clone(),
                events: events_tx.clone(),
            };
            let stop = stop_workers.clone();
            workers.spawn(
                async move {
                    tokio::select! {
                        _ = stop.cancelled() => {}
                        _ = worker.run() => {}
                    }
                }
                .instrument(info_span!("worker", peer = %addr)),
            );
        }
        // Workers hold the only senders, so the channel closes when the
        // last of them exits.
        drop(events_tx);

        let outcome = loop {
            if manager.is_complete() {
                break Ok(());
            }

            let event = tokio::select! {
                _ = self.cancel.cancelled() => break Err(BittorrentError::Cancelled),
                event = events.recv() => event,
            };

            match event {
                None => {
                    break Err(BittorrentError::PeersExhausted {
                        remaining: manager.remaining(),
                    })
                }
                Some(WorkerEvent::Unavailable { index }) => {
                    break Err(BittorrentError::PieceUnavailable { index })
                }
                Some(WorkerEvent::Piece(piece)) => {
                    if manager.has_piece(piece.index) {
                        warn!("Dropping duplicate piece {}", piece.index);
                        continue;
                    }
                    let offset = info.piece_offset(piece.index);
                    if let Err(e) = file.write_at(offset, &piece.data).await {
                        break Err(e);
                    }
                    manager.mark_complete(piece.index);
                    summary.fetched += 1;
                    self.publish(&manager);
                    info!(
                        "Piece {} written ({}/{}, {:.2}%)",
                        piece.index,
                        manager.complete_count(),
                        manager.piece_count(),
                        manager.progress()
                    );
                }
            }
        };

        queue.close();
        stop_workers.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Worker task failed: {}", e);
            }
        }

        match outcome {
            Ok(()) => {
                file.flush().await?;
                info!("Download finished: {}", info.name);
                Ok(summary)
            }
            Err(e) => {
                error!("Download failed: {}", e);
                Err(e)
            }
        }
    }

    fn publish(&self, manager: &PieceManager) {
        self.progress.send_replace(Progress {
            completed: manager.complete_count(),
            total: manager.piece_count(),
        });
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests;
