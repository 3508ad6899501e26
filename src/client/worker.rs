use super::{ClientConfig, Swarm, WorkQueue};
use crate::error::{BittorrentError, Result};
use crate::peer::{PeerMessage, PeerSession};
use crate::piece::{PieceProgress, PieceResult, PieceWork};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// What a worker reports to the coordinator.
#[derive(Debug)]
pub enum WorkerEvent {
    Piece(PieceResult),
    /// A queued piece that no live or pending session can supply.
    Unavailable { index: usize },
}

/// Downloads pieces from one peer for as long as its session stays healthy.
pub struct Worker {
    pub id: usize,
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub num_pieces: usize,
    pub config: Arc<ClientConfig>,
    pub queue: Arc<WorkQueue>,
    pub swarm: Arc<Swarm>,
    pub events: mpsc::Sender<WorkerEvent>,
}

impl Worker {
    /// Open the session, then take work until the queue closes or the
    /// session fails. A peer that fails is not retried.
    pub async fn run(self) {
        let opened = PeerSession::open(
            self.addr,
            self.info_hash,
            self.config.peer_id,
            self.num_pieces,
            &self.config.timeouts,
        )
        .await;

        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not open session with {}: {}", self.addr, e);
                self.swarm.abandon().await;
                return;
            }
        };

        debug!(
            "Peer {} identifies as {}",
            self.addr,
            String::from_utf8_lossy(session.peer_id())
        );
        self.swarm.join(self.id, session.bitfield().clone()).await;
        let outcome = self.fetch_pieces(&mut session).await;
        self.swarm.leave(self.id).await;

        match outcome {
            Ok(()) => {
                debug!("Worker for {} finished", self.addr);
                if session.state().am_interested {
                    let _ = session.send_not_interested().await;
                }
            }
            Err(e) if e.is_timeout() => warn!("Peer {} stalled, disconnecting: {}", self.addr, e),
            Err(e) => warn!("Disconnecting from {}: {}", self.addr, e),
        }
    }

    async fn fetch_pieces(&self, session: &mut PeerSession) -> Result<()> {
        session.send_unchoke().await?;
        session.send_interested().await?;
        let mut known = session.bitfield().count();

        while let Some(work) = self.queue.pop().await {
            if !session.has_piece(work.index) {
                // `have` frames may have arrived since the last read.
                if let Err(e) = session.drain_ready().await {
                    self.queue.push(work).await;
                    return Err(e);
                }
                if session.bitfield().count() != known {
                    known = session.bitfield().count();
                    self.swarm.update(self.id, session.bitfield().clone()).await;
                }
            }

            if !session.has_piece(work.index) {
                let index = work.index;
                self.queue.push(work).await;
                if self.swarm.is_unreachable(index).await {
                    let _ = self.events.send(WorkerEvent::Unavailable { index }).await;
                    return Ok(());
                }
                tokio::time::sleep(self.config.requeue_backoff).await;
                continue;
            }

            let attempt = attempt_piece(session, &work, &self.config).await;

            if session.bitfield().count() != known {
                known = session.bitfield().count();
                self.swarm.update(self.id, session.bitfield().clone()).await;
            }

            let data = match attempt {
                Ok(data) => data,
                Err(e) => {
                    // The connection is no longer trusted; give the piece to
                    // someone else and stop.
                    self.queue.push(work).await;
                    return Err(e);
                }
            };

            if let Err(e) = work.verify(&data) {
                warn!("{} from {}", e, self.addr);
                self.queue.push(work).await;
                continue;
            }

            info!("Piece {} downloaded from {}", work.index, self.addr);
            let result = PieceResult {
                index: work.index,
                data,
            };
            if self.events.send(WorkerEvent::Piece(result)).await.is_err() {
                return Ok(());
            }

            if self.config.announce_have {
                session.send_have(work.index as u32).await?;
            }
        }

        Ok(())
    }
}

/// Fetch every block of one piece over `session`, keeping up to
/// `max_backlog` requests outstanding. The whole fetch shares one deadline.
///
/// The returned bytes are not yet verified.
pub async fn attempt_piece(
    session: &mut PeerSession,
    work: &PieceWork,
    config: &ClientConfig,
) -> Result<Vec<u8>> {
    let mut progress = PieceProgress::new(work);

    let fetch = async {
        while !progress.is_done() {
            if !session.is_choked() {
                while let Some(block) = progress.next_request(config.block_size, config.max_backlog) {
                    session
                        .request(block.piece_index, block.offset, block.length)
                        .await?;
                }
            }

            if let PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } = session.read().await?
            {
                progress.add_block(piece_index, offset, &data)?;
            }
        }
        Ok::<_, BittorrentError>(())
    };

    timeout(config.piece_timeout, fetch)
        .await
        .map_err(|_| BittorrentError::Timeout(format!("piece {}", work.index)))??;

    Ok(progress.into_data())
}
