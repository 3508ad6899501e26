use super::PieceWork;
use crate::error::{BittorrentError, Result};
use crate::peer::Bitfield;
use crate::storage::PositionalFile;
use crate::torrent::TorrentInfo;
use tracing::{debug, info};

/// Completion bookkeeping for one transfer: which pieces are verified on
/// disk and how many.
pub struct PieceManager {
    info: TorrentInfo,
    completed: Bitfield,
}

impl PieceManager {
    pub fn new(info: &TorrentInfo) -> Self {
        Self {
            info: info.clone(),
            completed: Bitfield::new(info.num_pieces()),
        }
    }

    pub fn work_item(&self, index: usize) -> Result<PieceWork> {
        let hash = *self
            .info
            .pieces
            .get(index)
            .ok_or_else(|| BittorrentError::StorageError(format!("no piece {}", index)))?;
        Ok(PieceWork {
            index,
            hash,
            length: self.info.piece_size(index) as usize,
        })
    }

    /// Hash every piece range of `file` and mark the ones that already match.
    /// Returns the rest, in index order, as work to fetch.
    pub async fn resume<F: PositionalFile>(&mut self, file: &mut F) -> Result<Vec<PieceWork>> {
        let mut work = Vec::new();

        for index in 0..self.info.num_pieces() {
            let item = self.work_item(index)?;
            let data = file.read_at(self.info.piece_offset(index), item.length).await?;

            if item.verify(&data).is_ok() {
                self.completed.set_piece(index);
            } else {
                debug!("Piece {} missing or corrupt on disk", index);
                work.push(item);
            }
        }

        if self.complete_count() > 0 {
            info!(
                "Download is resuming from {:.0}% ({}/{} pieces present)",
                self.progress(),
                self.complete_count(),
                self.piece_count()
            );
        }

        Ok(work)
    }

    /// Record a piece as written. Returns false if it already was.
    pub fn mark_complete(&mut self, index: usize) -> bool {
        if self.completed.has_piece(index) {
            return false;
        }
        self.completed.set_piece(index);
        true
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.completed.has_piece(index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.completed
    }

    pub fn piece_count(&self) -> usize {
        self.info.num_pieces()
    }

    pub fn complete_count(&self) -> usize {
        self.completed.count()
    }

    pub fn remaining(&self) -> usize {
        self.piece_count() - self.complete_count()
    }

    pub fn progress(&self) -> f64 {
        (self.complete_count() as f64 / self.piece_count() as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.completed.is_complete()
    }
}
