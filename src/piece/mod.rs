mod manager;

pub use manager::PieceManager;

use crate::error::{BittorrentError, Result};
use crate::peer::BlockInfo;
use crate::torrent::PieceHash;

/// Largest block a single request asks for (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Requests kept outstanding per connection while fetching a piece
pub const MAX_BACKLOG: usize = 5;

/// A piece still to be fetched. Owned by whichever worker took it from the
/// queue and handed back on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: usize,
    pub hash: PieceHash,
    pub length: usize,
}

impl PieceWork {
    /// Check assembled bytes against the expected digest.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if data.len() == self.length && self.hash.matches(data) {
            Ok(())
        } else {
            Err(BittorrentError::IntegrityError { index: self.index })
        }
    }
}

/// A verified piece on its way to disk
#[derive(Debug)]
pub struct PieceResult {
    pub index: usize,
    pub data: Vec<u8>,
}

/// Assembly state of one in-flight piece.
///
/// `requested - downloaded` bytes are in flight, one entry of
/// `outstanding` per request behind them.
#[derive(Debug)]
pub struct PieceProgress {
    index: u32,
    buf: Vec<u8>,
    downloaded: usize,
    requested: usize,
    outstanding: Vec<BlockInfo>,
}

impl PieceProgress {
    pub fn new(work: &PieceWork) -> Self {
        Self {
            index: work.index as u32,
            buf: vec![0u8; work.length],
            downloaded: 0,
            requested: 0,
            outstanding: Vec::new(),
        }
    }

    /// The next block to ask for, if the pipeline has room and part of the
    /// piece is still unrequested. Counts it as requested.
    pub fn next_request(&mut self, block_size: u32, max_backlog: usize) -> Option<BlockInfo> {
        if self.outstanding.len() >= max_backlog || self.requested >= self.buf.len() {
            return None;
        }
        let length = (block_size as usize).min(self.buf.len() - self.requested);
        let block = BlockInfo::new(self.index, self.requested as u32, length as u32);
        self.requested += length;
        self.outstanding.push(block);
        Some(block)
    }

    /// Copy a received block into place. Nothing is written unless the
    /// block answers a request still outstanding for this piece.
    pub fn add_block(&mut self, piece_index: u32, offset: u32, data: &[u8]) -> Result<usize> {
        if piece_index != self.index {
            return Err(BittorrentError::ResponseMismatch(format!(
                "expected piece {}, got {}",
                self.index, piece_index
            )));
        }
        let begin = offset as usize;
        if begin >= self.buf.len() {
            return Err(BittorrentError::ResponseMismatch(format!(
                "begin offset {} is past piece length {}",
                begin,
                self.buf.len()
            )));
        }
        if begin + data.len() > self.buf.len() {
            return Err(BittorrentError::ResponseMismatch(format!(
                "{} bytes at offset {} overrun piece length {}",
                data.len(),
                begin,
                self.buf.len()
            )));
        }

        let pending = self
            .outstanding
            .iter()
            .position(|b| b.offset == offset && b.length as usize == data.len())
            .ok_or_else(|| {
                BittorrentError::ResponseMismatch(format!(
                    "{} bytes at offset {} match no outstanding request",
                    data.len(),
                    begin
                ))
            })?;
        self.outstanding.swap_remove(pending);

        self.buf[begin..begin + data.len()].copy_from_slice(data);
        self.downloaded += data.len();
        Ok(data.len())
    }

    pub fn is_done(&self) -> bool {
        self.downloaded >= self.buf.len()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}
