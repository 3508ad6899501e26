use crate::piece::PieceWork;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};

/// Pieces waiting for a worker, shared by every worker.
///
/// Sized up front for every piece, so handing an item back never waits.
pub struct WorkQueue {
    items: Mutex<VecDeque<PieceWork>>,
    available: Notify,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new(items: Vec<PieceWork>) -> Self {
        Self {
            items: Mutex::new(items.into()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append `work` at the back.
    pub async fn push(&self, work: PieceWork) {
        self.items.lock().await.push_back(work);
        self.available.notify_one();
    }

    /// Take the front item, waiting while the queue is empty. `None` once
    /// the queue is closed.
    pub async fn pop(&self) -> Option<PieceWork> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(work) = self.items.lock().await.pop_front() {
                return Some(work);
            }

            notified.await;
        }
    }

    /// Wake every waiting `pop` with `None`; later pops also return `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }
}
