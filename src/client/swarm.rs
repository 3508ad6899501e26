use crate::peer::Bitfield;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// What the live sessions of one transfer can supply.
///
/// Lets a worker tell "my peer lacks this piece" apart from "nobody has it
/// and nobody else is still connecting".
pub struct Swarm {
    inner: Mutex<SwarmState>,
}

struct SwarmState {
    connecting: usize,
    sessions: HashMap<usize, Bitfield>,
}

impl Swarm {
    /// `connecting` workers have yet to report in via `join` or `abandon`.
    pub fn new(connecting: usize) -> Self {
        Self {
            inner: Mutex::new(SwarmState {
                connecting,
                sessions: HashMap::new(),
            }),
        }
    }

    pub async fn join(&self, worker: usize, bitfield: Bitfield) {
        let mut state = self.inner.lock().await;
        state.connecting = state.connecting.saturating_sub(1);
        state.sessions.insert(worker, bitfield);
    }

    /// A worker failed to establish its session.
    pub async fn abandon(&self) {
        let mut state = self.inner.lock().await;
        state.connecting = state.connecting.saturating_sub(1);
    }

    /// Replace a live session's availability after it announced new pieces.
    pub async fn update(&self, worker: usize, bitfield: Bitfield) {
        if let Some(entry) = self.inner.lock().await.sessions.get_mut(&worker) {
            *entry = bitfield;
        }
    }

    pub async fn leave(&self, worker: usize) {
        self.inner.lock().await.sessions.remove(&worker);
    }

    /// No session has `index` and none can still appear.
    pub async fn is_unreachable(&self, index: usize) -> bool {
        let state = self.inner.lock().await;
        state.connecting == 0 && !state.sessions.values().any(|b| b.has_piece(index))
    }
}
