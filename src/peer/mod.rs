mod bitfield;
mod message;
mod protocol;
mod session;

pub use bitfield::Bitfield;
pub use message::{read_message, write_message, BlockInfo, PeerMessage};
pub use protocol::Handshake;
pub use session::PeerSession;

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

/// Choke/interest flags of one connection, from both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Bounds on the blocking steps of opening a session.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    /// Covers sending ours and reading theirs
    pub handshake: Duration,
    /// Wait for the first frame after the handshake
    pub bitfield: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(30),
            bitfield: Duration::from_secs(5),
        }
    }
}

/// Generate a random peer ID
/// Format: -LE0001-<12 random alphanumerics>
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-LE0001-");

    let rng = rand::thread_rng();
    for (slot, byte) in peer_id[8..].iter_mut().zip(rng.sample_iter(Alphanumeric)) {
        *slot = byte;
    }

    peer_id
}
