use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    #[error("Failed to connect to {addr}: {source}")]
    ConnectError {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Content hash mismatch: expected {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    ContentMismatch { expected: [u8; 20], actual: [u8; 20] },

    #[error("Timed out during {0}")]
    Timeout(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Piece response mismatch: {0}")]
    ResponseMismatch(String),

    #[error("Piece {index} failed integrity check")]
    IntegrityError { index: usize },

    #[error("No connected peer has piece {index}")]
    PieceUnavailable { index: usize },

    #[error("All peers disconnected with {remaining} pieces remaining")]
    PeersExhausted { remaining: usize },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl BittorrentError {
    /// Whether this error is a deadline expiry, either ours or the socket's.
    pub fn is_timeout(&self) -> bool {
        match self {
            BittorrentError::Timeout(_) => true,
            BittorrentError::IoError(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
