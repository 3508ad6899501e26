use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted: a full block plus the piece header, with
/// room for big bitfields.
pub const MAX_FRAME_LENGTH: usize = (1 << 20) + 13;

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame, no effect
    KeepAlive,
    Bitfield { bitfield: Vec<u8> },
    Request { block: BlockInfo },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    /// A kind byte outside the table below; carried through so callers can
    /// skip it.
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    // Message kind bytes. Both the downloading and the serving side go
    // through this table.
    pub const BITFIELD: u8 = 0;
    pub const REQUEST: u8 = 1;
    pub const PIECE: u8 = 2;
    pub const CHOKE: u8 = 3;
    pub const UNCHOKE: u8 = 4;
    pub const INTERESTED: u8 = 5;
    pub const NOT_INTERESTED: u8 = 6;
    pub const HAVE: u8 = 7;

    /// Kind byte, or `None` for keep-alive.
    pub fn id(&self) -> Option<u8> {
        Some(match self {
            PeerMessage::KeepAlive => return None,
            PeerMessage::Bitfield { .. } => Self::BITFIELD,
            PeerMessage::Request { .. } => Self::REQUEST,
            PeerMessage::Piece { .. } => Self::PIECE,
            PeerMessage::Choke => Self::CHOKE,
            PeerMessage::Unchoke => Self::UNCHOKE,
            PeerMessage::Interested => Self::INTERESTED,
            PeerMessage::NotInterested => Self::NOT_INTERESTED,
            PeerMessage::Have { .. } => Self::HAVE,
            PeerMessage::Unknown { id, .. } => *id,
        })
    }

    /// Serialize to `<u32 length><kind><payload>`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        match self {
            PeerMessage::KeepAlive => return vec![0; 4],
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {}
            PeerMessage::Have { piece_index } => payload.put_u32(*piece_index),
            PeerMessage::Bitfield { bitfield } => payload.put_slice(bitfield),
            PeerMessage::Request { block } => {
                payload.put_u32(block.piece_index);
                payload.put_u32(block.offset);
                payload.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                payload.put_u32(*piece_index);
                payload.put_u32(*offset);
                payload.put_slice(data);
            }
            PeerMessage::Unknown { payload: raw, .. } => payload.put_slice(raw),
        }

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u32(1 + payload.len() as u32);
        buf.put_u8(self.id().unwrap_or_default());
        buf.put_slice(&payload);
        buf.to_vec()
    }

    /// Parse a frame body: the bytes following the length prefix. An empty
    /// body is a keep-alive.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let Some((&id, mut payload)) = body.split_first() else {
            return Ok(PeerMessage::KeepAlive);
        };

        let expect_len = |name: &str, want: usize, payload: &[u8]| {
            if payload.len() == want {
                Ok(())
            } else {
                Err(BittorrentError::MalformedFrame(format!(
                    "{} payload is {} bytes, expected {}",
                    name,
                    payload.len(),
                    want
                )))
            }
        };

        let message = match id {
            Self::BITFIELD => PeerMessage::Bitfield {
                bitfield: payload.to_vec(),
            },
            Self::REQUEST => {
                expect_len("request", 12, payload)?;
                PeerMessage::Request {
                    block: BlockInfo::new(payload.get_u32(), payload.get_u32(), payload.get_u32()),
                }
            }
            Self::PIECE => {
                if payload.len() < 8 {
                    return Err(BittorrentError::MalformedFrame(format!(
                        "piece payload is {} bytes, expected at least 8",
                        payload.len()
                    )));
                }
                PeerMessage::Piece {
                    piece_index: payload.get_u32(),
                    offset: payload.get_u32(),
                    data: payload.to_vec(),
                }
            }
            Self::CHOKE => PeerMessage::Choke,
            Self::UNCHOKE => PeerMessage::Unchoke,
            Self::INTERESTED => PeerMessage::Interested,
            Self::NOT_INTERESTED => PeerMessage::NotInterested,
            Self::HAVE => {
                expect_len("have", 4, payload)?;
                PeerMessage::Have {
                    piece_index: payload.get_u32(),
                }
            }
            id => PeerMessage::Unknown {
                id,
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }

    /// Parse one complete frame including its length prefix.
    #[cfg(test)]
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(BittorrentError::MalformedFrame(
                "missing length prefix".to_string(),
            ));
        }
        let length = data.get_u32() as usize;
        if data.len() < length {
            return Err(BittorrentError::MalformedFrame(format!(
                "declared {} bytes, have {}",
                length,
                data.len()
            )));
        }
        Self::from_body(&data[..length])
    }
}

/// Read exactly one frame from `reader`.
///
/// The length prefix is read first; a stream that ends inside the declared
/// body is a `MalformedFrame`, while one that ends before the prefix surfaces
/// as the underlying I/O error.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PeerMessage> {
    let length = reader.read_u32().await? as usize;
    if length == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if length > MAX_FRAME_LENGTH {
        return Err(BittorrentError::MalformedFrame(format!(
            "frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_LENGTH
        )));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BittorrentError::MalformedFrame(format!("stream ended inside a {} byte frame", length))
        } else {
            e.into()
        }
    })?;

    PeerMessage::from_body(&body)
}

/// Serialize `message` and write it as a single frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &PeerMessage) -> Result<()> {
    writer.write_all(&message.to_bytes()).await?;
    Ok(())
}
