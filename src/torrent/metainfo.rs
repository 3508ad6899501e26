use super::Pieces;
use crate::bencode::{encode, BencodeValue};
use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};
#[cfg(test)]
use std::collections::BTreeMap;

fn invalid(msg: impl Into<String>) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.into())
}

/// The content being transferred: one file split into fixed-size pieces.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Suggested output file name
    pub name: String,
    /// Bytes per piece; only the last piece may be shorter
    pub piece_length: u64,
    /// Expected digest of every piece
    pub pieces: Pieces,
    /// Total file length
    pub total_length: u64,
}

impl TorrentInfo {
    /// Build a descriptor, checking that the piece count covers `total_length`
    /// exactly and the last piece is non-empty.
    pub fn new(name: String, piece_length: u64, total_length: u64, pieces: Pieces) -> Result<Self> {
        if piece_length == 0 {
            return Err(invalid("'piece length' must be positive"));
        }
        if total_length == 0 {
            return Err(invalid("'length' must be positive"));
        }
        let expected = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            return Err(invalid(format!(
                "{} piece hashes for {} bytes at {} bytes per piece (expected {})",
                pieces.len(),
                total_length,
                piece_length,
                expected
            )));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            total_length,
        })
    }

    fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(invalid("Info must be a dict"));
        }
        if value.get("files").is_some() {
            return Err(invalid("multi-file torrents are not supported"));
        }

        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("Missing 'name' field"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_integer())
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| invalid("Missing or negative 'piece length' field"))?;

        let total_length = value
            .get("length")
            .and_then(|v| v.as_integer())
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| invalid("Missing or negative 'length' field"))?;

        let pieces = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| invalid("Missing 'pieces' field"))
            .and_then(Pieces::from_bytes)?;

        Self::new(name, piece_length, total_length, pieces)
    }

    /// Canonical bencoded form of this info dictionary.
    #[cfg(test)]
    pub fn to_bencode(&self) -> BencodeValue {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"length".to_vec(),
            BencodeValue::Integer(self.total_length as i64),
        );
        dict.insert(b"name".to_vec(), BencodeValue::String(self.name.clone().into_bytes()));
        dict.insert(
            b"piece length".to_vec(),
            BencodeValue::Integer(self.piece_length as i64),
        );
        dict.insert(b"pieces".to_vec(), BencodeValue::String(self.pieces.to_bytes()));
        BencodeValue::Dict(dict)
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Byte offset of piece `index` within the file.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    /// Length of piece `index`: `piece_length` except for the last piece,
    /// which holds the remainder.
    pub fn piece_size(&self, index: usize) -> u64 {
        let begin = self.piece_offset(index);
        let end = (begin + self.piece_length).min(self.total_length);
        end.saturating_sub(begin)
    }
}

/// A parsed descriptor file
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker announce URL
    pub announce: String,
    pub info: TorrentInfo,
    /// SHA1 of the canonical bencoding of the info dictionary
    pub info_hash: [u8; 20],
}

impl Metainfo {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(invalid("Torrent must be a dict"));
        }

        let announce = value
            .get("announce")
            .and_then(|v| v.as_str())
            .ok_or_else(|| invalid("Missing 'announce' field"))?
            .to_string();

        let info_value = value
            .get("info")
            .ok_or_else(|| invalid("Missing 'info' field"))?;
        let info = TorrentInfo::from_bencode(info_value)?;
        let info_hash = Sha1::digest(encode(info_value)).into();

        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    /// Assemble a descriptor in memory; the content hash is derived from `info`.
    #[cfg(test)]
    pub fn new(announce: String, info: TorrentInfo) -> Self {
        let info_hash = Sha1::digest(encode(&info.to_bencode())).into();
        Self {
            announce,
            info,
            info_hash,
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Serialize back to a descriptor file.
    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(
            b"announce".to_vec(),
            BencodeValue::String(self.announce.clone().into_bytes()),
        );
        dict.insert(b"info".to_vec(), self.info.to_bencode());
        encode(&BencodeValue::Dict(dict))
    }
}
