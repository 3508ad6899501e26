use crate::error::{BittorrentError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Opening message of every connection.
/// Format: <pstrlen><pstr><8 reserved><info_hash><peer_id>, 49 + pstrlen bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: Vec<u8>,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: PROTOCOL_STRING.to_vec(),
            info_hash,
            peer_id,
        }
    }

    pub fn encoded_len(&self) -> usize {
        49 + self.protocol.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.protocol.len() as u8);
        buf.extend_from_slice(&self.protocol);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.info_hash);
        buf.extend_from_slice(&self.peer_id);
        buf
    }

    /// Parse a complete handshake. Reserved bytes are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (&pstrlen, rest) = data
            .split_first()
            .ok_or_else(|| BittorrentError::HandshakeError("empty handshake".to_string()))?;
        let pstrlen = pstrlen as usize;
        if pstrlen == 0 {
            return Err(BittorrentError::HandshakeError(
                "protocol name length cannot be 0".to_string(),
            ));
        }
        if rest.len() < pstrlen + 48 {
            return Err(BittorrentError::HandshakeError(format!(
                "handshake is {} bytes, expected {}",
                data.len(),
                pstrlen + 49
            )));
        }

        let (protocol, rest) = rest.split_at(pstrlen);
        let rest = &rest[8..];
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[..20]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[20..40]);

        Ok(Handshake {
            protocol: protocol.to_vec(),
            info_hash,
            peer_id,
        })
    }

    /// Read one handshake from a stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let pstrlen = reader.read_u8().await? as usize;
        if pstrlen == 0 {
            return Err(BittorrentError::HandshakeError(
                "protocol name length cannot be 0".to_string(),
            ));
        }
        let mut buf = vec![0u8; 1 + pstrlen + 48];
        buf[0] = pstrlen as u8;
        reader.read_exact(&mut buf[1..]).await?;
        Self::from_bytes(&buf)
    }

    /// Initiator side: send ours, read theirs, and require the same content
    /// hash. The whole exchange shares one deadline.
    pub async fn initiate<S>(&self, stream: &mut S, limit: Duration) -> Result<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            stream.write_all(&self.to_bytes()).await?;
            let reply = Handshake::read(stream).await?;
            self.check(&reply)?;
            Ok::<_, BittorrentError>(reply)
        };
        timeout(limit, exchange)
            .await
            .map_err(|_| BittorrentError::Timeout("handshake".to_string()))?
    }

    /// Receiver side: read theirs first and only answer if the content hash
    /// is ours.
    pub async fn respond<S>(&self, stream: &mut S, limit: Duration) -> Result<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            let theirs = Handshake::read(stream).await?;
            self.check(&theirs)?;
            stream.write_all(&self.to_bytes()).await?;
            Ok::<_, BittorrentError>(theirs)
        };
        timeout(limit, exchange)
            .await
            .map_err(|_| BittorrentError::Timeout("handshake".to_string()))?
    }

    fn check(&self, other: &Handshake) -> Result<()> {
        if other.info_hash != self.info_hash {
            return Err(BittorrentError::ContentMismatch {
                expected: self.info_hash,
                actual: other.info_hash,
            });
        }
        debug!("Handshake peer id {}", hex::encode(other.peer_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const LIMIT: Duration = Duration::from_secs(30);

    #[test]
    fn test_handshake_serialization() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_custom_protocol_name_and_reserved_bits() {
        let mut handshake = Handshake::new([3u8; 20], [4u8; 20]);
        handshake.protocol = b"xyz".to_vec();
        let mut bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), 52);
        bytes[4] = 0xFF;
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_rejects_zero_length_protocol() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&[0u8; 48]);
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(BittorrentError::HandshakeError(_))
        ));
    }

    #[tokio::test]
    async fn test_initiate_accepts_matching_reply() {
        let ours = Handshake::new([7u8; 20], [1u8; 20]);
        let theirs = Handshake::new([7u8; 20], [9u8; 20]);
        let mut stream = Builder::new()
            .write(&ours.to_bytes())
            .read(&theirs.to_bytes())
            .build();

        let reply = ours.initiate(&mut stream, LIMIT).await.unwrap();
        assert_eq!(reply.peer_id, [9u8; 20]);
    }

    #[tokio::test]
    async fn test_initiate_rejects_other_content() {
        let ours = Handshake::new([7u8; 20], [1u8; 20]);
        let theirs = Handshake::new([8u8; 20], [9u8; 20]);
        let mut stream = Builder::new()
            .write(&ours.to_bytes())
            .read(&theirs.to_bytes())
            .build();

        let err = ours.initiate(&mut stream, LIMIT).await.unwrap_err();
        assert!(matches!(err, BittorrentError::ContentMismatch { .. }));
    }

    #[tokio::test]
    async fn test_respond_does_not_answer_other_content() {
        let ours = Handshake::new([7u8; 20], [1u8; 20]);
        let theirs = Handshake::new([8u8; 20], [9u8; 20]);
        // No write expected: the mock panics if we answer.
        let mut stream = Builder::new().read(&theirs.to_bytes()).build();

        assert!(ours.respond(&mut stream, LIMIT).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiate_times_out() {
        let ours = Handshake::new([7u8; 20], [1u8; 20]);
        let mut stream = Builder::new()
            .write(&ours.to_bytes())
            .wait(Duration::from_secs(60))
            .build();

        let err = ours.initiate(&mut stream, LIMIT).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }
}
