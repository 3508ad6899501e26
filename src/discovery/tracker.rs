use super::PeerSource;
use crate::bencode::{decode, BencodeValue};
use crate::error::{BittorrentError, Result};
use crate::torrent::Metainfo;
use reqwest::Client;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info};
use url::{form_urlencoded, Url};

/// Parameters of one `started` announce.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes still missing
    pub left: u64,
}

impl AnnounceRequest {
    /// Build the announce URL. Hashes are raw bytes and are percent-encoded
    /// byte by byte.
    pub fn to_url(&self, announce: &str) -> Result<Url> {
        let mut url = Url::parse(announce)?;

        let mut query = url.query().map(|q| format!("{}&", q)).unwrap_or_default();
        query.push_str(&format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event=started",
            form_urlencoded::byte_serialize(&self.info_hash).collect::<String>(),
            form_urlencoded::byte_serialize(&self.peer_id).collect::<String>(),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        ));
        url.set_query(Some(&query));

        Ok(url)
    }
}

/// Decoded announce reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds to wait before announcing again
    pub interval: u64,
    pub peers: Vec<SocketAddr>,
}

impl TrackerResponse {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(BittorrentError::TrackerError("response must be a dict".to_string()));
        }

        if let Some(failure) = value.get("failure reason") {
            let reason = failure.as_str().unwrap_or("unknown failure").to_string();
            return Err(BittorrentError::TrackerError(reason));
        }

        let interval = value
            .get("interval")
            .and_then(BencodeValue::as_integer)
            .ok_or_else(|| BittorrentError::TrackerError("missing 'interval' field".to_string()))?;

        let peers = match value.get("peers") {
            Some(BencodeValue::String(compact)) => parse_compact(compact)?,
            Some(BencodeValue::List(list)) => parse_peer_list(list)?,
            Some(_) => return Err(BittorrentError::TrackerError("invalid 'peers' format".to_string())),
            None => return Err(BittorrentError::TrackerError("missing 'peers' field".to_string())),
        };

        Ok(Self {
            interval: interval.max(0) as u64,
            peers,
        })
    }
}

/// 6 bytes per peer: IPv4 address then port, both big-endian.
fn parse_compact(data: &[u8]) -> Result<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(BittorrentError::TrackerError(format!(
            "compact peer list of {} bytes is not a multiple of 6",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .collect())
}

fn parse_peer_list(list: &[BencodeValue]) -> Result<Vec<SocketAddr>> {
    list.iter()
        .map(|peer| {
            let ip: IpAddr = peer
                .get("ip")
                .and_then(BencodeValue::as_str)
                .ok_or_else(|| BittorrentError::TrackerError("missing peer 'ip'".to_string()))?
                .parse()
                .map_err(|_| BittorrentError::TrackerError("invalid peer IP address".to_string()))?;

            let port = peer
                .get("port")
                .and_then(BencodeValue::as_integer)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| BittorrentError::TrackerError("missing or invalid peer 'port'".to_string()))?;

            Ok(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Asks the descriptor's HTTP tracker for peers.
pub struct HttpTracker {
    client: Client,
    announce: String,
    request: AnnounceRequest,
}

impl HttpTracker {
    pub fn new(announce: String, request: AnnounceRequest) -> Self {
        Self {
            client: Client::new(),
            announce,
            request,
        }
    }

    /// Announce for `meta` as a fresh download.
    pub fn for_torrent(meta: &Metainfo, peer_id: [u8; 20], port: u16) -> Self {
        Self::new(
            meta.announce.clone(),
            AnnounceRequest {
                info_hash: meta.info_hash,
                peer_id,
                port,
                uploaded: 0,
                downloaded: 0,
                left: meta.info.total_length,
            },
        )
    }

    pub async fn announce(&self) -> Result<TrackerResponse> {
        info!("Announcing to tracker: {}", self.announce);
        let url = self.request.to_url(&self.announce)?;
        debug!("Tracker request URL: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!("Tracker response status: {}, body length: {}", status, body.len());

        if !status.is_success() {
            return Err(BittorrentError::TrackerError(format!("HTTP error: {}", status)));
        }

        let reply = TrackerResponse::from_bencode(&decode(&body)?)?;
        info!(
            "Received {} peers from tracker (interval: {}s)",
            reply.peers.len(),
            reply.interval
        );
        Ok(reply)
    }
}

impl PeerSource for HttpTracker {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.announce().await?.peers)
    }
}
