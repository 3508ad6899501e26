mod tracker;

pub use tracker::HttpTracker;

use crate::error::Result;
use std::future::Future;
use std::net::SocketAddr;

/// Where the endpoints of a transfer come from.
pub trait PeerSource {
    fn peers(&self) -> impl Future<Output = Result<Vec<SocketAddr>>> + Send;
}

/// A fixed list of endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers(pub Vec<SocketAddr>);

impl PeerSource for StaticPeers {
    async fn peers(&self) -> Result<Vec<SocketAddr>> {
        Ok(self.0.clone())
    }
}
