//! Querying a single peer

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::manager::Peer;
use super::{PeerHealthResponse, PeerResponse};
use crate::error::{Error, Result};

/// Transport for one peer health query
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask `peer` whether `node_name` is unhealthy
    async fn query(&self, peer: &Peer, node_name: &str) -> Result<PeerResponse>;
}

/// Peer client speaking JSON over HTTP to the agent's peer server
pub struct HttpPeerClient {
    http: reqwest::Client,
    port: u16,
}

impl HttpPeerClient {
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout)
            .user_agent(concat!("self-fence/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http, port })
    }

    fn url(&self, peer: &Peer, node_name: &str) -> String {
        let host = if peer.address.contains(':') {
            format!("[{}]", peer.address)
        } else {
            peer.address.clone()
        };
        format!("http://{}:{}/peer-health/{}", host, self.port, node_name)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn query(&self, peer: &Peer, node_name: &str) -> Result<PeerResponse> {
        let url = self.url(peer, node_name);
        debug!("Querying peer {} at {}", peer.name, url);

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::PeerError(format!(
                "peer {} returned status {}",
                peer.name,
                response.status()
            )));
        }
        let body: PeerHealthResponse = response.json().await?;
        Ok(body.status.into())
    }
}
