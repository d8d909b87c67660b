//! Peer discovery and quorum rounds

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{api::Api, Client, ResourceExt};
use rand::seq::SliceRandom;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::client::PeerClient;
use super::{aggregate, decisive, HealthCheckResult, PeerHealth, PeerResponse, PeerVerdict};
use crate::error::{Error, Result};
use crate::metrics;

/// A node we can ask about ourselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub address: String,
}

/// Peer manager settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub my_node_name: String,
    /// How often the peer list is refreshed from the node list
    pub update_interval: Duration,
    /// Deadline for one quorum round, and for each query in it
    pub request_timeout: Duration,
    /// Upper bound on peers asked per round
    pub max_peers_to_query: usize,
}

/// Where peers come from
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// Lists cluster nodes through the API server
pub struct KubePeerSource {
    client: Client,
    timeout: Duration,
}

impl KubePeerSource {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl PeerSource for KubePeerSource {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = tokio::time::timeout(self.timeout, api.list(&Default::default()))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Error::KubeError)?;
        Ok(nodes.items)
    }
}

/// Build the peer list from nodes, skipping ourselves and nodes without an
/// internal address
pub fn peers_from_nodes(nodes: &[Node], my_node_name: &str) -> Vec<Peer> {
    nodes
        .iter()
        .filter(|node| node.name_any() != my_node_name)
        .filter_map(|node| {
            let addresses = node.status.as_ref()?.addresses.as_ref()?;
            let address = addresses
                .iter()
                .find(|a| a.type_ == "InternalIP")
                .or_else(|| addresses.first())?;
            Some(Peer {
                name: node.name_any(),
                address: address.address.clone(),
            })
        })
        .collect()
}

/// Owns the peer set and runs quorum rounds against it
pub struct PeerManager {
    config: PeerConfig,
    source: Arc<dyn PeerSource>,
    client: Arc<dyn PeerClient>,
    /// None until the first successful refresh
    peers: RwLock<Option<Vec<Peer>>>,
}

impl PeerManager {
    pub fn new(config: PeerConfig, source: Arc<dyn PeerSource>, client: Arc<dyn PeerClient>) -> Self {
        Self {
            config,
            source,
            client,
            peers: RwLock::new(None),
        }
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.read().await.clone().unwrap_or_default()
    }

    /// Reload the peer set. On failure the previous set is kept.
    pub async fn refresh(&self) -> Result<()> {
        let nodes = self.source.list_nodes().await?;
        let peers = peers_from_nodes(&nodes, &self.config.my_node_name);
        if peers.is_empty() {
            warn!("No peers available, quorum rounds will be indeterminate");
        } else {
            debug!("Peer list updated: {} peers", peers.len());
        }
        *self.peers.write().await = Some(peers);
        Ok(())
    }

    /// Refresh the peer set on `update_interval` until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.update_interval);
        info!(
            interval_secs = self.config.update_interval.as_secs(),
            "Starting peer refresh loop"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Failed to refresh peers, keeping previous list: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Peer refresh loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    fn sample(&self, mut peers: Vec<Peer>) -> Vec<Peer> {
        let mut rng = rand::rng();
        peers.shuffle(&mut rng);
        peers.truncate(self.config.max_peers_to_query.max(1));
        peers
    }

    /// Run one quorum round for `node_name`
    pub async fn verdict(&self, node_name: &str) -> PeerVerdict {
        let peers = self.peers().await;
        if peers.is_empty() {
            info!("Peers list is empty, nothing to ask");
            return PeerVerdict::Indeterminate;
        }

        let sample = self.sample(peers);
        let sample_size = sample.len();
        let timeout = self.config.request_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut pending: FuturesUnordered<_> = sample
            .iter()
            .map(|peer| {
                let client = Arc::clone(&self.client);
                async move {
                    let response = match tokio::time::timeout(timeout, client.query(peer, node_name)).await {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => {
                            debug!("Peer {} failed to answer: {}", peer.name, e);
                            PeerResponse::NoResponse
                        }
                        Err(_) => {
                            debug!("Peer {} timed out", peer.name);
                            PeerResponse::NoResponse
                        }
                    };
                    (peer.name.clone(), response)
                }
            })
            .collect();

        let mut responses = Vec::with_capacity(sample_size);
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((peer, response))) => {
                    debug!("Peer {} answered {:?}", peer, response);
                    responses.push(response);
                    if let Some(verdict) = decisive(&responses) {
                        return verdict;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        "Quorum deadline reached with {}/{} answers",
                        responses.len(),
                        sample_size
                    );
                    break;
                }
            }
        }

        aggregate(&responses)
    }
}

#[async_trait]
impl PeerHealth for PeerManager {
    async fn is_healthy(&self, node_name: &str) -> HealthCheckResult {
        let verdict = self.verdict(node_name).await;
        metrics::inc_peer_verdict(node_name, verdict.as_str());
        match verdict {
            PeerVerdict::Unhealthy => warn!("Peers report node {} is unhealthy", node_name),
            PeerVerdict::Healthy => info!("Peer told me I'm healthy."),
            PeerVerdict::ApiServerUnreachable => {
                warn!("Peers report that nodes couldn't access the api-server")
            }
            PeerVerdict::Indeterminate => {
                info!("No decisive peer answer, considering node {} healthy", node_name)
            }
        }
        verdict.into_health_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn node(name: &str, ip: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: ip.map(|ip| NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: name.to_string(),
                    },
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: ip.to_string(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    struct StaticSource(Mutex<Result<Vec<Node>, String>>);

    #[async_trait]
    impl PeerSource for StaticSource {
        async fn list_nodes(&self) -> Result<Vec<Node>> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .map_err(Error::PeerError)
        }
    }

    /// Answers per peer name; peers missing from the map never answer
    struct ScriptedClient {
        answers: HashMap<String, Result<PeerResponse, String>>,
        delays: HashMap<String, Duration>,
        queried: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(answers: &[(&str, Result<PeerResponse, String>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                delays: HashMap::new(),
                queried: Mutex::new(vec![]),
            }
        }

        fn with_delay(mut self, peer: &str, delay: Duration) -> Self {
            self.delays.insert(peer.to_string(), delay);
            self
        }
    }

    #[async_trait]
    impl PeerClient for ScriptedClient {
        async fn query(&self, peer: &Peer, _node_name: &str) -> Result<PeerResponse> {
            self.queried.lock().unwrap().push(peer.name.clone());
            if let Some(delay) = self.delays.get(&peer.name) {
                tokio::time::sleep(*delay).await;
            }
            match self.answers.get(&peer.name) {
                Some(answer) => answer.clone().map_err(Error::PeerError),
                None => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn config(max_peers: usize) -> PeerConfig {
        PeerConfig {
            my_node_name: "worker-1".to_string(),
            update_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(5),
            max_peers_to_query: max_peers,
        }
    }

    fn nodes(names: &[&str]) -> Vec<Node> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| node(n, Some(&format!("10.0.0.{}", i + 1))))
            .collect()
    }

    async fn manager(
        node_names: &[&str],
        client: Arc<ScriptedClient>,
        max_peers: usize,
    ) -> PeerManager {
        let source = Arc::new(StaticSource(Mutex::new(Ok(nodes(node_names)))));
        let manager = PeerManager::new(config(max_peers), source, client);
        manager.refresh().await.unwrap();
        manager
    }

    #[test]
    fn test_peers_exclude_self_and_unaddressed_nodes() {
        let nodes = vec![
            node("worker-1", Some("10.0.0.1")),
            node("worker-2", Some("10.0.0.2")),
            node("worker-3", None),
        ];
        let peers = peers_from_nodes(&nodes, "worker-1");
        assert_eq!(
            peers,
            vec![Peer {
                name: "worker-2".to_string(),
                address: "10.0.0.2".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_no_peers_is_indeterminate_and_healthy() {
        let client = Arc::new(ScriptedClient::new(&[]));
        let manager = manager(&["worker-1"], client, 5).await;
        assert_eq!(manager.verdict("worker-1").await, PeerVerdict::Indeterminate);
        assert_eq!(manager.is_healthy("worker-1").await, HealthCheckResult::Healthy);
    }

    #[tokio::test]
    async fn test_single_unhealthy_peer_overrides_healthy_ones() {
        let client = Arc::new(ScriptedClient::new(&[
            ("worker-2", Ok(PeerResponse::ConfirmsHealthy)),
            ("worker-3", Ok(PeerResponse::ConfirmsUnhealthy)),
        ]));
        let manager = manager(&["worker-1", "worker-2", "worker-3"], client, 5).await;
        assert_eq!(manager.is_healthy("worker-1").await, HealthCheckResult::Unhealthy);
    }

    #[tokio::test]
    async fn test_all_peers_without_api_access() {
        let client = Arc::new(ScriptedClient::new(&[
            ("worker-2", Ok(PeerResponse::ApiServerUnreachable)),
            ("worker-3", Ok(PeerResponse::ApiServerUnreachable)),
        ]));
        let manager = manager(&["worker-1", "worker-2", "worker-3"], client, 5).await;
        assert_eq!(
            manager.is_healthy("worker-1").await,
            HealthCheckResult::ApiServerUnreachable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peers_hit_the_deadline() {
        let client = Arc::new(ScriptedClient::new(&[(
            "worker-2",
            Err("connection refused".to_string()),
        )]));
        let manager = manager(&["worker-1", "worker-2", "worker-3"], client, 5).await;

        let started = tokio::time::Instant::now();
        assert_eq!(manager.verdict("worker-1").await, PeerVerdict::Indeterminate);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_wait_for_slow_peer_once_decisive() {
        let client = Arc::new(ScriptedClient::new(&[
            ("worker-2", Ok(PeerResponse::ConfirmsUnhealthy)),
        ]));
        let manager = manager(&["worker-1", "worker-2", "worker-3"], client, 5).await;

        let started = tokio::time::Instant::now();
        assert_eq!(manager.verdict("worker-1").await, PeerVerdict::Unhealthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_answers_do_not_hide_a_slower_unhealthy_peer() {
        let client = Arc::new(
            ScriptedClient::new(&[
                ("worker-2", Ok(PeerResponse::ConfirmsHealthy)),
                ("worker-3", Ok(PeerResponse::ConfirmsHealthy)),
                ("worker-4", Ok(PeerResponse::ConfirmsUnhealthy)),
            ])
            .with_delay("worker-4", Duration::from_secs(1)),
        );
        let manager = manager(&["worker-1", "worker-2", "worker-3", "worker-4"], client, 5).await;

        assert_eq!(manager.verdict("worker-1").await, PeerVerdict::Unhealthy);
        assert_eq!(manager.is_healthy("worker-1").await, HealthCheckResult::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_healthy_round_ends_when_everyone_answered() {
        let client = Arc::new(ScriptedClient::new(&[
            ("worker-2", Ok(PeerResponse::ConfirmsHealthy)),
            ("worker-3", Ok(PeerResponse::ConfirmsHealthy)),
        ]));
        let manager = manager(&["worker-1", "worker-2", "worker-3"], client, 5).await;

        let started = tokio::time::Instant::now();
        assert_eq!(manager.verdict("worker-1").await, PeerVerdict::Healthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sample_is_capped() {
        let client = Arc::new(ScriptedClient::new(&[
            ("worker-2", Ok(PeerResponse::ApiServerUnreachable)),
            ("worker-3", Ok(PeerResponse::ApiServerUnreachable)),
            ("worker-4", Ok(PeerResponse::ApiServerUnreachable)),
            ("worker-5", Ok(PeerResponse::ApiServerUnreachable)),
        ]));
        let manager = manager(
            &["worker-1", "worker-2", "worker-3", "worker-4", "worker-5"],
            client.clone(),
            2,
        )
        .await;
        manager.verdict("worker-1").await;
        assert_eq!(client.queried.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_peers() {
        let source = Arc::new(StaticSource(Mutex::new(Ok(nodes(&["worker-1", "worker-2"])))));
        let client = Arc::new(ScriptedClient::new(&[]));
        let manager = PeerManager::new(config(5), source.clone(), client);
        manager.refresh().await.unwrap();
        assert_eq!(manager.peers().await.len(), 1);

        *source.0.lock().unwrap() = Err("api down".to_string());
        assert!(manager.refresh().await.is_err());
        assert_eq!(manager.peers().await.len(), 1);
    }
}
