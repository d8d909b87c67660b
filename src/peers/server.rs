//! Answering peers that ask about themselves

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use kube::{
    api::{Api, ListParams},
    Client,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::{PeerHealthResponse, PeerStatus};
use crate::crd::RemediationRequest;
use crate::error::Result;

/// Whether a node has been asked to remediate
#[async_trait]
pub trait RemediationLookup: Send + Sync {
    async fn is_remediation_requested(&self, node_name: &str) -> Result<bool>;
}

/// Looks up RemediationRequests named after the node in any namespace
pub struct KubeRemediationLookup {
    client: Client,
}

impl KubeRemediationLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemediationLookup for KubeRemediationLookup {
    async fn is_remediation_requested(&self, node_name: &str) -> Result<bool> {
        let api: Api<RemediationRequest> = Api::all(self.client.clone());
        let params = ListParams::default()
            .fields(&format!("metadata.name={}", node_name))
            .limit(1);
        let list = api.list(&params).await?;
        Ok(!list.items.is_empty())
    }
}

/// Shared state for the peer health server
#[derive(Clone)]
pub struct PeerServerState {
    pub lookup: Arc<dyn RemediationLookup>,
    /// Budget for the lookup before answering ApiServerUnreachable
    pub api_server_timeout: Duration,
}

/// `GET /peer-health/:node`
pub async fn peer_health(
    State(state): State<PeerServerState>,
    Path(node): Path<String>,
) -> Json<PeerHealthResponse> {
    let status = match tokio::time::timeout(
        state.api_server_timeout,
        state.lookup.is_remediation_requested(&node),
    )
    .await
    {
        Ok(Ok(true)) => {
            info!("node is unhealthy: {} has a pending remediation", node);
            PeerStatus::Unhealthy
        }
        Ok(Ok(false)) => {
            debug!("Node {} has no remediation", node);
            PeerStatus::Healthy
        }
        Ok(Err(e)) => {
            warn!("Cannot look up remediations for {}: {}", node, e);
            PeerStatus::ApiServerUnreachable
        }
        Err(_) => {
            warn!(
                "Remediation lookup for {} timed out after {:?}",
                node, state.api_server_timeout
            );
            PeerStatus::ApiServerUnreachable
        }
    };
    Json(PeerHealthResponse { status })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_handler() -> String {
    crate::metrics::encode_registry()
}

/// Router served by every agent on the peer port
pub fn peer_health_router(state: PeerServerState) -> Router {
    Router::new()
        .route("/peer-health/:node", get(peer_health))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    enum Answer {
        Requested(bool),
        Fails,
        Hangs,
    }

    struct FakeLookup(Answer);

    #[async_trait]
    impl RemediationLookup for FakeLookup {
        async fn is_remediation_requested(&self, _node_name: &str) -> Result<bool> {
            match self.0 {
                Answer::Requested(found) => Ok(found),
                Answer::Fails => Err(Error::PeerError("connection refused".to_string())),
                Answer::Hangs => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(false)
                }
            }
        }
    }

    async fn ask(answer: Answer) -> PeerStatus {
        let state = PeerServerState {
            lookup: Arc::new(FakeLookup(answer)),
            api_server_timeout: Duration::from_secs(5),
        };
        let Json(body) = peer_health(State(state), Path("worker-1".to_string())).await;
        body.status
    }

    #[tokio::test]
    async fn test_pending_remediation_means_unhealthy() {
        assert_eq!(ask(Answer::Requested(true)).await, PeerStatus::Unhealthy);
        assert_eq!(ask(Answer::Requested(false)).await, PeerStatus::Healthy);
    }

    #[tokio::test]
    async fn test_lookup_failure_reports_api_unreachable() {
        assert_eq!(ask(Answer::Fails).await, PeerStatus::ApiServerUnreachable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_timeout_reports_api_unreachable() {
        assert_eq!(ask(Answer::Hangs).await, PeerStatus::ApiServerUnreachable);
    }
}
