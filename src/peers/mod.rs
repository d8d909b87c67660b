//! Peer quorum: asking other nodes whether this node is unhealthy
//!
//! A node cannot trust its own observation that it lost the control plane.
//! Instead it asks a random sample of peers. A peer with working API server
//! access answers authoritatively: the node is unhealthy exactly when a
//! RemediationRequest exists for it. Peers that lost API access themselves say
//! so, which points at a cluster-wide outage rather than a node fault.

mod client;
mod manager;
mod server;

use serde::{Deserialize, Serialize};

pub use client::{HttpPeerClient, PeerClient};
pub use manager::{peers_from_nodes, KubePeerSource, Peer, PeerConfig, PeerManager, PeerSource};
pub use server::{
    peer_health, peer_health_router, KubeRemediationLookup, PeerServerState, RemediationLookup,
};

/// Outcome of one health evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    Healthy,
    Unhealthy,
    /// Peers cannot reach the API server either
    ApiServerUnreachable,
}

impl HealthCheckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckResult::Healthy => "Healthy",
            HealthCheckResult::Unhealthy => "Unhealthy",
            HealthCheckResult::ApiServerUnreachable => "ApiServerUnreachable",
        }
    }
}

/// Answer sent by a peer over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Healthy,
    Unhealthy,
    ApiServerUnreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthResponse {
    pub status: PeerStatus,
}

/// What a single peer told us in one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerResponse {
    ConfirmsHealthy,
    ConfirmsUnhealthy,
    /// The peer answered but cannot reach the API server itself
    ApiServerUnreachable,
    /// Error, timeout or no answer before the deadline
    NoResponse,
}

impl From<PeerStatus> for PeerResponse {
    fn from(status: PeerStatus) -> Self {
        match status {
            PeerStatus::Healthy => PeerResponse::ConfirmsHealthy,
            PeerStatus::Unhealthy => PeerResponse::ConfirmsUnhealthy,
            PeerStatus::ApiServerUnreachable => PeerResponse::ApiServerUnreachable,
        }
    }
}

/// Aggregate verdict of a quorum round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVerdict {
    Healthy,
    Unhealthy,
    ApiServerUnreachable,
    /// Nobody answered decisively
    Indeterminate,
}

impl PeerVerdict {
    /// Indeterminate rounds default to healthy
    pub fn into_health_result(self) -> HealthCheckResult {
        match self {
            PeerVerdict::Unhealthy => HealthCheckResult::Unhealthy,
            PeerVerdict::ApiServerUnreachable => HealthCheckResult::ApiServerUnreachable,
            PeerVerdict::Healthy | PeerVerdict::Indeterminate => HealthCheckResult::Healthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerVerdict::Healthy => "Healthy",
            PeerVerdict::Unhealthy => "Unhealthy",
            PeerVerdict::ApiServerUnreachable => "ApiServerUnreachable",
            PeerVerdict::Indeterminate => "Indeterminate",
        }
    }
}

/// Reduce the responses of a round.
///
/// Any peer confirming unhealthy wins. Otherwise any healthy confirmation
/// wins. If the only answers are peers that lost the API server too, the
/// outage is cluster-wide. Silence is indeterminate.
pub fn aggregate(responses: &[PeerResponse]) -> PeerVerdict {
    if responses.contains(&PeerResponse::ConfirmsUnhealthy) {
        return PeerVerdict::Unhealthy;
    }
    if responses.contains(&PeerResponse::ConfirmsHealthy) {
        return PeerVerdict::Healthy;
    }
    if responses.contains(&PeerResponse::ApiServerUnreachable) {
        return PeerVerdict::ApiServerUnreachable;
    }
    PeerVerdict::Indeterminate
}

/// Verdict that can be returned before the remaining peers answer, if any.
///
/// Only an unhealthy confirmation ends a round early. Healthy answers never
/// do, since a later peer may still confirm the node is unhealthy.
pub fn decisive(responses: &[PeerResponse]) -> Option<PeerVerdict> {
    if responses.contains(&PeerResponse::ConfirmsUnhealthy) {
        return Some(PeerVerdict::Unhealthy);
    }
    None
}

/// Answers "is this node healthy according to its peers?"
#[async_trait::async_trait]
pub trait PeerHealth: Send + Sync {
    async fn is_healthy(&self, node_name: &str) -> HealthCheckResult;
}
