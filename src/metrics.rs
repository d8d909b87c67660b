//! Prometheus metrics shared by the agent and the remediation controller

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Labels identifying a node
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

/// Labels for peer verdicts
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VerdictLabels {
    pub node: String,
    pub verdict: String,
}

/// Labels for remediation phase transitions
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub namespace: String,
    pub node: String,
    pub phase: String,
}

/// Consecutive failed API server probes on this node
pub static API_CHECK_ERRORS: Lazy<Family<NodeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Aggregated peer verdicts
pub static PEER_VERDICTS: Lazy<Family<VerdictLabels, Counter>> = Lazy::new(Family::default);

/// Reboots engaged by this process
pub static REBOOTS_TRIGGERED: Lazy<Family<NodeLabels, Counter>> = Lazy::new(Family::default);

/// Remediation phases written by the controller
pub static REMEDIATION_PHASES: Lazy<Family<PhaseLabels, Counter>> = Lazy::new(Family::default);

/// Pods deleted from fenced nodes
pub static PODS_DELETED: Lazy<Family<NodeLabels, Counter>> = Lazy::new(Family::default);

/// Volume attachments deleted from fenced nodes
pub static VOLUME_ATTACHMENTS_DELETED: Lazy<Family<NodeLabels, Counter>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "self_fence_api_check_errors",
        "Consecutive failed API server probes",
        API_CHECK_ERRORS.clone(),
    );
    registry.register(
        "self_fence_peer_verdicts",
        "Aggregated peer health verdicts",
        PEER_VERDICTS.clone(),
    );
    registry.register(
        "self_fence_reboots_triggered",
        "Reboots engaged by the agent",
        REBOOTS_TRIGGERED.clone(),
    );
    registry.register(
        "self_fence_remediation_phases",
        "Remediation phases entered",
        REMEDIATION_PHASES.clone(),
    );
    registry.register(
        "self_fence_pods_deleted",
        "Pods deleted from fenced nodes",
        PODS_DELETED.clone(),
    );
    registry.register(
        "self_fence_volume_attachments_deleted",
        "Volume attachments deleted from fenced nodes",
        VOLUME_ATTACHMENTS_DELETED.clone(),
    );
    registry
});

fn node_labels(node: &str) -> NodeLabels {
    NodeLabels {
        node: node.to_string(),
    }
}

pub fn set_api_check_errors(node: &str, count: u32) {
    API_CHECK_ERRORS
        .get_or_create(&node_labels(node))
        .set(count as i64);
}

pub fn inc_peer_verdict(node: &str, verdict: &str) {
    let labels = VerdictLabels {
        node: node.to_string(),
        verdict: verdict.to_string(),
    };
    PEER_VERDICTS.get_or_create(&labels).inc();
}

pub fn inc_reboots_triggered(node: &str) {
    REBOOTS_TRIGGERED.get_or_create(&node_labels(node)).inc();
}

pub fn inc_remediation_phase(namespace: &str, node: &str, phase: &str) {
    let labels = PhaseLabels {
        namespace: namespace.to_string(),
        node: node.to_string(),
        phase: phase.to_string(),
    };
    REMEDIATION_PHASES.get_or_create(&labels).inc();
}

pub fn add_pods_deleted(node: &str, count: u64) {
    PODS_DELETED.get_or_create(&node_labels(node)).inc_by(count);
}

pub fn add_volume_attachments_deleted(node: &str, count: u64) {
    VOLUME_ATTACHMENTS_DELETED
        .get_or_create(&node_labels(node))
        .inc_by(count);
}

/// Render the registry in the text exposition format
pub fn encode_registry() -> String {
    use prometheus_client::encoding::text::encode;
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &REGISTRY) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_registry_contains_families() {
        set_api_check_errors("metrics-test-node", 2);
        inc_peer_verdict("metrics-test-node", "Unhealthy");
        add_pods_deleted("metrics-test-node", 3);

        let text = encode_registry();
        assert!(text.contains("self_fence_api_check_errors"));
        assert!(text.contains("verdict=\"Unhealthy\""));
        assert!(text.contains("self_fence_pods_deleted"));
    }
}
