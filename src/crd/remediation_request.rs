//! RemediationRequest Custom Resource Definition
//!
//! A RemediationRequest is created by an external health detector when a node
//! is judged unhealthy. Its name is the name of the target node. It is the only
//! durable state of the remediation workflow.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, RemediationPhase, RemediationStrategy, CONDITION_PROCESSING};

/// The RemediationRequest CRD asks for a node to be fenced and its workloads released.
///
/// # Example
///
/// ```yaml
/// apiVersion: remediation.self-fence.io/v1alpha1
/// kind: RemediationRequest
/// metadata:
///   name: worker-1
///   namespace: self-fence
/// spec:
///   remediationStrategy: ResourceDeletion
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "remediation.self-fence.io",
    version = "v1alpha1",
    kind = "RemediationRequest",
    namespaced,
    status = "RemediationRequestStatus",
    shortname = "rr",
    shortname = "fence",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.remediationStrategy"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"AssumedRebooted","type":"string","jsonPath":".status.timeAssumedRebooted"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestSpec {
    /// Remediation method for the unhealthy node.
    /// NodeDeletion is deprecated; ResourceDeletion always happens.
    #[serde(default)]
    pub remediation_strategy: RemediationStrategy,
}

/// Status subresource for RemediationRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemediationRequestStatus {
    /// Time after which the unhealthy node is assumed to have rebooted.
    /// Immutable once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_assumed_rebooted: Option<DateTime<Utc>>,

    /// Current phase of remediation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Last error that occurred during remediation, empty if none
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,

    /// Observations of the current state, keyed by type. Known types: "Processing"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RemediationRequestStatus {
    pub fn phase(&self) -> Option<RemediationPhase> {
        self.phase.as_deref().and_then(RemediationPhase::parse)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether remediation work is known to remain
    pub fn is_processing(&self) -> bool {
        self.condition(CONDITION_PROCESSING)
            .map(Condition::is_true)
            .unwrap_or(false)
    }
}

impl RemediationRequest {
    /// Name of the node this request targets
    pub fn node_name(&self) -> String {
        kube::ResourceExt::name_any(self)
    }

    pub fn time_assumed_rebooted(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.time_assumed_rebooted)
    }

    /// Time left until the node may be assumed down, zero once elapsed
    pub fn remaining_safe_time(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.time_assumed_rebooted()
            .map(|t| (t - now).to_std().unwrap_or_default())
    }
}
