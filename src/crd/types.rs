//! Shared types for remediation request specifications
//!
//! These types are used across the CRD definitions and controller logic.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type used to signal whether remediation work remains
pub const CONDITION_PROCESSING: &str = "Processing";

/// Node annotation: watchdog timeout of the agent on that node, in seconds
pub const WATCHDOG_TIMEOUT_ANNOTATION: &str = "self-fence.io/watchdog-timeout-seconds";

/// Node annotation: the agent's own safe time estimate, in seconds
pub const AGENT_SAFE_TIME_ANNOTATION: &str = "self-fence.io/agent-safe-time-seconds";

/// Read a seconds-valued annotation. Missing or malformed values are ignored.
pub fn annotation_seconds(
    annotations: &std::collections::BTreeMap<String, String>,
    key: &str,
) -> Option<std::time::Duration> {
    annotations
        .get(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}

/// How the workloads of an unhealthy node are released
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RemediationStrategy {
    /// Delete all pods and volume attachments bound to the node
    #[default]
    ResourceDeletion,

    /// Deprecated: handled exactly like ResourceDeletion
    NodeDeletion,
}

impl RemediationStrategy {
    /// Strategy actually carried out for this selector
    pub fn effective(&self) -> RemediationStrategy {
        RemediationStrategy::ResourceDeletion
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, RemediationStrategy::NodeDeletion)
    }
}

impl std::fmt::Display for RemediationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationStrategy::ResourceDeletion => write!(f, "ResourceDeletion"),
            RemediationStrategy::NodeDeletion => write!(f, "NodeDeletion"),
        }
    }
}

/// Progress label written to `status.phase`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemediationPhase {
    /// Node cordoned, safe time persisted
    Remediating,
    /// Waiting for the fenced node to be provably down
    WaitingForSafeTime,
    /// Workloads deleted, node stays cordoned until the request is removed
    Resolved,
}

impl RemediationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationPhase::Remediating => "Remediating",
            RemediationPhase::WaitingForSafeTime => "WaitingForSafeTime",
            RemediationPhase::Resolved => "Resolved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Remediating" => Some(RemediationPhase::Remediating),
            "WaitingForSafeTime" => Some(RemediationPhase::WaitingForSafeTime),
            "Resolved" => Some(RemediationPhase::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for RemediationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Processing")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    /// Create a new Processing condition
    pub fn processing(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: CONDITION_PROCESSING.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Insert or replace a condition keyed by its type.
///
/// The transition time of an existing condition is kept when its status does
/// not change. Returns true if anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return false;
            }
            let last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time,
                ..condition
            };
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}
