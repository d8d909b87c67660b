//! Response bodies of the REST API

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::RemediationRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationSummary {
    pub namespace: String,
    pub node: String,
    pub strategy: String,
    pub phase: Option<String>,
    pub time_assumed_rebooted: Option<DateTime<Utc>>,
    pub processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&RemediationRequest> for RemediationSummary {
    fn from(rr: &RemediationRequest) -> Self {
        let status = rr.status.clone().unwrap_or_default();
        Self {
            namespace: rr.namespace().unwrap_or_else(|| "default".to_string()),
            node: rr.node_name(),
            strategy: rr.spec.remediation_strategy.to_string(),
            phase: status.phase.clone(),
            time_assumed_rebooted: status.time_assumed_rebooted,
            processing: status.is_processing(),
            last_error: Some(status.last_error).filter(|e| !e.is_empty()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
