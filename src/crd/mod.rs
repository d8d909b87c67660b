//! Custom Resource Definitions for self-fence
//!
//! This module defines the Kubernetes CRD that drives node remediation.

mod remediation_request;
mod types;


pub use remediation_request::{RemediationRequest, RemediationRequestSpec, RemediationRequestStatus};
pub use types::*;
