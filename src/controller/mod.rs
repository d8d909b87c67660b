//! Controller module for RemediationRequest reconciliation
//!
//! This module contains the main controller loop, the remediation state
//! machine and the cluster operations it performs.

mod backoff;
mod cluster;
mod finalizers;
mod reconciler;
mod remediation;

pub use backoff::{calculate_backoff, FailureTracker};
pub use cluster::{ClusterOps, KubeClusterOps, FIELD_MANAGER};
pub use finalizers::REMEDIATION_FINALIZER;
pub use reconciler::{run_controller, ControllerState};
pub use remediation::{is_skipped_pod, DeletionSummary, Remediator, MIRROR_POD_ANNOTATION};
