//! Remediation of an unhealthy node
//!
//! A pass over one RemediationRequest:
//! 1. Cordon the target node
//! 2. Compute and persist `timeAssumedRebooted` if absent
//! 3. Until it elapses, requeue for the remaining time
//! 4. Delete the node's pods and volume attachments
//! 5. Mark the request Resolved
//!
//! Every step checks the current state first, so repeating a pass on an
//! unchanged request does nothing new. Deleting the request uncordons the node.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{runtime::controller::Action, ResourceExt};
use tracing::{debug, info, warn};

use super::cluster::ClusterOps;
use crate::crd::{
    annotation_seconds, set_condition, Condition, RemediationPhase, RemediationRequest,
    RemediationRequestStatus, AGENT_SAFE_TIME_ANNOTATION, WATCHDOG_TIMEOUT_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::safe_time::SafeTimeCalculator;

/// Static pods mirrored into the API server carry this annotation
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

pub const REASON_MARK_UNSCHEDULABLE: &str = "MarkUnschedulable";
pub const REASON_WAITING_FOR_SAFE_TIME: &str = "WaitingForSafeTime";
pub const REASON_DELETE_RESOURCES: &str = "DeleteResources";
pub const REASON_REMEDIATION_FINISHED: &str = "RemediationFinished";
pub const REASON_NODE_NOT_FOUND: &str = "NodeNotFound";

const EVENT_NORMAL: &str = "Normal";
const EVENT_WARNING: &str = "Warning";

/// Pods that would be recreated on the node anyway or cannot be deleted
pub fn is_skipped_pod(pod: &Pod) -> bool {
    let daemonset_owned = pod
        .owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet");
    let mirror = pod.annotations().contains_key(MIRROR_POD_ANNOTATION);
    daemonset_owned || mirror
}

fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Counts from one resource deletion pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeletionSummary {
    pub pods_deleted: u64,
    pub pods_skipped: u64,
    pub volume_attachments_deleted: u64,
}

/// Carries out remediation against a [`ClusterOps`]
pub struct Remediator {
    cluster: Arc<dyn ClusterOps>,
    calculator: Arc<dyn SafeTimeCalculator>,
}

impl Remediator {
    pub fn new(cluster: Arc<dyn ClusterOps>, calculator: Arc<dyn SafeTimeCalculator>) -> Self {
        Self {
            cluster,
            calculator,
        }
    }

    /// Safe time for `node`: the manager estimate using the node's advertised
    /// watchdog timeout, never shorter than what the node's agent advertised
    pub fn safe_time_for(&self, node: &Node) -> Result<Duration> {
        let annotations = node.annotations();
        let watchdog_timeout = annotation_seconds(annotations, WATCHDOG_TIMEOUT_ANNOTATION);
        let computed = self.calculator.time_to_assume_rebooted(watchdog_timeout)?;
        let advertised = annotation_seconds(annotations, AGENT_SAFE_TIME_ANNOTATION);
        Ok(advertised.map_or(computed, |agent| computed.max(agent)))
    }

    async fn write_status(
        &self,
        rr: &RemediationRequest,
        status: &RemediationRequestStatus,
    ) -> Result<RemediationRequest> {
        if rr.status.as_ref() == Some(status) {
            return Ok(rr.clone());
        }
        self.cluster.update_status(rr, status).await
    }

    async fn event(&self, rr: &RemediationRequest, event_type: &str, reason: &str, message: &str) {
        if let Err(e) = self
            .cluster
            .publish_event(rr, event_type, reason, message)
            .await
        {
            warn!("Failed to publish {} event for {}: {}", reason, rr.name_any(), e);
        }
    }

    /// One reconcile pass for a live request
    pub async fn apply(&self, rr: &RemediationRequest, now: DateTime<Utc>) -> Result<Action> {
        let namespace = rr.namespace().unwrap_or_else(|| "default".to_string());
        let node_name = rr.node_name();
        let strategy = rr.spec.remediation_strategy;
        if strategy.is_deprecated() {
            warn!(
                "{}/{} uses deprecated strategy {}, using {}",
                namespace,
                node_name,
                strategy,
                strategy.effective()
            );
        }

        let mut status = rr.status.clone().unwrap_or_default();

        let node = match self.cluster.get_node(&node_name).await? {
            Some(node) => node,
            None => {
                warn!("Node {} not found, nothing to remediate", node_name);
                let err = Error::NodeNotFound(node_name.clone());
                status.last_error = err.status_message();
                set_condition(
                    &mut status.conditions,
                    Condition::processing(false, REASON_NODE_NOT_FOUND, &err.status_message()),
                );
                let changed = rr.status.as_ref() != Some(&status);
                self.write_status(rr, &status).await?;
                if changed {
                    self.event(rr, EVENT_WARNING, REASON_NODE_NOT_FOUND, &err.status_message())
                        .await;
                }
                return Ok(Action::await_change());
            }
        };

        if !is_unschedulable(&node) {
            info!("Marking node {} unschedulable for {}/{}", node_name, namespace, node_name);
            self.cluster.set_unschedulable(&node_name, true).await?;
            self.event(
                rr,
                EVENT_NORMAL,
                REASON_MARK_UNSCHEDULABLE,
                &format!("Marked node {} unschedulable", node_name),
            )
            .await;
        }

        if status.phase() == Some(RemediationPhase::Resolved) {
            debug!("{}/{} already resolved", namespace, node_name);
            return Ok(Action::await_change());
        }

        let mut rr = rr.clone();
        let time_assumed_rebooted = match status.time_assumed_rebooted {
            Some(t) => t,
            None => {
                let safe_time = self.safe_time_for(&node)?;
                let safe_time = chrono::Duration::from_std(safe_time)
                    .map_err(|e| Error::SafeTimeError(e.to_string()))?;
                let t = now
                    .checked_add_signed(safe_time)
                    .ok_or_else(|| Error::SafeTimeError("safe time overflows".to_string()))?;
                info!(
                    "Node {} assumed rebooted at {} ({}s)",
                    node_name,
                    t.to_rfc3339(),
                    safe_time.num_seconds()
                );

                status.time_assumed_rebooted = Some(t);
                status.phase = Some(RemediationPhase::Remediating.as_str().to_string());
                set_condition(
                    &mut status.conditions,
                    Condition::processing(true, "Remediating", "Node marked for fencing"),
                );
                rr = self.write_status(&rr, &status).await?;
                metrics::inc_remediation_phase(&namespace, &node_name, RemediationPhase::Remediating.as_str());
                t
            }
        };

        if now < time_assumed_rebooted {
            let remaining = (time_assumed_rebooted - now).to_std().unwrap_or_default();
            if status.phase() != Some(RemediationPhase::WaitingForSafeTime) {
                status.phase = Some(RemediationPhase::WaitingForSafeTime.as_str().to_string());
                set_condition(
                    &mut status.conditions,
                    Condition::processing(
                        true,
                        REASON_WAITING_FOR_SAFE_TIME,
                        "Waiting for the node to be assumed rebooted",
                    ),
                );
                rr = self.write_status(&rr, &status).await?;
                metrics::inc_remediation_phase(
                    &namespace,
                    &node_name,
                    RemediationPhase::WaitingForSafeTime.as_str(),
                );
                self.event(
                    &rr,
                    EVENT_NORMAL,
                    REASON_WAITING_FOR_SAFE_TIME,
                    &format!("Waiting {}s for node {} to reboot", remaining.as_secs(), node_name),
                )
                .await;
            }
            debug!("Requeueing {}/{} in {:?}", namespace, node_name, remaining);
            return Ok(Action::requeue(remaining.max(Duration::from_secs(1))));
        }

        let summary = self.delete_resources(&node_name).await?;
        info!(
            "Deleted {} pods ({} skipped) and {} volume attachments from {}",
            summary.pods_deleted, summary.pods_skipped, summary.volume_attachments_deleted, node_name
        );
        if summary.pods_deleted > 0 || summary.volume_attachments_deleted > 0 {
            self.event(
                &rr,
                EVENT_NORMAL,
                REASON_DELETE_RESOURCES,
                &format!(
                    "Deleted {} pods and {} volume attachments",
                    summary.pods_deleted, summary.volume_attachments_deleted
                ),
            )
            .await;
        }

        status.phase = Some(RemediationPhase::Resolved.as_str().to_string());
        status.last_error.clear();
        set_condition(
            &mut status.conditions,
            Condition::processing(false, "RemediationSucceeded", "Workloads released from node"),
        );
        self.write_status(&rr, &status).await?;
        metrics::inc_remediation_phase(&namespace, &node_name, RemediationPhase::Resolved.as_str());

        Ok(Action::await_change())
    }

    /// Delete the node's pods and volume attachments. Already-gone objects count
    /// as deleted by someone else, not as errors.
    pub async fn delete_resources(&self, node_name: &str) -> Result<DeletionSummary> {
        let mut summary = DeletionSummary::default();

        for pod in self.cluster.list_pods_on_node(node_name).await? {
            if is_skipped_pod(&pod) {
                summary.pods_skipped += 1;
                continue;
            }
            let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
            if self.cluster.delete_pod(&namespace, &pod.name_any()).await? {
                debug!("Deleted pod {}/{}", namespace, pod.name_any());
                summary.pods_deleted += 1;
            }
        }

        for va in self.cluster.list_volume_attachments(node_name).await? {
            if self.cluster.delete_volume_attachment(&va.name_any()).await? {
                debug!("Deleted volume attachment {}", va.name_any());
                summary.volume_attachments_deleted += 1;
            }
        }

        metrics::add_pods_deleted(node_name, summary.pods_deleted);
        metrics::add_volume_attachments_deleted(node_name, summary.volume_attachments_deleted);
        Ok(summary)
    }

    /// The request was deleted: give the node back to the scheduler
    pub async fn cleanup(&self, rr: &RemediationRequest) -> Result<Action> {
        let node_name = rr.node_name();
        match self.cluster.get_node(&node_name).await? {
            Some(node) if is_unschedulable(&node) => {
                info!("Marking node {} schedulable again", node_name);
                self.cluster.set_unschedulable(&node_name, false).await?;
                self.event(
                    rr,
                    EVENT_NORMAL,
                    REASON_REMEDIATION_FINISHED,
                    &format!("Node {} is schedulable again", node_name),
                )
                .await;
            }
            Some(_) => debug!("Node {} already schedulable", node_name),
            None => debug!("Node {} gone, nothing to uncordon", node_name),
        }
        Ok(Action::await_change())
    }

    /// Surface `err` in `lastError` without touching other progress
    pub async fn record_error(&self, rr: &RemediationRequest, err: &Error) -> Result<()> {
        let mut status = rr.status.clone().unwrap_or_default();
        status.last_error = err.status_message();
        self.write_status(rr, &status).await?;
        Ok(())
    }
}
