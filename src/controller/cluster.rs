//! Cluster API operations used by the remediation controller

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::debug;

use crate::crd::{RemediationRequest, RemediationRequestStatus};
use crate::error::{is_kube_conflict, is_kube_not_found, with_deadline, Error, Result};

/// Field manager for status writes
pub const FIELD_MANAGER: &str = "self-fence-manager";

/// Everything the controller reads or writes besides its own watch
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// `None` when the node does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Returns false when the pod was already gone
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn list_volume_attachments(&self, node_name: &str) -> Result<Vec<VolumeAttachment>>;

    /// Returns false when the attachment was already gone
    async fn delete_volume_attachment(&self, name: &str) -> Result<bool>;

    /// Write `status` guarded by the resource version of `rr`
    async fn update_status(
        &self,
        rr: &RemediationRequest,
        status: &RemediationRequestStatus,
    ) -> Result<RemediationRequest>;

    async fn publish_event(
        &self,
        rr: &RemediationRequest,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`ClusterOps`] backed by the API server. Every call is bounded by
/// `timeout`.
pub struct KubeClusterOps {
    client: Client,
    timeout: Duration,
}

impl KubeClusterOps {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ClusterOps for KubeClusterOps {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        with_deadline(self.timeout, async {
            api.get_opt(name).await.map_err(Error::KubeError)
        })
        .await
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": unschedulable } });
        with_deadline(self.timeout, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    if is_kube_not_found(&e) {
                        Error::NodeNotFound(name.to_string())
                    } else {
                        Error::KubeError(e)
                    }
                })
        })
        .await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let pods = with_deadline(self.timeout, async {
            api.list(&params).await.map_err(Error::KubeError)
        })
        .await?;
        Ok(pods.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        with_deadline(self.timeout, async {
            match api.delete(name, &DeleteParams::default().grace_period(0)).await {
                Ok(_) => Ok(true),
                Err(e) if is_kube_not_found(&e) => {
                    debug!("Pod {}/{} already deleted", namespace, name);
                    Ok(false)
                }
                Err(e) => Err(Error::KubeError(e)),
            }
        })
        .await
    }

    async fn list_volume_attachments(&self, node_name: &str) -> Result<Vec<VolumeAttachment>> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        let all = with_deadline(self.timeout, async {
            api.list(&ListParams::default())
                .await
                .map_err(Error::KubeError)
        })
        .await?;
        Ok(all
            .items
            .into_iter()
            .filter(|va| va.spec.node_name == node_name)
            .collect())
    }

    async fn delete_volume_attachment(&self, name: &str) -> Result<bool> {
        let api: Api<VolumeAttachment> = Api::all(self.client.clone());
        with_deadline(self.timeout, async {
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(true),
                Err(e) if is_kube_not_found(&e) => {
                    debug!("VolumeAttachment {} already deleted", name);
                    Ok(false)
                }
                Err(e) => Err(Error::KubeError(e)),
            }
        })
        .await
    }

    async fn update_status(
        &self,
        rr: &RemediationRequest,
        status: &RemediationRequestStatus,
    ) -> Result<RemediationRequest> {
        let namespace = rr.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<RemediationRequest> = Api::namespaced(self.client.clone(), &namespace);

        // resourceVersion in a merge patch makes the write conditional
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": rr.resource_version() },
            "status": status,
        });
        with_deadline(self.timeout, async {
            api.patch_status(
                &rr.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| {
                if is_kube_conflict(&e) {
                    Error::Conflict {
                        kind: "RemediationRequest".to_string(),
                        name: format!("{}/{}", namespace, rr.name_any()),
                    }
                } else {
                    Error::KubeError(e)
                }
            })
        })
        .await
    }

    async fn publish_event(
        &self,
        rr: &RemediationRequest,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = rr.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", rr.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: rr.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        with_deadline(self.timeout, async {
            events
                .create(&PostParams::default(), &event)
                .await
                .map_err(Error::KubeError)
        })
        .await?;
        Ok(())
    }
}
