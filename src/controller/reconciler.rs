use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::RemediationRequest;
use crate::error::{Error, Result};

use super::backoff::FailureTracker;
use super::finalizers::REMEDIATION_FINALIZER;
use super::remediation::Remediator;

/// Requeue delay after an optimistic concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub remediator: Remediator,
    pub failures: FailureTracker,
}

impl ControllerState {
    pub fn new(client: Client, remediator: Remediator) -> Self {
        Self {
            client,
            remediator,
            failures: FailureTracker::default(),
        }
    }
}

fn key(rr: &RemediationRequest) -> String {
    format!(
        "{}/{}",
        rr.namespace().unwrap_or_else(|| "default".to_string()),
        rr.name_any()
    )
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let requests: Api<RemediationRequest> = Api::all(state.client.clone());

    info!("Starting RemediationRequest controller");

    match requests.list(&Default::default()).await {
        Ok(_) => info!("RemediationRequest CRD is available"),
        Err(e) => {
            error!(
                "RemediationRequest CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "RemediationRequest CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(requests, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a RemediationRequest is created, updated or deleted, and
/// when a requeue timer expires.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<RemediationRequest>, ctx: Arc<ControllerState>) -> Result<Action> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<RemediationRequest> = Api::namespaced(ctx.client.clone(), &namespace);
    let key = key(&obj);

    info!(
        "Reconciling RemediationRequest {} (strategy: {})",
        key, obj.spec.remediation_strategy
    );

    let remediator = &ctx.remediator;
    let result = finalizer(&api, REMEDIATION_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(rr) => {
                let result = remediator.apply(&rr, chrono::Utc::now()).await;
                if let Err(e) = &result {
                    if !e.is_conflict() {
                        if let Err(write_err) = remediator.record_error(&rr, e).await {
                            debug!("Could not record lastError for {}: {}", key, write_err);
                        }
                    }
                }
                result
            }
            FinalizerEvent::Cleanup(rr) => remediator.cleanup(&rr).await,
        }
    })
    .await
    .map_err(Error::from);

    if result.is_ok() {
        ctx.failures.reset(&key);
    }
    result
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(rr: Arc<RemediationRequest>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    retry_action(&key(&rr), error, &ctx.failures)
}

fn retry_action(key: &str, error: &Error, failures: &FailureTracker) -> Action {
    if error.is_conflict() {
        debug!("Conflict on {}, retrying", key);
        return Action::requeue(CONFLICT_REQUEUE);
    }

    // Use shorter retry for retriable errors
    let delay = failures.record_failure(key, error.is_retriable());
    error!(
        "Reconciliation error for {}: {}, retrying in {:?}",
        key, error, delay
    );
    Action::requeue(delay)
}
