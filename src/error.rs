//! Central error types for self-fence
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Central error type for the agent and the remediation controller
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer-related error during cleanup
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The time to assume a node rebooted could not be computed
    #[error("Safe time calculation failed: {0}")]
    SafeTimeError(String),

    /// Optimistic concurrency collision while writing a resource
    #[error("Conflict writing {kind}/{name}")]
    Conflict { kind: String, name: String },

    /// The node targeted by a remediation does not exist
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Watchdog device error
    #[error("Watchdog error: {0}")]
    WatchdogError(String),

    /// The reboot mechanism could not be engaged
    #[error("Reboot failed: {0}")]
    RebootError(String),

    /// Peer health query error
    #[error("Peer error: {0}")]
    PeerError(String),

    /// HTTP request error (from reqwest)
    #[error("HTTP request error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Request timed out before an answer arrived
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for self-fence operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Check if this error type should trigger a fast retry
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::FinalizerError(_)
                | Error::Conflict { .. }
                | Error::HttpError(_)
                | Error::Timeout(_)
        )
    }

    /// Whether the error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::KubeError(e) => is_kube_conflict(e),
            _ => false,
        }
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::SafeTimeError(msg) => {
                format!("Cannot compute time to assume node rebooted: {}", msg)
            }
            Error::NodeNotFound(name) => format!("Node {} not found", name),
            Error::HttpError(e) => format!("HTTP request failed: {}", e),
            _ => self.to_string(),
        }
    }
}

/// Returns true when a kube error is an API 404
pub fn is_kube_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Returns true when a kube error is an API 409
pub fn is_kube_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 409)
}

/// Await an API call, failing with [`Error::Timeout`] once `timeout` passes
pub async fn with_deadline<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

// Implement From for kube::runtime::finalizer::Error to enable ? operator
impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_retriable() {
        let err = Error::Conflict {
            kind: "RemediationRequest".to_string(),
            name: "n1".to_string(),
        };
        assert!(err.is_conflict());
        assert!(err.is_retriable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_gives_up_on_silent_call() {
        let started = tokio::time::Instant::now();
        let result: Result<()> =
            with_deadline(Duration::from_secs(5), futures::future::pending()).await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let ok = with_deadline(Duration::from_secs(5), async { Ok::<_, Error>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<()> = with_deadline(Duration::from_secs(5), async {
            Err(Error::NodeNotFound("worker-1".to_string()))
        })
        .await;
        assert!(matches!(err, Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn test_safe_time_error_is_not_fast_retried() {
        let err = Error::SafeTimeError("threshold overflow".to_string());
        assert!(!err.is_retriable());
        assert!(err.status_message().contains("threshold overflow"));
    }
}
