//! REST API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kube::api::Api;
use tracing::warn;

use super::dto::{ErrorResponse, RemediationSummary};
use super::server::ApiState;
use crate::crd::RemediationRequest;
use crate::error::is_kube_not_found;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, message: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
}

/// Liveness probe
pub async fn health() -> &'static str {
    "ok"
}

/// Prometheus scrape endpoint
pub async fn metrics() -> String {
    crate::metrics::encode_registry()
}

/// `GET /api/v1/remediations`
pub async fn list_remediations(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<RemediationSummary>>, ApiError> {
    let api: Api<RemediationRequest> = Api::all(state.client.clone());
    let list = api.list(&Default::default()).await.map_err(|e| {
        warn!("Failed to list remediations: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "list_failed", e.to_string())
    })?;
    Ok(Json(list.items.iter().map(RemediationSummary::from).collect()))
}

/// `GET /api/v1/remediations/:namespace/:node`
pub async fn get_remediation(
    State(state): State<Arc<ApiState>>,
    Path((namespace, node)): Path<(String, String)>,
) -> Result<Json<RemediationSummary>, ApiError> {
    let api: Api<RemediationRequest> = Api::namespaced(state.client.clone(), &namespace);
    match api.get(&node).await {
        Ok(rr) => Ok(Json(RemediationSummary::from(&rr))),
        Err(e) if is_kube_not_found(&e) => Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No remediation for {}/{}", namespace, node),
        )),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "get_failed",
            e.to_string(),
        )),
    }
}
