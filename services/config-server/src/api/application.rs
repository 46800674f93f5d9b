//! Per-application endpoints.
//!
//! Mounted under
//! `/application/v2/tenant/{tenant}/application/{application}/instance/{instance}`.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use fleet_id::ApplicationId;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use crate::convergence::{ApplicationConvergence, ServiceConvergence};
use crate::reindexing::ApplicationReindexing;
use crate::state::AppState;

/// Path prefix of every route in this module.
pub const APPLICATION_PATH: &str =
    "/application/v2/tenant/{tenant}/application/{application}/instance/{instance}";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/reindexing",
            get(reindexing_status)
                .post(enable_reindexing)
                .delete(disable_reindexing),
        )
        .route("/reindex", post(reindex))
        .route("/serviceconverge", get(list_service_convergence))
        .route("/serviceconverge/{host_and_port}", get(service_convergence))
}

#[derive(Debug, Deserialize)]
struct ApplicationPath {
    tenant: String,
    application: String,
    instance: String,
}

impl ApplicationPath {
    fn id(&self) -> Result<ApplicationId, ApiError> {
        ApplicationId::from_parts(&self.tenant, &self.application, &self.instance)
            .map_err(|e| ApiError::bad_request("invalid_application_id", e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ServicePath {
    tenant: String,
    application: String,
    instance: String,
    host_and_port: String,
}

impl ServicePath {
    fn id(&self) -> Result<ApplicationId, ApiError> {
        ApplicationId::from_parts(&self.tenant, &self.application, &self.instance)
            .map_err(|e| ApiError::bad_request("invalid_application_id", e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ReindexQuery {
    /// Comma-separated cluster names.
    cluster: Option<String>,
    /// Comma-separated document type names.
    #[serde(rename = "type")]
    document_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

async fn reindexing_status(
    State(state): State<AppState>,
    Path(path): Path<ApplicationPath>,
) -> Result<Json<ApplicationReindexing>, ApiError> {
    let id = path.id()?;
    let status = state
        .tenants()
        .reindexing()
        .find(&id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(
                "reindexing_status_not_found",
                format!("Reindexing status not found for {id}"),
            )
        })?;
    Ok(Json(status))
}

async fn enable_reindexing(
    State(state): State<AppState>,
    Path(path): Path<ApplicationPath>,
) -> Result<Json<MessageResponse>, ApiError> {
    set_enabled(&state, &path.id()?, true).await
}

async fn disable_reindexing(
    State(state): State<AppState>,
    Path(path): Path<ApplicationPath>,
) -> Result<Json<MessageResponse>, ApiError> {
    set_enabled(&state, &path.id()?, false).await
}

async fn set_enabled(state: &AppState, id: &ApplicationId, enabled: bool) -> Result<Json<MessageResponse>, ApiError> {
    state.tenants().require(id).await?;
    state
        .tenants()
        .reindexing()
        .modify(id, |r| r.with_enabled(enabled))
        .await?;
    let verb = if enabled { "Enabled" } else { "Disabled" };
    info!(application = %id, enabled, "Changed reindexing");
    Ok(Json(MessageResponse {
        message: format!("{verb} reindexing of {id}"),
    }))
}

/// Marks the selected document types pending on the current generation.
async fn reindex(
    State(state): State<AppState>,
    Path(path): Path<ApplicationPath>,
    Query(query): Query<ReindexQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = path.id()?;
    let record = state.tenants().require(&id).await?;
    let clusters = split_names(query.cluster.as_deref());
    let types = split_names(query.document_type.as_deref());
    let targets = record.document_types(&clusters, &types)?;

    let generation = record.generation;
    state
        .tenants()
        .reindexing()
        .modify(&id, |mut reindexing| {
            for (cluster, document_type) in &targets {
                reindexing = reindexing.with_pending(cluster, document_type, generation);
            }
            reindexing
        })
        .await?;

    let described: Vec<String> = targets
        .iter()
        .map(|(cluster, document_type)| format!("{cluster}/{document_type}"))
        .collect();
    info!(application = %id, generation, targets = ?described, "Requested reindexing");
    Ok(Json(MessageResponse {
        message: format!(
            "Reindexing [{}] of {id} once generation {generation} has converged",
            described.join(", ")
        ),
    }))
}

async fn list_service_convergence(
    State(state): State<AppState>,
    Path(path): Path<ApplicationPath>,
) -> Result<Json<ApplicationConvergence>, ApiError> {
    let record = state.tenants().require(&path.id()?).await?;
    Ok(Json(state.convergence().check_services(&record).await))
}

async fn service_convergence(
    State(state): State<AppState>,
    Path(path): Path<ServicePath>,
) -> Result<Json<ServiceConvergence>, ApiError> {
    let record = state.tenants().require(&path.id()?).await?;
    let convergence = state
        .convergence()
        .check_service(&record, &path.host_and_port)
        .await?;
    Ok(Json(convergence))
}

/// Splits a comma-separated list, dropping blank entries.
fn split_names(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}
