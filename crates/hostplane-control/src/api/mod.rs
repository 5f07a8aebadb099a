//! HTTP API for the control service.
//!
//! Provides endpoints for:
//! - Site lifecycle (register, delete, clone, backup, restart, suspend)
//! - Domain verification and certificates
//! - Deployment ledger queries
//! - Health and readiness checks
//! - Prometheus metrics

mod deployments;
mod domains;
mod sites;

use std::fmt::Write as _;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::ControlError;
use crate::orchestrator::SiteOrchestrator;
use crate::types::Actor;

pub use deployments::{DeploymentResponse, ListDeploymentsQuery};
pub use sites::{ListSitesQuery, SiteAccepted};

/// Header carrying the id of the user a request acts for.
pub const ACTOR_HEADER: &str = "x-hostplane-user";

/// Shared application state for the control service.
#[derive(Clone)]
pub struct AppState {
    /// Orchestrator for site workflows.
    pub orchestrator: Arc<SiteOrchestrator>,
}

/// Creates the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Sites
        .route("/sites", post(sites::create_site).get(sites::list_sites))
        .route(
            "/sites/{id}",
            get(sites::get_site).delete(sites::delete_site),
        )
        .route("/sites/{id}/provision", post(sites::retry_create))
        .route("/sites/{id}/clone", post(sites::clone_site))
        .route(
            "/sites/{id}/backups",
            post(sites::create_backup).get(sites::list_backups),
        )
        .route("/sites/{id}/restart", post(sites::restart_site))
        .route("/sites/{id}/suspend", post(sites::suspend_site))
        .route("/sites/{id}/resume", post(sites::resume_site))
        .route("/sites/{id}/logs", get(sites::site_logs))
        .route("/sites/{id}/storage", post(sites::refresh_storage))
        .route("/sites/{id}/deployments", get(deployments::site_deployments))
        // Domains
        .route("/domains/expiring", get(domains::expiring))
        .route("/domains/{id}/verify", post(domains::verify_dns))
        .route(
            "/domains/{id}/ssl",
            post(domains::setup_ssl).delete(domains::remove_ssl),
        )
        .route("/domains/{id}/ssl/renew", post(domains::renew_ssl))
        // Deployments
        .route("/deployments", get(deployments::list_deployments))
        .route("/deployments/{id}", get(deployments::get_deployment))
        // Metrics
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(error: &ControlError) -> ApiError {
    (
        error_to_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

const fn error_to_status(error: &ControlError) -> StatusCode {
    match error {
        ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::Conflict(_)
        | ControlError::SiteBusy { .. }
        | ControlError::NotProvisioned(_)
        | ControlError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Read the acting user from the request headers.
fn actor(headers: &HeaderMap) -> ApiResult<Actor> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(Actor::user)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: format!("missing {ACTOR_HEADER} header"),
                }),
            )
        })
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Readiness check endpoint.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    match state.orchestrator.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                running_workflows: state.orchestrator.dispatcher().in_flight(),
            }),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                running_workflows: 0,
            }),
        ),
    }
}

/// Metrics endpoint.
async fn metrics(State(state): State<AppState>) -> String {
    let mut output = String::new();
    let (sites, deployments) = state
        .orchestrator
        .status_counts()
        .await
        .unwrap_or_default();

    output.push_str("# HELP hostplane_sites_total Number of sites by status\n");
    output.push_str("# TYPE hostplane_sites_total gauge\n");
    for status in crate::types::SiteStatus::ALL {
        let count = count_of(&sites, status);
        let _ = writeln!(output, "hostplane_sites_total{{status=\"{status}\"}} {count}");
    }

    output.push_str("# HELP hostplane_deployments_total Number of deployments by status\n");
    output.push_str("# TYPE hostplane_deployments_total gauge\n");
    for status in crate::types::DeploymentStatus::ALL {
        let count = count_of(&deployments, status);
        let _ = writeln!(
            output,
            "hostplane_deployments_total{{status=\"{status}\"}} {count}"
        );
    }

    output.push_str("# HELP hostplane_workflows_running Workflows currently holding a site\n");
    output.push_str("# TYPE hostplane_workflows_running gauge\n");
    let _ = writeln!(
        output,
        "hostplane_workflows_running {}",
        state.orchestrator.dispatcher().in_flight()
    );

    output
}

fn count_of<S: PartialEq>(counts: &[(S, u64)], status: &S) -> u64 {
    counts
        .iter()
        .find(|(s, _)| s == status)
        .map_or(0, |(_, n)| *n)
}

/// Health response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness response.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    running_workflows: usize,
}
