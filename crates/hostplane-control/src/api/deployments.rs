//! Deployment ledger endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::store::DeploymentFilter;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentType, SiteId};

use super::{api_error, ApiResult, AppState};

/// Query parameters for listing deployments.
#[derive(Debug, Default, Deserialize)]
pub struct ListDeploymentsQuery {
    /// Filter by site ID.
    pub site_id: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Filter by workflow type.
    #[serde(rename = "type")]
    pub deployment_type: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

/// Response for a deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    /// Deployment ID.
    pub id: String,
    /// Site the workflow ran against.
    pub site_id: String,
    /// Workflow type.
    #[serde(rename = "type")]
    pub deployment_type: String,
    /// Current status.
    pub status: String,
    /// Latest progress or result message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Who started the workflow.
    pub initiated_by: String,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
    /// When the workflow started running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the workflow reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Get a deployment by ID.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentResponse>> {
    state
        .orchestrator
        .get_deployment(&DeploymentId::new(id))
        .await
        .map(|record| Json(record_to_response(record)))
        .map_err(|e| api_error(&e))
}

/// List deployments with optional filters.
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> ApiResult<Json<Vec<DeploymentResponse>>> {
    let mut filter = DeploymentFilter::new();

    if let Some(site_id) = query.site_id {
        filter = filter.with_site(SiteId::new(site_id));
    }
    if let Some(status) = query.status {
        let status: DeploymentStatus = status
            .to_lowercase()
            .parse()
            .map_err(|e: String| api_error(&ControlError::validation(e)))?;
        filter = filter.with_status(status);
    }
    if let Some(kind) = query.deployment_type {
        let kind: DeploymentType = kind
            .to_lowercase()
            .parse()
            .map_err(|e: String| api_error(&ControlError::validation(e)))?;
        filter = filter.with_type(kind);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }
    if let Some(offset) = query.offset {
        filter = filter.with_offset(offset);
    }

    state
        .orchestrator
        .ledger()
        .list(&filter)
        .await
        .map(|records| Json(records.into_iter().map(record_to_response).collect()))
        .map_err(|e| api_error(&e))
}

/// Ledger of a single site, newest first.
pub async fn site_deployments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<DeploymentResponse>>> {
    let site_id = SiteId::new(id);
    let orchestrator = &state.orchestrator;
    orchestrator
        .get_site(&site_id)
        .await
        .map_err(|e| api_error(&e))?;

    orchestrator
        .list_deployments(&site_id)
        .await
        .map(|records| Json(records.into_iter().map(record_to_response).collect()))
        .map_err(|e| api_error(&e))
}

pub(super) fn record_to_response(record: DeploymentRecord) -> DeploymentResponse {
    DeploymentResponse {
        id: record.data.id.to_string(),
        site_id: record.data.site_id.to_string(),
        deployment_type: record.data.deployment_type.as_str().to_owned(),
        status: record.status.as_str().to_owned(),
        message: record.data.message,
        initiated_by: record.data.initiated_by,
        created_at: record.data.created_at.to_rfc3339(),
        updated_at: record.data.updated_at.to_rfc3339(),
        started_at: record.data.started_at.map(|t| t.to_rfc3339()),
        completed_at: record.data.completed_at.map(|t| t.to_rfc3339()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_app_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn list_deployments_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = super::super::router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = super::super::router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments?status=exploded")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_deployment_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = super::super::router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/deployments/nonexistent-id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
