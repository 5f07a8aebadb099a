//! Site lifecycle endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ControlError;
use crate::orchestrator::SiteDetails;
use crate::store::SiteFilter;
use crate::types::{
    Actor, CloneSiteRequest, CreateBackupRequest, NewSiteRequest, Site, SiteBackup, SiteId,
    SiteStatus, UserId,
};

use super::deployments::{record_to_response, DeploymentResponse};
use super::{actor, api_error, ApiResult, AppState};

/// Query parameters for listing sites.
#[derive(Debug, Default, Deserialize)]
pub struct ListSitesQuery {
    /// Filter by owner.
    pub user_id: Option<String>,
    /// Filter by status.
    pub status: Option<String>,
    /// Maximum number of results.
    pub limit: Option<u32>,
}

/// Response for a workflow accepted for background execution.
#[derive(Debug, Serialize)]
pub struct SiteAccepted {
    /// Site the workflow runs against.
    pub site_id: String,
    /// Site status when the request returned.
    pub status: String,
    /// Workflow dispatched.
    pub workflow: String,
    /// Ledger entry recorded synchronously, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

/// Response for a restart.
#[derive(Debug, Serialize)]
pub struct RestartResponse {
    /// Whether the runtime restarted the container.
    pub restarted: bool,
}

/// Response for a log tail.
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    /// Log text, absent when the site has no container.
    pub logs: Option<String>,
}

/// Response for a storage refresh.
#[derive(Debug, Serialize)]
pub struct StorageResponse {
    /// Storage used in MB.
    pub storage_used_mb: u64,
}

/// Register a site and start provisioning it.
pub async fn create_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewSiteRequest>,
) -> ApiResult<(StatusCode, Json<SiteAccepted>)> {
    let actor = actor(&headers)?;
    let Actor::User(owner) = &actor else {
        return Err(api_error(&ControlError::internal("site owner must be a user")));
    };

    info!(
        domain = %request.domain,
        platform = %request.platform,
        owner = %owner,
        "creating site via API"
    );

    let orchestrator = &state.orchestrator;
    let site = orchestrator
        .register_site(request, owner)
        .await
        .map_err(|e| api_error(&e))?;
    let workflow = orchestrator
        .create_site(&site.id, &actor)
        .await
        .map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SiteAccepted {
            site_id: site.id.to_string(),
            status: SiteStatus::Creating.as_str().to_owned(),
            workflow: workflow.workflow().as_str().to_owned(),
            deployment_id: None,
        }),
    ))
}

/// List sites with optional filters.
pub async fn list_sites(
    State(state): State<AppState>,
    Query(query): Query<ListSitesQuery>,
) -> ApiResult<Json<Vec<Site>>> {
    let mut filter = SiteFilter::new();

    if let Some(user_id) = query.user_id {
        filter = filter.with_user(UserId::new(user_id));
    }
    if let Some(status) = query.status {
        let status: SiteStatus = status
            .to_lowercase()
            .parse()
            .map_err(|e: String| api_error(&ControlError::validation(e)))?;
        filter = filter.with_status(status);
    }
    if let Some(limit) = query.limit {
        filter = filter.with_limit(limit);
    }

    state
        .orchestrator
        .list_sites(&filter)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Get a site with its domains and databases.
pub async fn get_site(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SiteDetails>> {
    state
        .orchestrator
        .site_details(&SiteId::new(id))
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Start tearing a site down.
pub async fn delete_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<SiteAccepted>)> {
    let actor = actor(&headers)?;
    let site_id = SiteId::new(id);

    info!(site_id = %site_id, actor = %actor, "deleting site via API");

    let workflow = state
        .orchestrator
        .delete_site(&site_id, &actor)
        .await
        .map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SiteAccepted {
            site_id: site_id.to_string(),
            status: SiteStatus::Deleting.as_str().to_owned(),
            workflow: workflow.workflow().as_str().to_owned(),
            deployment_id: None,
        }),
    ))
}

/// Run the create workflow again for a site in `error`.
pub async fn retry_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<SiteAccepted>)> {
    let actor = actor(&headers)?;
    let site_id = SiteId::new(id);

    let workflow = state
        .orchestrator
        .create_site(&site_id, &actor)
        .await
        .map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SiteAccepted {
            site_id: site_id.to_string(),
            status: SiteStatus::Creating.as_str().to_owned(),
            workflow: workflow.workflow().as_str().to_owned(),
            deployment_id: None,
        }),
    ))
}

/// Clone a site under a new domain.
pub async fn clone_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CloneSiteRequest>,
) -> ApiResult<(StatusCode, Json<SiteAccepted>)> {
    let actor = actor(&headers)?;
    let source_id = SiteId::new(id);

    info!(source = %source_id, domain = %request.domain, "cloning site via API");

    let cloned = state
        .orchestrator
        .clone_site(&source_id, request, &actor)
        .await
        .map_err(|e| api_error(&e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SiteAccepted {
            site_id: cloned.site.id.to_string(),
            status: cloned.site.status.as_str().to_owned(),
            workflow: cloned.workflow.workflow().as_str().to_owned(),
            deployment_id: Some(cloned.deployment.data.id.to_string()),
        }),
    ))
}

/// Create a backup.
pub async fn create_backup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CreateBackupRequest>,
) -> ApiResult<(StatusCode, Json<SiteBackup>)> {
    let actor = actor(&headers)?;
    state
        .orchestrator
        .create_backup(&SiteId::new(id), request, &actor)
        .await
        .map(|backup| (StatusCode::CREATED, Json(backup)))
        .map_err(|e| api_error(&e))
}

/// List a site's backups.
pub async fn list_backups(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<SiteBackup>>> {
    state
        .orchestrator
        .list_backups(&SiteId::new(id))
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

/// Restart a site's container.
pub async fn restart_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<RestartResponse>> {
    let actor = actor(&headers)?;
    state
        .orchestrator
        .restart_site(&SiteId::new(id), &actor)
        .await
        .map(|restarted| Json(RestartResponse { restarted }))
        .map_err(|e| api_error(&e))
}

/// Suspend an active site.
pub async fn suspend_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentResponse>> {
    let actor = actor(&headers)?;
    state
        .orchestrator
        .suspend_site(&SiteId::new(id), &actor)
        .await
        .map(|record| Json(record_to_response(record)))
        .map_err(|e| api_error(&e))
}

/// Resume a suspended site.
pub async fn resume_site(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentResponse>> {
    let actor = actor(&headers)?;
    state
        .orchestrator
        .resume_site(&SiteId::new(id), &actor)
        .await
        .map(|record| Json(record_to_response(record)))
        .map_err(|e| api_error(&e))
}

/// Tail of the site's container logs.
pub async fn site_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LogsResponse>> {
    state
        .orchestrator
        .site_logs(&SiteId::new(id))
        .await
        .map(|logs| Json(LogsResponse { logs }))
        .map_err(|e| api_error(&e))
}

/// Recompute a site's storage usage.
pub async fn refresh_storage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<StorageResponse>> {
    actor(&headers)?;
    state
        .orchestrator
        .update_storage_usage(&SiteId::new(id))
        .await
        .map(|storage_used_mb| Json(StorageResponse { storage_used_mb }))
        .map_err(|e| api_error(&e))
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_app_state;
    use super::super::{router, ACTOR_HEADER};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn post_json(uri: &str, body: &Value, user: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(ACTOR_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_site(domain: &str) -> Value {
        json!({
            "name": "Blog",
            "domain": domain,
            "platform": "hugo",
        })
    }

    #[tokio::test]
    async fn create_requires_actor() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_app_state(dir.path()));

        let response = app
            .oneshot(post_json("/sites", &new_site("blog.example.com"), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_is_accepted_and_provisions() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());
        let app = router(state.clone());

        let response = app
            .oneshot(post_json(
                "/sites",
                &new_site("blog.example.com"),
                Some("user-1"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "creating");
        assert_eq!(body["workflow"], "create");

        state.orchestrator.dispatcher().shutdown().await;
        let site_id = crate::types::SiteId::new(body["site_id"].as_str().unwrap());
        let site = state.orchestrator.get_site(&site_id).await.unwrap();
        assert_eq!(site.status, crate::types::SiteStatus::Active);
    }

    #[tokio::test]
    async fn duplicate_domain_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_app_state(dir.path()));

        let first = app
            .clone()
            .oneshot(post_json(
                "/sites",
                &new_site("blog.example.com"),
                Some("user-1"),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app
            .oneshot(post_json(
                "/sites",
                &new_site("Blog.Example.com."),
                Some("user-2"),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_site_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/sites/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_without_container_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let state = make_app_state(dir.path());
        let site = state
            .orchestrator
            .register_site(
                serde_json::from_value(new_site("shop.example.com")).unwrap(),
                &crate::types::UserId::new("user-1"),
            )
            .await
            .unwrap();

        let response = router(state)
            .oneshot(post_json(
                &format!("/sites/{}/restart", site.id),
                &json!({}),
                Some("user-1"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
