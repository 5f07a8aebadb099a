//! Domain verification and certificate endpoints.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Domain, DomainId};

use super::{actor, api_error, ApiResult, AppState};

/// Result of a domain operation.
#[derive(Debug, Serialize)]
pub struct DomainOutcome {
    /// Domain operated on.
    pub domain_id: String,
    /// Whether the operation took effect.
    pub success: bool,
}

/// Query parameters for listing expiring certificates.
#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    /// Window in days.
    #[serde(default = "default_days")]
    pub days: u32,
}

const fn default_days() -> u32 {
    30
}

/// Check the domain's verification TXT record.
pub async fn verify_dns(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DomainOutcome>> {
    actor(&headers)?;
    let domain_id = DomainId::new(id);
    let success = state
        .orchestrator
        .provisioners()
        .domains
        .verify_dns(&domain_id)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(outcome(&domain_id, success))
}

/// Issue and install a certificate.
pub async fn setup_ssl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DomainOutcome>> {
    let actor = actor(&headers)?;
    let domain_id = DomainId::new(id);
    info!(domain_id = %domain_id, actor = %actor, "requesting certificate via API");
    let success = state
        .orchestrator
        .provisioners()
        .domains
        .setup_ssl_certificate(&domain_id)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(outcome(&domain_id, success))
}

/// Renew a certificate close to expiry.
pub async fn renew_ssl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DomainOutcome>> {
    actor(&headers)?;
    let domain_id = DomainId::new(id);
    let success = state
        .orchestrator
        .provisioners()
        .domains
        .renew_ssl_certificate(&domain_id)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(outcome(&domain_id, success))
}

/// Remove a certificate and its proxy configuration.
pub async fn remove_ssl(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DomainOutcome>> {
    let actor = actor(&headers)?;
    let domain_id = DomainId::new(id);
    info!(domain_id = %domain_id, actor = %actor, "removing certificate via API");
    let success = state
        .orchestrator
        .provisioners()
        .domains
        .remove_ssl_certificate(&domain_id)
        .await
        .map_err(|e| api_error(&e))?;
    Ok(outcome(&domain_id, success))
}

/// Domains whose certificate expires within the window.
pub async fn expiring(
    State(state): State<AppState>,
    Query(query): Query<ExpiringQuery>,
) -> ApiResult<Json<Vec<Domain>>> {
    state
        .orchestrator
        .provisioners()
        .domains
        .expiring_certificates(query.days)
        .await
        .map(Json)
        .map_err(|e| api_error(&e))
}

fn outcome(domain_id: &DomainId, success: bool) -> Json<DomainOutcome> {
    Json(DomainOutcome {
        domain_id: domain_id.to_string(),
        success,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_app_state;
    use super::super::{router, ACTOR_HEADER};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn verify_unknown_domain_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/domains/missing/verify")
                    .header(ACTOR_HEADER, "user-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expiring_defaults_to_thirty_days() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(make_app_state(dir.path()));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/domains/expiring")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
