//! Integration tests driving site workflows through the HTTP API.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::TestPlatform;
use hostplane_control::api::{router, ACTOR_HEADER};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(ACTOR_HEADER, common::fixtures::OWNER);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn site_lifecycle_over_http() {
    let platform = TestPlatform::new();
    let app = router(platform.app_state());

    let (status, accepted) = send(
        &app,
        "POST",
        "/sites",
        Some(json!({
            "name": "Shop",
            "domain": "shop.example.com",
            "platform": "wordpress",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let site_id = accepted["site_id"].as_str().unwrap().to_owned();

    platform.orchestrator.dispatcher().shutdown().await;

    let (status, site) = send(&app, "GET", &format!("/sites/{site_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(site["status"], "active");
    assert_eq!(site["domains"][0]["domain_name"], "shop.example.com");
    assert_eq!(site["databases"].as_array().unwrap().len(), 1);
    assert!(site["databases"][0].get("password").is_none());

    let (status, backup) = send(
        &app,
        "POST",
        &format!("/sites/{site_id}/backups"),
        Some(json!({ "description": "nightly" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(backup["includes_database"], true);

    let (status, backups) = send(&app, "GET", &format!("/sites/{site_id}/backups"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(backups.as_array().unwrap().len(), 1);

    let (status, restart) = send(&app, "POST", &format!("/sites/{site_id}/restart"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restart["restarted"], true);

    let (status, logs) = send(&app, "GET", &format!("/sites/{site_id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(logs["logs"].as_str().is_some());

    let (status, deleted) = send(&app, "DELETE", &format!("/sites/{site_id}"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(deleted["status"], "deleting");

    platform.orchestrator.dispatcher().shutdown().await;

    let (status, ledger) = send(&app, "GET", &format!("/sites/{site_id}/deployments"), None).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = ledger
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.len(), 4);
    for kind in ["create", "backup", "restart", "delete"] {
        assert!(kinds.contains(&kind), "{kinds:?}");
    }

    let deployment_id = ledger[0]["id"].as_str().unwrap();
    let (status, deployment) = send(&app, "GET", &format!("/deployments/{deployment_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deployment["initiated_by"], common::fixtures::OWNER);

    let (status, site) = send(&app, "GET", &format!("/sites/{site_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(site["status"], "deleted");
}

#[tokio::test]
async fn clone_over_http_returns_new_site() {
    let platform = TestPlatform::new();
    let (source, _) = platform.create_site("origin.example.com", "hugo").await;
    let app = router(platform.app_state());

    let (status, accepted) = send(
        &app,
        "POST",
        &format!("/sites/{}/clone", source.id),
        Some(json!({
            "name": "Copy",
            "domain": "copy.example.com",
            "clone_database": false,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_ne!(accepted["site_id"], source.id.as_str());
    assert!(accepted["deployment_id"].is_string());

    platform.orchestrator.dispatcher().shutdown().await;
    let (_, site) = send(
        &app,
        "GET",
        &format!("/sites/{}", accepted["site_id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(site["status"], "active");
    assert!(site["databases"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn suspend_conflicts_when_not_active() {
    let platform = TestPlatform::new();
    let site = platform
        .orchestrator
        .register_site(
            common::fixtures::new_site("fresh.example.com", "hugo"),
            &common::fixtures::owner(),
        )
        .await
        .unwrap();
    let app = router(platform.app_state());

    let (status, body) = send(&app, "POST", &format!("/sites/{}/suspend", site.id), None).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("creating"));
}
