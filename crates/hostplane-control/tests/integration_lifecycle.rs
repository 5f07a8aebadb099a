//! Integration tests for site create, delete and clone workflows.

mod common;

use common::{fixtures, TestPlatform};
use hostplane_control::types::{DeploymentStatus, DeploymentType, SiteStatus};
use hostplane_control::ControlError;

#[tokio::test]
async fn create_provisions_every_subsystem() {
    let platform = TestPlatform::new();
    platform.add_template_file("wordpress", "default", "index.php", "<?php echo 'hi';");

    let (site, record) = platform.create_site("blog.example.com", "wordpress").await;

    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(record.data.deployment_type, DeploymentType::Create);
    assert_eq!(record.data.message.as_deref(), Some("Site created successfully"));
    assert!(record.data.completed_at.is_some());

    assert_eq!(site.status, SiteStatus::Active);
    let container_id = site.container().unwrap();
    assert!(platform.containers.is_running(container_id));
    assert!(site.container_port.is_some());

    let site_dir = platform.site_dir(&site);
    assert!(site_dir.join("public").is_dir());
    assert!(site_dir.join("index.php").is_file());

    let details = platform.orchestrator.site_details(&site.id).await.unwrap();
    assert_eq!(details.databases.len(), 1);
    assert!(platform.engine.exists(&details.databases[0].database_name));

    let domain = &details.domains[0];
    assert!(domain.is_primary);
    assert!(domain.dns_verified);
    assert!(domain.ssl_enabled);
    assert!(platform.issuer.has_certificate("blog.example.com"));
}

#[tokio::test]
async fn failing_database_still_activates_site() {
    let platform = TestPlatform::new();
    platform.engine.set_failing(true);

    let (site, record) = platform.create_site("docs.example.com", "hugo").await;

    assert_eq!(site.status, SiteStatus::Active);
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert!(platform
        .store_databases(&site.id)
        .await
        .is_empty());
}

#[tokio::test]
async fn unreachable_domain_skips_certificate() {
    let platform = TestPlatform::new();
    platform.probe.set_reachable(false);

    let (site, record) = platform.create_site("quiet.example.com", "hugo").await;

    assert_eq!(site.status, SiteStatus::Active);
    assert_eq!(record.status, DeploymentStatus::Completed);
    let details = platform.orchestrator.site_details(&site.id).await.unwrap();
    assert!(!details.domains[0].ssl_enabled);
}

#[tokio::test]
async fn failed_create_marks_site_error_and_can_retry() {
    let platform = TestPlatform::new();
    platform.containers.set_failing(true);

    let (site, record) = platform.create_site("retry.example.com", "wordpress").await;

    assert_eq!(site.status, SiteStatus::Error);
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record
        .data
        .message
        .as_deref()
        .unwrap()
        .starts_with("Error:"));
    // Completed steps are kept
    assert!(platform.site_dir(&site).join("public").is_dir());
    assert_eq!(platform.store_databases(&site.id).await.len(), 1);

    platform.containers.set_failing(false);
    let record = platform
        .orchestrator
        .create_site(&site.id, &fixtures::actor())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(platform.site(&site.id).await.status, SiteStatus::Active);
    assert_eq!(platform.store_databases(&site.id).await.len(), 1);

    let ledger = platform
        .orchestrator
        .list_deployments(&site.id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 2);
}

#[tokio::test]
async fn create_on_active_site_is_rejected() {
    let platform = TestPlatform::new();
    let (site, _) = platform.create_site("live.example.com", "hugo").await;

    let err = platform
        .orchestrator
        .create_site(&site.id, &fixtures::actor())
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn duplicate_domain_is_rejected_before_provisioning() {
    let platform = TestPlatform::new();
    platform.create_site("taken.example.com", "hugo").await;

    let err = platform
        .orchestrator
        .register_site(
            fixtures::new_site("TAKEN.example.com.", "wordpress"),
            &fixtures::owner(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Conflict(_)));
    assert_eq!(platform.containers.container_count(), 1);
    assert_eq!(platform.engine.database_count(), 1);
}

#[tokio::test]
async fn per_user_site_limit_is_enforced() {
    let platform = TestPlatform::with_config(|config| {
        config.orchestrator.max_sites_per_user = 1;
    });
    platform
        .orchestrator
        .register_site(fixtures::new_site("one.example.com", "hugo"), &fixtures::owner())
        .await
        .unwrap();

    let err = platform
        .orchestrator
        .register_site(fixtures::new_site("two.example.com", "hugo"), &fixtures::owner())
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Validation(_)));
}

#[tokio::test]
async fn invalid_domains_are_rejected() {
    let platform = TestPlatform::new();
    for domain in ["", "localhost", "bad domain.com", "-x.example.com"] {
        let err = platform
            .orchestrator
            .register_site(fixtures::new_site(domain, "hugo"), &fixtures::owner())
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)), "{domain}: {err}");
    }
}

#[tokio::test]
async fn delete_tears_everything_down() {
    let platform = TestPlatform::new();
    let (site, _) = platform.create_site("gone.example.com", "wordpress").await;
    let database = platform.store_databases(&site.id).await.remove(0);

    let workflow = platform
        .orchestrator
        .delete_site(&site.id, &fixtures::actor())
        .await
        .unwrap();
    assert_eq!(platform.site(&site.id).await.status, SiteStatus::Deleting);

    let record = workflow.wait().await.unwrap().unwrap();

    assert_eq!(record.status, DeploymentStatus::Completed);
    let site = platform.site(&site.id).await;
    assert_eq!(site.status, SiteStatus::Deleted);
    assert!(site.container().is_none());
    assert_eq!(platform.containers.container_count(), 0);
    assert!(!platform.engine.exists(&database.database_name));
    assert!(!platform.issuer.has_certificate("gone.example.com"));
    assert!(!platform.site_dir(&site).exists());

    let details = platform.orchestrator.site_details(&site.id).await.unwrap();
    assert!(details.domains.is_empty());
    assert!(details.databases.is_empty());

    // The deleted site keeps its domain
    let err = platform
        .orchestrator
        .register_site(fixtures::new_site("gone.example.com", "hugo"), &fixtures::owner())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Conflict(_)));
}

#[tokio::test]
async fn delete_with_failing_runtime_still_deletes() {
    let platform = TestPlatform::new();
    let (site, _) = platform.create_site("broken.example.com", "wordpress").await;
    platform.containers.set_failing(true);

    let record = platform
        .orchestrator
        .delete_site(&site.id, &fixtures::actor())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.status, DeploymentStatus::Failed);
    let message = record.data.message.unwrap();
    assert!(message.starts_with("Site deleted with errors"), "{message}");
    assert!(message.contains("container"), "{message}");

    let site = platform.site(&site.id).await;
    assert_eq!(site.status, SiteStatus::Deleted);
    assert!(platform.store_databases(&site.id).await.is_empty());
    assert!(!platform.site_dir(&site).exists());
}

#[tokio::test]
async fn deleted_site_cannot_be_deleted_again() {
    let platform = TestPlatform::new();
    let (site, _) = platform.create_site("twice.example.com", "hugo").await;
    platform
        .orchestrator
        .delete_site(&site.id, &fixtures::actor())
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
        .unwrap();

    let err = platform
        .orchestrator
        .delete_site(&site.id, &fixtures::actor())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn busy_site_rejects_second_workflow() {
    let platform = TestPlatform::new();
    let (site, _) = platform.create_site("busy.example.com", "hugo").await;

    let _lease = platform
        .orchestrator
        .dispatcher()
        .try_acquire(&site.id, DeploymentType::Backup)
        .unwrap();

    let err = platform
        .orchestrator
        .delete_site(&site.id, &fixtures::actor())
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::SiteBusy { workflow: "backup", .. }));
    assert_eq!(platform.site(&site.id).await.status, SiteStatus::Active);
}

#[tokio::test]
async fn clone_copies_files_without_databases() {
    let platform = TestPlatform::new();
    let (source, _) = platform.create_site("prod.example.com", "wordpress").await;
    let source_dir = platform.site_dir(&source);
    std::fs::write(source_dir.join("public/index.html"), "<h1>prod</h1>").unwrap();
    std::fs::write(source_dir.join("private/settings.ini"), "debug=false").unwrap();

    let cloned = platform
        .orchestrator
        .clone_site(
            &source.id,
            fixtures::clone_request("staging.example.com", false, true),
            &fixtures::actor(),
        )
        .await
        .unwrap();

    assert_eq!(cloned.deployment.data.site_id, source.id);
    assert_eq!(cloned.deployment.data.deployment_type, DeploymentType::Clone);
    assert_eq!(cloned.deployment.status, DeploymentStatus::Completed);
    assert_eq!(cloned.site.status, SiteStatus::Creating);

    let record = cloned.workflow.wait().await.unwrap().unwrap();
    assert_eq!(record.status, DeploymentStatus::Completed);
    assert_eq!(record.data.initiated_by, "system");

    let target = platform.site(&cloned.site.id).await;
    assert_eq!(target.status, SiteStatus::Active);
    assert_eq!(target.user_id, source.user_id);
    assert_eq!(target.platform, source.platform);
    assert!(platform.store_databases(&target.id).await.is_empty());

    let target_dir = platform.site_dir(&target);
    assert_eq!(
        std::fs::read_to_string(target_dir.join("public/index.html")).unwrap(),
        "<h1>prod</h1>"
    );
    assert_eq!(
        std::fs::read_to_string(target_dir.join("private/settings.ini")).unwrap(),
        "debug=false"
    );
}

#[tokio::test]
async fn clone_copies_databases() {
    let platform = TestPlatform::new();
    let (source, _) = platform.create_site("shop.example.com", "wordpress").await;
    let source_db = platform.store_databases(&source.id).await.remove(0);
    platform.engine.add_table(&source_db.database_name, "orders");

    let cloned = platform
        .orchestrator
        .clone_site(
            &source.id,
            fixtures::clone_request("shop-staging.example.com", true, false),
            &fixtures::actor(),
        )
        .await
        .unwrap();
    cloned.workflow.wait().await.unwrap().unwrap();

    let databases = platform.store_databases(&cloned.site.id).await;
    assert_eq!(databases.len(), 1);
    assert_ne!(databases[0].database_name, source_db.database_name);
    let tables = platform
        .orchestrator
        .provisioners()
        .databases
        .list_tables(&databases[0].id)
        .await
        .unwrap();
    assert_eq!(tables, vec!["orders".to_owned()]);
}

#[tokio::test]
async fn clone_to_taken_domain_fails_without_side_effects() {
    let platform = TestPlatform::new();
    let (source, _) = platform.create_site("a.example.com", "hugo").await;
    platform.create_site("b.example.com", "hugo").await;

    let err = platform
        .orchestrator
        .clone_site(
            &source.id,
            fixtures::clone_request("b.example.com", true, true),
            &fixtures::actor(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::Conflict(_)));
    let ledger = platform
        .orchestrator
        .list_deployments(&source.id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 1);
}
