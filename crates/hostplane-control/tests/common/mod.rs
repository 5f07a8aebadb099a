//! Common test utilities for control plane integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostplane_control::api::AppState;
use hostplane_control::config::{HostplaneConfig, ProvisionerType};
use hostplane_control::provisioner::mock::{
    MockContainerManager, MockDnsVerifier, MockEngine, MockIssuer, StaticProbe,
};
use hostplane_control::provisioner::{
    DatabaseProvisioner, DomainManager, FilesystemProvisioner, LoggingDnsProvider, Provisioners,
};
use hostplane_control::store::{DeploymentStore, MemoryStore, SiteStore};
use hostplane_control::types::{DeploymentRecord, Site, SiteDatabase, SiteId};
use hostplane_control::SiteOrchestrator;
use tempfile::TempDir;

/// Orchestrator wired to in-memory state and mock backends under a
/// temporary directory.
pub struct TestPlatform {
    pub root: TempDir,
    pub config: HostplaneConfig,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<MockEngine>,
    pub containers: Arc<MockContainerManager>,
    pub issuer: Arc<MockIssuer>,
    pub probe: Arc<StaticProbe>,
    pub dns: Arc<MockDnsVerifier>,
    pub orchestrator: Arc<SiteOrchestrator>,
}

impl TestPlatform {
    /// Creates a platform with default configuration.
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Creates a platform after letting the caller adjust the configuration.
    pub fn with_config(adjust: impl FnOnce(&mut HostplaneConfig)) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = HostplaneConfig::default();
        config.orchestrator.provisioners = ProvisionerType::Mock;
        config.storage.sites_root = root.path().join("sites");
        config.storage.templates_root = root.path().join("templates");
        config.storage.backup_root = root.path().join("backups");
        config.ssl.cert_dir = root.path().join("certs");
        config.ssl.key_dir = root.path().join("keys");
        config.ssl.proxy_config_dir = None;
        adjust(&mut config);

        let store = Arc::new(MemoryStore::new());
        let sites: Arc<dyn SiteStore> = store.clone();
        let deployments: Arc<dyn DeploymentStore> = store.clone();

        let engine = Arc::new(MockEngine::new());
        let containers = Arc::new(MockContainerManager::new());
        let issuer = Arc::new(MockIssuer::new(config.ssl.validity_days));
        let probe = Arc::new(StaticProbe::new(true));
        let dns = Arc::new(MockDnsVerifier::new());

        let provisioners = Provisioners {
            databases: Arc::new(DatabaseProvisioner::new(
                Arc::clone(&sites),
                engine.clone(),
                "localhost",
                3306,
            )),
            containers: containers.clone(),
            domains: Arc::new(
                DomainManager::new(
                    Arc::clone(&sites),
                    issuer.clone(),
                    probe.clone(),
                    dns.clone(),
                    Arc::new(LoggingDnsProvider),
                )
                .with_renewal_threshold_days(config.ssl.renewal_threshold_days),
            ),
            filesystem: Arc::new(FilesystemProvisioner::new(&config.storage)),
        };

        let orchestrator = Arc::new(SiteOrchestrator::new(
            sites,
            deployments,
            provisioners,
            &config,
        ));

        Self {
            root,
            config,
            store,
            engine,
            containers,
            issuer,
            probe,
            dns,
            orchestrator,
        }
    }

    /// API state sharing this platform's orchestrator.
    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: Arc::clone(&self.orchestrator),
        }
    }

    /// Root of the temporary directory.
    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Writes a file into the template tree for `platform/template`.
    pub fn add_template_file(&self, platform: &str, template: &str, name: &str, contents: &str) {
        let path = self
            .config
            .storage
            .templates_root
            .join(platform)
            .join(template)
            .join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    /// Directory the site's files live in.
    pub fn site_dir(&self, site: &Site) -> PathBuf {
        self.config.storage.sites_root.join(site.id.as_str())
    }

    /// Registers a site and runs the create workflow to completion.
    pub async fn create_site(&self, domain: &str, platform: &str) -> (Site, DeploymentRecord) {
        let site = self
            .orchestrator
            .register_site(
                fixtures::new_site(domain, platform),
                &fixtures::owner(),
            )
            .await
            .unwrap();
        let record = self
            .orchestrator
            .create_site(&site.id, &fixtures::actor())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap()
            .unwrap();
        (self.site(&site.id).await, record)
    }

    /// Current state of a site.
    pub async fn site(&self, id: &SiteId) -> Site {
        self.orchestrator.get_site(id).await.unwrap()
    }

    /// Databases recorded for a site.
    pub async fn store_databases(&self, id: &SiteId) -> Vec<SiteDatabase> {
        self.store.list_databases(id).await.unwrap()
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}
