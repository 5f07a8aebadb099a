//! Provisioners for the subsystems backing a site.
//!
//! Each subsystem sits behind a trait at its external boundary (tenant
//! database engine, container runtime, certificate issuer, DNS) so the live
//! implementations can be swapped for the in-process doubles in [`mock`].

pub mod container;
pub mod database;
pub mod dns;
pub mod domain;
pub mod filesystem;
pub mod mock;
mod mysql;
pub mod ssl;

pub use container::{container_name, ContainerManager, DockerContainerManager, SiteContainer};
pub use database::{DatabaseProvisioner, DropOutcome, TenantEngine};
pub use dns::{DnsProvider, DnsVerifier, HickoryVerifier, LoggingDnsProvider};
pub use domain::DomainManager;
pub use filesystem::{ArchiveSource, FilesystemProvisioner, TemplateOutcome};
pub use mysql::MySqlEngine;
pub use ssl::{
    CertificateIssuer, HttpProbe, IssuedCertificate, ProxyConfigurator, ReachabilityProbe,
    SelfSignedIssuer,
};

use std::sync::Arc;

use tracing::info;

use crate::config::{HostplaneConfig, ProvisionerType};
use crate::error::ControlResult;
use crate::store::SiteStore;

/// The provisioners the orchestrator sequences.
#[derive(Clone)]
pub struct Provisioners {
    /// Tenant databases.
    pub databases: Arc<DatabaseProvisioner>,
    /// Site containers.
    pub containers: Arc<dyn ContainerManager>,
    /// Domains and certificates.
    pub domains: Arc<DomainManager>,
    /// Site file trees and archives.
    pub filesystem: Arc<FilesystemProvisioner>,
}

impl std::fmt::Debug for Provisioners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioners")
            .field("databases", &self.databases)
            .field("domains", &self.domains)
            .field("filesystem", &self.filesystem)
            .finish_non_exhaustive()
    }
}

/// Create provisioners from configuration.
pub fn create_provisioners(
    config: &HostplaneConfig,
    store: Arc<dyn SiteStore>,
) -> ControlResult<Provisioners> {
    let filesystem = Arc::new(FilesystemProvisioner::new(&config.storage));

    let (engine, containers, issuer, probe, verifier): (
        Arc<dyn TenantEngine>,
        Arc<dyn ContainerManager>,
        Arc<dyn CertificateIssuer>,
        Arc<dyn ReachabilityProbe>,
        Arc<dyn DnsVerifier>,
    ) = match config.orchestrator.provisioners {
        ProvisionerType::Live => (
            Arc::new(MySqlEngine::new(config.mysql.clone())?),
            Arc::new(DockerContainerManager::new(&config.docker)),
            Arc::new(SelfSignedIssuer::new(&config.ssl)),
            Arc::new(HttpProbe::new(config.ssl.reachability_timeout())?),
            Arc::new(HickoryVerifier::new(config.dns.lookup_timeout())),
        ),
        ProvisionerType::Mock => (
            Arc::new(mock::MockEngine::new()),
            Arc::new(mock::MockContainerManager::new()),
            Arc::new(mock::MockIssuer::new(config.ssl.validity_days)),
            Arc::new(mock::StaticProbe::new(true)),
            Arc::new(mock::MockDnsVerifier::new()),
        ),
    };

    info!(provisioners = ?config.orchestrator.provisioners, "provisioners configured");

    let databases = Arc::new(DatabaseProvisioner::new(
        Arc::clone(&store),
        engine,
        config.mysql.site_host.clone(),
        config.mysql.site_port,
    ));

    let domains = Arc::new(
        DomainManager::new(store, issuer, probe, verifier, Arc::new(LoggingDnsProvider))
            .with_proxy(ProxyConfigurator::new(&config.ssl))
            .with_verification_prefix(config.dns.verification_prefix.clone())
            .with_renewal_threshold_days(config.ssl.renewal_threshold_days),
    );

    Ok(Provisioners {
        databases,
        containers,
        domains,
        filesystem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn mock_provisioners_build() {
        let mut config = HostplaneConfig::default();
        config.orchestrator.provisioners = ProvisionerType::Mock;

        let provisioners = create_provisioners(&config, Arc::new(MemoryStore::new())).unwrap();
        assert!(provisioners
            .containers
            .list_site_containers()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn live_provisioners_build_without_connecting() {
        let config = HostplaneConfig::default();
        assert!(create_provisioners(&config, Arc::new(MemoryStore::new())).is_ok());
    }
}
