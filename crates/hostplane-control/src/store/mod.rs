//! Persistent storage backends.
//!
//! Two traits split the persisted state: [`SiteStore`] holds sites and the
//! resources attached to them (domains, databases, backups), and
//! [`DeploymentStore`] holds the append-only deployment ledger. The primary
//! implementation uses PostgreSQL; [`MemoryStore`] is used for tests and as a
//! fallback when the database is unreachable.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::types::{
    BackupId, DatabaseId, DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentType,
    Domain, DomainId, Site, SiteBackup, SiteDatabase, SiteId, SiteStatus, UserId,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by site ID.
    pub site_id: Option<SiteId>,
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Filter by workflow kind.
    pub deployment_type: Option<DeploymentType>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            site_id: None,
            status: None,
            deployment_type: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by site ID.
    #[must_use]
    pub fn with_site(mut self, site_id: SiteId) -> Self {
        self.site_id = Some(site_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by workflow kind.
    #[must_use]
    pub const fn with_type(mut self, deployment_type: DeploymentType) -> Self {
        self.deployment_type = Some(deployment_type);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Filter criteria for listing sites.
#[derive(Debug, Clone, Default)]
pub struct SiteFilter {
    /// Filter by owning user.
    pub user_id: Option<UserId>,
    /// Filter by status.
    pub status: Option<SiteStatus>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl SiteFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user_id: None,
            status: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by owning user.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: SiteStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Check a ledger update against the stored status.
pub(crate) fn check_transition(
    stored: DeploymentStatus,
    from: DeploymentStatus,
    to: DeploymentStatus,
) -> ControlResult<()> {
    if stored != from || (from != to && !from.can_transition_to(to)) || stored.is_terminal() {
        return Err(ControlError::InvalidStateTransition {
            from: stored.as_str(),
            to: to.as_str(),
        });
    }
    Ok(())
}

/// Backend for the deployment ledger.
///
/// Records are never deleted. Status updates are compare-and-set so the
/// persisted sequence stays monotonic even with concurrent writers.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record.
    ///
    /// Returns an error if a deployment with the same ID already exists.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Persist `record`, which was derived from a stored record in status
    /// `from`.
    ///
    /// Fails with `InvalidStateTransition` if the stored status is no longer
    /// `from`, or if `from -> record.status` is not a legal move. Keeping the
    /// status unchanged is allowed and updates the message only.
    async fn update(&self, record: &DeploymentRecord, from: DeploymentStatus)
        -> ControlResult<()>;

    /// List deployments matching the filter, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Number of deployments per status.
    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>>;
}

/// Backend for sites and their attached resources.
#[async_trait]
pub trait SiteStore: Send + Sync {
    /// Check that the backend is reachable.
    async fn ping(&self) -> ControlResult<()> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sites
    // -------------------------------------------------------------------------

    /// Atomically insert a site and its primary domain.
    ///
    /// Fails with `Conflict` if the domain name is taken, and with
    /// `Validation` if the owner already has `max_sites_per_user`
    /// non-deleted sites.
    async fn register_site(
        &self,
        site: &Site,
        primary_domain: &Domain,
        max_sites_per_user: u32,
    ) -> ControlResult<()>;

    /// Get a site by ID.
    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<Site>>;

    /// Overwrite a site. Fails with `NotFound` if it does not exist.
    async fn update_site(&self, site: &Site) -> ControlResult<()>;

    /// List sites matching the filter, newest first.
    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<Site>>;

    /// Number of sites per status.
    async fn count_sites_by_status(&self) -> ControlResult<Vec<(SiteStatus, u64)>>;

    // -------------------------------------------------------------------------
    // Domains
    // -------------------------------------------------------------------------

    /// Whether the domain name is taken, either by a domain row or as the
    /// domain a site was registered with. Deleted sites keep their domain.
    async fn domain_in_use(&self, domain_name: &str) -> ControlResult<bool>;

    /// Get a domain by ID.
    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<Domain>>;

    /// Overwrite a domain. Fails with `NotFound` if it does not exist.
    async fn update_domain(&self, domain: &Domain) -> ControlResult<()>;

    /// Domains attached to a site, primary first.
    async fn list_domains(&self, site_id: &SiteId) -> ControlResult<Vec<Domain>>;

    /// Remove every domain of a site. Returns the number removed.
    async fn delete_domains(&self, site_id: &SiteId) -> ControlResult<u64>;

    /// Domains with a certificate expiring before `before`.
    async fn domains_expiring_before(&self, before: DateTime<Utc>) -> ControlResult<Vec<Domain>>;

    // -------------------------------------------------------------------------
    // Databases
    // -------------------------------------------------------------------------

    /// Whether a tenant database already uses the name.
    async fn database_name_in_use(&self, database_name: &str) -> ControlResult<bool>;

    /// Whether a tenant database already uses the login name.
    async fn database_username_in_use(&self, username: &str) -> ControlResult<bool>;

    /// Insert a tenant database. Fails with `Conflict` if the name is taken.
    async fn insert_database(&self, database: &SiteDatabase) -> ControlResult<()>;

    /// Get a tenant database by ID.
    async fn get_database(&self, id: &DatabaseId) -> ControlResult<Option<SiteDatabase>>;

    /// Tenant databases attached to a site.
    async fn list_databases(&self, site_id: &SiteId) -> ControlResult<Vec<SiteDatabase>>;

    /// Remove a tenant database. Returns whether it existed.
    async fn delete_database(&self, id: &DatabaseId) -> ControlResult<bool>;

    // -------------------------------------------------------------------------
    // Backups
    // -------------------------------------------------------------------------

    /// Insert a backup record.
    async fn insert_backup(&self, backup: &SiteBackup) -> ControlResult<()>;

    /// Get a backup by ID.
    async fn get_backup(&self, id: &BackupId) -> ControlResult<Option<SiteBackup>>;

    /// Backups of a site, newest first.
    async fn list_backups(&self, site_id: &SiteId) -> ControlResult<Vec<SiteBackup>>;
}
