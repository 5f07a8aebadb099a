//! Site lifecycle orchestration.
//!
//! [`SiteOrchestrator`] sequences the provisioners into the create, delete,
//! clone, backup, restart, suspend and resume workflows. Every run opens a
//! fresh ledger entry and holds the site's dispatcher lease for its whole
//! duration. Each step persists its own result; a failed create leaves the
//! site in `error` with whatever was already provisioned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::HostplaneConfig;
use crate::dispatcher::{SiteLease, WorkflowDispatcher, WorkflowHandle};
use crate::error::{ControlError, ControlResult};
use crate::ledger::DeploymentLedger;
use crate::provisioner::{ArchiveSource, Provisioners};
use crate::state::{Deployment, Running};
use crate::store::{DeploymentStore, SiteFilter, SiteStore};
use crate::types::{
    normalise_domain, Actor, BackupId, BackupType, CloneSiteRequest, CreateBackupRequest,
    DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentType, Domain, DomainType,
    NewSiteRequest, Site, SiteBackup, SiteDatabase, SiteId, SiteStatus, UserId,
};

/// Maximum length of a fully qualified domain name.
const MAX_DOMAIN_LEN: usize = 253;

const BYTES_PER_MB: u64 = 1024 * 1024;

const MAX_BACKUP_NAME_ATTEMPTS: u32 = 100;

/// Handle to a background create or delete run.
pub type SiteWorkflow = WorkflowHandle<ControlResult<DeploymentRecord>>;

/// A site with its attached resources.
#[derive(Debug, Clone, Serialize)]
pub struct SiteDetails {
    /// The site.
    #[serde(flatten)]
    pub site: Site,
    /// Domains, primary first.
    pub domains: Vec<Domain>,
    /// Tenant databases. Passwords are never serialised.
    pub databases: Vec<SiteDatabase>,
}

/// Result of [`SiteOrchestrator::clone_site`].
#[derive(Debug)]
pub struct ClonedSite {
    /// The new site, still `creating`.
    pub site: Site,
    /// Ledger entry recorded against the source site.
    pub deployment: DeploymentRecord,
    /// The background create run for the new site.
    pub workflow: SiteWorkflow,
}

/// Limits and defaults applied by the orchestrator.
#[derive(Debug, Clone, Copy)]
struct Settings {
    max_sites_per_user: u32,
    backup_retention_days: u32,
    default_storage_limit_gb: u32,
    log_tail: u32,
}

/// Sequences provisioners into site workflows.
#[derive(Clone)]
pub struct SiteOrchestrator {
    store: Arc<dyn SiteStore>,
    ledger: DeploymentLedger,
    provisioners: Provisioners,
    dispatcher: WorkflowDispatcher,
    settings: Settings,
}

impl SiteOrchestrator {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<dyn SiteStore>,
        deployments: Arc<dyn DeploymentStore>,
        provisioners: Provisioners,
        config: &HostplaneConfig,
    ) -> Self {
        Self {
            store,
            ledger: DeploymentLedger::new(deployments),
            provisioners,
            dispatcher: WorkflowDispatcher::new(),
            settings: Settings {
                max_sites_per_user: config.orchestrator.max_sites_per_user,
                backup_retention_days: config.orchestrator.backup_retention_days,
                default_storage_limit_gb: config.orchestrator.default_storage_limit_gb,
                log_tail: config.docker.log_tail,
            },
        }
    }

    /// The site store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SiteStore> {
        &self.store
    }

    /// The deployment ledger.
    #[must_use]
    pub const fn ledger(&self) -> &DeploymentLedger {
        &self.ledger
    }

    /// The provisioners.
    #[must_use]
    pub const fn provisioners(&self) -> &Provisioners {
        &self.provisioners
    }

    /// The workflow dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &WorkflowDispatcher {
        &self.dispatcher
    }

    /// Stop accepting workflows and wait for running ones.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a site.
    pub async fn get_site(&self, id: &SiteId) -> ControlResult<Site> {
        self.store
            .get_site(id)
            .await?
            .ok_or_else(|| ControlError::not_found("site", id))
    }

    /// Get a site with its domains and databases.
    pub async fn site_details(&self, id: &SiteId) -> ControlResult<SiteDetails> {
        let site = self.get_site(id).await?;
        let domains = self.store.list_domains(id).await?;
        let databases = self.store.list_databases(id).await?;
        Ok(SiteDetails {
            site,
            domains,
            databases,
        })
    }

    /// List sites.
    pub async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<Site>> {
        self.store.list_sites(filter).await
    }

    /// Get a deployment.
    pub async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.ledger
            .get(id)
            .await?
            .ok_or_else(|| ControlError::not_found("deployment", id))
    }

    /// Deployments of a site, newest first.
    pub async fn list_deployments(&self, site_id: &SiteId) -> ControlResult<Vec<DeploymentRecord>> {
        self.ledger.list_for_site(site_id).await
    }

    /// Backups of a site, newest first.
    pub async fn list_backups(&self, site_id: &SiteId) -> ControlResult<Vec<SiteBackup>> {
        self.get_site(site_id).await?;
        self.store.list_backups(site_id).await
    }

    /// Get a backup.
    pub async fn get_backup(&self, id: &BackupId) -> ControlResult<SiteBackup> {
        self.store
            .get_backup(id)
            .await?
            .ok_or_else(|| ControlError::not_found("backup", id))
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Validate a request and record a new site with its primary domain.
    ///
    /// Nothing is provisioned; call [`SiteOrchestrator::create_site`] next.
    pub async fn register_site(&self, request: NewSiteRequest, owner: &UserId) -> ControlResult<Site> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ControlError::validation("site name is required"));
        }
        let platform = request.platform.trim().to_ascii_lowercase();
        if platform.is_empty() {
            return Err(ControlError::validation("platform is required"));
        }
        let storage_limit_gb = request
            .storage_limit_gb
            .unwrap_or(self.settings.default_storage_limit_gb);
        if storage_limit_gb == 0 {
            return Err(ControlError::validation("storage limit must be positive"));
        }

        let domain_name = self.available_domain(&request.domain).await?;

        let mut site = Site::new(
            name.to_owned(),
            domain_name.clone(),
            owner.clone(),
            platform,
            request.template,
            storage_limit_gb,
        );
        site.description = request.description;
        let domain = Domain::new(site.id.clone(), domain_name, request.domain_type, true);

        self.store
            .register_site(&site, &domain, self.settings.max_sites_per_user)
            .await?;

        info!(
            site_id = %site.id,
            domain = %site.domain,
            platform = %site.platform,
            owner = %owner,
            "site registered"
        );
        Ok(site)
    }

    async fn available_domain(&self, requested: &str) -> ControlResult<String> {
        let domain_name = normalise_domain(requested);
        validate_domain_name(&domain_name)?;
        if self.store.domain_in_use(&domain_name).await? {
            return Err(ControlError::conflict(format!(
                "domain {domain_name} is already in use"
            )));
        }
        Ok(domain_name)
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Start provisioning a registered site in the background.
    ///
    /// A site in `error` re-enters `creating` and the workflow runs again
    /// over whatever a previous attempt left behind.
    pub async fn create_site(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<SiteWorkflow> {
        let lease = self.dispatcher.try_acquire(site_id, DeploymentType::Create)?;
        let mut site = self.get_site(site_id).await?;
        if site.status != SiteStatus::Creating {
            self.transition(&mut site, SiteStatus::Creating).await?;
        }
        Ok(self.spawn_create(lease, site_id.clone(), actor.clone(), true))
    }

    fn spawn_create(
        &self,
        lease: SiteLease,
        site_id: SiteId,
        actor: Actor,
        provision_database: bool,
    ) -> SiteWorkflow {
        let this = self.clone();
        self.dispatcher.submit(lease, async move {
            let result = this.run_create(&site_id, &actor, provision_database).await;
            if let Err(ref e) = result {
                error!(site_id = %site_id, error = %e, "create workflow aborted");
            }
            result
        })
    }

    async fn run_create(
        &self,
        site_id: &SiteId,
        actor: &Actor,
        provision_database: bool,
    ) -> ControlResult<DeploymentRecord> {
        let mut deployment = self
            .ledger
            .open(site_id, DeploymentType::Create, actor, "Starting site creation process")
            .await?;

        let Some(mut site) = self.store.get_site(site_id).await? else {
            return self.ledger.fail(deployment, "Site not found").await;
        };

        match self
            .create_steps(&mut site, &mut deployment, provision_database)
            .await
        {
            Ok(()) => {
                info!(site_id = %site_id, "site created");
                self.ledger
                    .complete(deployment, "Site created successfully")
                    .await
            }
            Err(e) => {
                error!(site_id = %site_id, error = %e, "site creation failed");
                let record = self.ledger.fail(deployment, format!("Error: {e}")).await?;
                if let Err(status_err) = self.transition(&mut site, SiteStatus::Error).await {
                    warn!(site_id = %site_id, error = %status_err, "failed to mark site as errored");
                }
                Ok(record)
            }
        }
    }

    async fn create_steps(
        &self,
        site: &mut Site,
        deployment: &mut Deployment<Running>,
        provision_database: bool,
    ) -> ControlResult<()> {
        let p = &self.provisioners;

        self.ledger
            .progress(deployment, "Creating site directory structure")
            .await;
        let site_dir = p.filesystem.create_site_directories(&site.id).await?;
        site.directory = Some(site_dir.display().to_string());
        self.persist(site).await?;

        if provision_database && self.store.list_databases(&site.id).await?.is_empty() {
            self.ledger.progress(deployment, "Creating site database").await;
            match p.databases.create_database(site).await {
                Ok(database) => {
                    debug!(site_id = %site.id, database = %database.database_name, "database ready");
                }
                Err(e) => {
                    warn!(site_id = %site.id, error = %e, "database provisioning skipped");
                }
            }
        }

        self.ledger.progress(deployment, "Deploying site template").await;
        let outcome = p.filesystem.deploy_template(site, &site_dir).await?;
        debug!(site_id = %site.id, ?outcome, "template step finished");

        self.ledger.progress(deployment, "Creating site container").await;
        if let Some(stale) = site.container().map(str::to_owned) {
            match p.containers.remove(&stale).await {
                Ok(()) => debug!(site_id = %site.id, container_id = %stale, "stale container removed"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        let container = p.containers.create_site_container(site, &site_dir).await?;
        site.container_id = Some(container.id.clone());
        site.container_name = Some(container.name);
        site.container_port = Some(container.host_port);
        self.persist(site).await?;
        p.containers.start(&container.id).await?;

        self.ledger
            .progress(deployment, "Configuring domain and SSL")
            .await;
        let primary = self
            .store
            .list_domains(&site.id)
            .await?
            .into_iter()
            .find(|d| d.is_primary)
            .ok_or_else(|| ControlError::not_found("primary domain", &site.id))?;
        p.domains.configure_domain(&primary.id).await?;

        self.transition(site, SiteStatus::Active).await
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Start tearing a site down in the background.
    ///
    /// The site is `deleting` when this returns and always ends `deleted`.
    /// Steps that fail are logged and summarised in the ledger entry.
    pub async fn delete_site(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<SiteWorkflow> {
        let lease = self.dispatcher.try_acquire(site_id, DeploymentType::Delete)?;
        let mut site = self.get_site(site_id).await?;
        self.transition(&mut site, SiteStatus::Deleting).await?;

        let this = self.clone();
        let site_id = site_id.clone();
        let actor = actor.clone();
        Ok(self.dispatcher.submit(lease, async move {
            let result = this.run_delete(&site_id, &actor).await;
            if let Err(ref e) = result {
                error!(site_id = %site_id, error = %e, "delete workflow aborted");
            }
            result
        }))
    }

    async fn run_delete(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<DeploymentRecord> {
        let mut deployment = self
            .ledger
            .open(site_id, DeploymentType::Delete, actor, "Starting site deletion process")
            .await?;

        let Some(mut site) = self.store.get_site(site_id).await? else {
            return self.ledger.fail(deployment, "Site not found").await;
        };

        let mut failures = self.teardown_steps(&mut site, &mut deployment).await;

        site.container_id = None;
        site.container_name = None;
        site.container_port = None;
        if let Err(e) = self.transition(&mut site, SiteStatus::Deleted).await {
            failures.push(format!("status: {e}"));
        }

        if failures.is_empty() {
            info!(site_id = %site_id, "site deleted");
            self.ledger
                .complete(deployment, "Site deleted successfully")
                .await
        } else {
            warn!(site_id = %site_id, failures = failures.len(), "site deleted with errors");
            self.ledger
                .fail(
                    deployment,
                    format!("Site deleted with errors: {}", failures.join("; ")),
                )
                .await
        }
    }

    async fn teardown_steps(&self, site: &mut Site, deployment: &mut Deployment<Running>) -> Vec<String> {
        let p = &self.provisioners;
        let mut failures = Vec::new();

        if let Some(container_id) = site.container().map(str::to_owned) {
            self.ledger.progress(deployment, "Removing site container").await;
            match p.containers.remove(&container_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(site_id = %site.id, container_id = %container_id, "container already gone");
                }
                Err(e) => {
                    warn!(site_id = %site.id, error = %e, "container removal failed");
                    failures.push(format!("container: {e}"));
                }
            }
        }

        self.ledger.progress(deployment, "Removing SSL certificates").await;
        match self.store.list_domains(&site.id).await {
            Ok(domains) => {
                for domain in domains {
                    if let Err(e) = p.domains.remove_ssl_certificate(&domain.id).await {
                        warn!(domain = %domain.domain_name, error = %e, "certificate removal failed");
                        failures.push(format!("certificate {}: {e}", domain.domain_name));
                    }
                }
            }
            Err(e) => failures.push(format!("domains: {e}")),
        }

        self.ledger.progress(deployment, "Dropping site databases").await;
        match self.store.list_databases(&site.id).await {
            Ok(databases) => {
                for database in databases {
                    if let Err(e) = p.databases.drop_database(&database.id).await {
                        warn!(database = %database.database_name, error = %e, "database drop failed");
                        failures.push(format!("database {}: {e}", database.database_name));
                    }
                }
            }
            Err(e) => failures.push(format!("databases: {e}")),
        }

        self.ledger.progress(deployment, "Removing site files").await;
        let site_dir = self.site_dir(site);
        if let Err(e) = p.filesystem.delete_site_directory(&site_dir).await {
            warn!(site_id = %site.id, error = %e, "site directory removal failed");
            failures.push(format!("files: {e}"));
        }

        match self.store.delete_domains(&site.id).await {
            Ok(removed) => debug!(site_id = %site.id, removed, "domains removed"),
            Err(e) => failures.push(format!("domain records: {e}")),
        }

        failures
    }

    // =========================================================================
    // Clone
    // =========================================================================

    /// Clone a site under a new domain.
    ///
    /// Files and databases are copied before this returns; provisioning of
    /// the new site then continues in the background.
    pub async fn clone_site(
        &self,
        source_id: &SiteId,
        request: CloneSiteRequest,
        actor: &Actor,
    ) -> ControlResult<ClonedSite> {
        let _lease = self.dispatcher.try_acquire(source_id, DeploymentType::Clone)?;
        let source = self.get_site(source_id).await?;
        if matches!(source.status, SiteStatus::Deleting | SiteStatus::Deleted) {
            return Err(ControlError::validation(format!(
                "site {source_id} is {}",
                source.status
            )));
        }
        let name = request.name.trim().to_owned();
        if name.is_empty() {
            return Err(ControlError::validation("site name is required"));
        }
        let domain_name = self.available_domain(&request.domain).await?;

        let mut deployment = self
            .ledger
            .open(source_id, DeploymentType::Clone, actor, "Creating cloned site")
            .await?;

        let mut site = Site::new(
            name,
            domain_name.clone(),
            source.user_id.clone(),
            source.platform.clone(),
            source.template.clone(),
            source.storage_limit_gb,
        );
        site.description = request.description.clone();
        let domain = Domain::new(site.id.clone(), domain_name, DomainType::Subdomain, true);

        if let Err(e) = self
            .store
            .register_site(&site, &domain, self.settings.max_sites_per_user)
            .await
        {
            self.ledger.fail(deployment, format!("Error: {e}")).await?;
            return Err(e);
        }

        self.ledger.progress(&mut deployment, "Cloning site data").await;
        if let Err(e) = self.clone_data(&source, &site, &request).await {
            error!(source = %source_id, target = %site.id, error = %e, "clone failed");
            self.ledger.fail(deployment, format!("Error: {e}")).await?;
            if let Err(status_err) = self.transition(&mut site, SiteStatus::Error).await {
                warn!(site_id = %site.id, error = %status_err, "failed to mark clone as errored");
            }
            return Err(e);
        }

        let lease = self.dispatcher.try_acquire(&site.id, DeploymentType::Create)?;
        let workflow = self.spawn_create(lease, site.id.clone(), Actor::system(), false);
        let deployment = self
            .ledger
            .complete(deployment, "Site cloned successfully")
            .await?;

        info!(source = %source_id, target = %site.id, "site cloned");
        Ok(ClonedSite {
            site,
            deployment,
            workflow,
        })
    }

    async fn clone_data(
        &self,
        source: &Site,
        target: &Site,
        request: &CloneSiteRequest,
    ) -> ControlResult<()> {
        let p = &self.provisioners;

        if request.clone_files {
            let source_dir = self.site_dir(source);
            if tokio::fs::try_exists(&source_dir).await? {
                let target_dir = p.filesystem.site_directory(&target.id);
                let files = p.filesystem.copy_tree(&source_dir, &target_dir).await?;
                debug!(target = %target.id, files, "site files cloned");
            }
        }

        if request.clone_database {
            for database in self.store.list_databases(&source.id).await? {
                match p.databases.clone_database(&database.id, target).await {
                    Ok(copy) => {
                        debug!(target = %target.id, database = %copy.database_name, "database cloned");
                    }
                    Err(e) => {
                        warn!(
                            source = %database.database_name,
                            error = %e,
                            "database clone skipped"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Backup
    // =========================================================================

    /// Archive a site's files and database dumps.
    pub async fn create_backup(
        &self,
        site_id: &SiteId,
        request: CreateBackupRequest,
        actor: &Actor,
    ) -> ControlResult<SiteBackup> {
        if !request.include_files && !request.include_database {
            return Err(ControlError::validation(
                "a backup must include files or databases",
            ));
        }
        let _lease = self.dispatcher.try_acquire(site_id, DeploymentType::Backup)?;
        let mut site = self.get_site(site_id).await?;
        if matches!(site.status, SiteStatus::Deleting | SiteStatus::Deleted) {
            return Err(ControlError::validation(format!(
                "site {site_id} is {}",
                site.status
            )));
        }

        let deployment = self
            .ledger
            .open(site_id, DeploymentType::Backup, actor, "Creating site backup")
            .await?;

        match self.backup_steps(&mut site, &request).await {
            Ok(backup) => {
                self.ledger
                    .complete(deployment, "Backup created successfully")
                    .await?;
                info!(
                    site_id = %site_id,
                    backup_id = %backup.id,
                    size_bytes = backup.size_bytes,
                    "backup created"
                );
                Ok(backup)
            }
            Err(e) => {
                error!(site_id = %site_id, error = %e, "backup failed");
                self.ledger.fail(deployment, format!("Error: {e}")).await?;
                Err(e)
            }
        }
    }

    async fn backup_steps(&self, site: &mut Site, request: &CreateBackupRequest) -> ControlResult<SiteBackup> {
        let p = &self.provisioners;
        let now = Utc::now();
        let backup_dir = p.filesystem.backup_root().join(site.id.as_str());
        tokio::fs::create_dir_all(&backup_dir).await?;
        let (file_name, file_path) =
            free_backup_path(&backup_dir, &backup_file_name(&site.name, now)).await?;

        let mut dumps = Vec::new();
        let result = self
            .archive_site(site, request, &file_path, &mut dumps)
            .await;
        remove_scratch(&dumps).await;
        let size_bytes = result?;

        let backup = SiteBackup {
            id: BackupId::generate(),
            site_id: site.id.clone(),
            file_name,
            file_path: file_path.display().to_string(),
            size_bytes,
            backup_type: BackupType::Manual,
            description: request.description.clone(),
            includes_database: request.include_database,
            includes_files: request.include_files,
            created_at: now,
            expires_at: Some(now + Duration::days(i64::from(self.settings.backup_retention_days))),
        };
        self.store.insert_backup(&backup).await?;

        site.last_backup_at = Some(now);
        self.persist(site).await?;
        Ok(backup)
    }

    /// Write the backup archive. Database dumps are staged next to it and
    /// their paths pushed onto `dumps` for the caller to clean up.
    async fn archive_site(
        &self,
        site: &Site,
        request: &CreateBackupRequest,
        file_path: &Path,
        dumps: &mut Vec<PathBuf>,
    ) -> ControlResult<u64> {
        let p = &self.provisioners;
        let mut sources = Vec::new();
        if request.include_files {
            sources.push(ArchiveSource::new(self.site_dir(site), "files"));
        }

        if request.include_database {
            let stem = file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            for database in self.store.list_databases(&site.id).await? {
                let dump =
                    file_path.with_file_name(format!(".{stem}.{}.sql", database.database_name));
                dumps.push(dump.clone());
                p.databases.dump_database(&database.id, &dump).await?;
                sources.push(ArchiveSource::new(
                    dump,
                    format!("databases/{}.sql", database.database_name),
                ));
            }
        }

        p.filesystem.create_archive(sources, file_path).await
    }

    // =========================================================================
    // Runtime operations
    // =========================================================================

    /// Restart a site's container.
    ///
    /// Returns `false` when the runtime refused; the failure is recorded in
    /// the ledger.
    pub async fn restart_site(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<bool> {
        let _lease = self.dispatcher.try_acquire(site_id, DeploymentType::Restart)?;
        let site = self.get_site(site_id).await?;
        let container_id = site
            .container()
            .ok_or_else(|| ControlError::NotProvisioned(site_id.to_string()))?;

        let deployment = self
            .ledger
            .open(site_id, DeploymentType::Restart, actor, "Restarting site services")
            .await?;

        match self.provisioners.containers.restart(container_id).await {
            Ok(()) => {
                self.ledger
                    .complete(deployment, "Site restarted successfully")
                    .await?;
                Ok(true)
            }
            Err(e) => {
                error!(site_id = %site_id, error = %e, "restart failed");
                self.ledger.fail(deployment, format!("Error: {e}")).await?;
                Ok(false)
            }
        }
    }

    /// Tail of the site's container logs, `None` without a container.
    pub async fn site_logs(&self, site_id: &SiteId) -> ControlResult<Option<String>> {
        let site = self.get_site(site_id).await?;
        let Some(container_id) = site.container() else {
            return Ok(None);
        };
        let logs = self
            .provisioners
            .containers
            .logs(container_id, self.settings.log_tail)
            .await?;
        Ok(Some(logs))
    }

    /// Stop an active site's container and mark it `suspended`.
    pub async fn suspend_site(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<DeploymentRecord> {
        self.toggle_site(site_id, actor, DeploymentType::Suspend, SiteStatus::Suspended)
            .await
    }

    /// Start a suspended site's container and mark it `active`.
    pub async fn resume_site(&self, site_id: &SiteId, actor: &Actor) -> ControlResult<DeploymentRecord> {
        self.toggle_site(site_id, actor, DeploymentType::Resume, SiteStatus::Active)
            .await
    }

    async fn toggle_site(
        &self,
        site_id: &SiteId,
        actor: &Actor,
        workflow: DeploymentType,
        target: SiteStatus,
    ) -> ControlResult<DeploymentRecord> {
        let _lease = self.dispatcher.try_acquire(site_id, workflow)?;
        let mut site = self.get_site(site_id).await?;
        if !site.status.can_transition_to(target) {
            return Err(ControlError::InvalidStateTransition {
                from: site.status.as_str(),
                to: target.as_str(),
            });
        }

        let deployment = self
            .ledger
            .open(site_id, workflow, actor, format!("Moving site to {target}"))
            .await?;

        let result = match site.container() {
            Some(id) if target == SiteStatus::Suspended => {
                self.provisioners.containers.stop(id).await
            }
            Some(id) => self.provisioners.containers.start(id).await,
            None => Ok(()),
        };
        let result = match result {
            Ok(()) => self.transition(&mut site, target).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(site_id = %site_id, status = %target, "site status changed");
                self.ledger
                    .complete(deployment, format!("Site {target}"))
                    .await
            }
            Err(e) => {
                error!(site_id = %site_id, error = %e, workflow = %workflow, "status change failed");
                self.ledger.fail(deployment, format!("Error: {e}")).await?;
                Err(e)
            }
        }
    }

    /// Recompute a site's storage usage. Returns the usage in MB.
    pub async fn update_storage_usage(&self, site_id: &SiteId) -> ControlResult<u64> {
        let mut site = self.get_site(site_id).await?;
        let bytes = self
            .provisioners
            .filesystem
            .directory_size(&self.site_dir(&site))
            .await?;
        site.storage_used_mb = bytes / BYTES_PER_MB;
        self.persist(&mut site).await?;
        debug!(site_id = %site_id, used_mb = site.storage_used_mb, "storage usage updated");
        Ok(site.storage_used_mb)
    }

    /// Number of sites and deployments per status.
    pub async fn status_counts(
        &self,
    ) -> ControlResult<(Vec<(SiteStatus, u64)>, Vec<(DeploymentStatus, u64)>)> {
        let sites = self.store.count_sites_by_status().await?;
        let deployments = self.ledger.count_by_status().await?;
        Ok((sites, deployments))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn site_dir(&self, site: &Site) -> PathBuf {
        site.directory
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.provisioners.filesystem.site_directory(&site.id))
    }

    async fn persist(&self, site: &mut Site) -> ControlResult<()> {
        site.updated_at = Utc::now();
        self.store.update_site(site).await
    }

    async fn transition(&self, site: &mut Site, to: SiteStatus) -> ControlResult<()> {
        if !site.status.can_transition_to(to) {
            return Err(ControlError::InvalidStateTransition {
                from: site.status.as_str(),
                to: to.as_str(),
            });
        }
        debug!(site_id = %site.id, from = %site.status, to = %to, "site status transition");
        site.status = to;
        self.persist(site).await
    }
}

impl std::fmt::Debug for SiteOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteOrchestrator")
            .field("provisioners", &self.provisioners)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Check a normalised domain name.
fn validate_domain_name(name: &str) -> ControlResult<()> {
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };
    if name.len() > MAX_DOMAIN_LEN || !name.contains('.') || !name.split('.').all(valid_label) {
        return Err(ControlError::validation(format!("invalid domain name: {name:?}")));
    }
    Ok(())
}

/// `{name}_{YYYYMMDD_HHMMSS}.tar.gz` with the name reduced to safe
/// characters.
fn backup_file_name(site_name: &str, at: chrono::DateTime<Utc>) -> String {
    let stem: String = site_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{stem}_{}.tar.gz", at.format("%Y%m%d_%H%M%S"))
}

/// First of `name`, `{stem}_2.tar.gz`, `{stem}_3.tar.gz`, ... not yet
/// present in `dir`.
async fn free_backup_path(dir: &Path, name: &str) -> ControlResult<(String, PathBuf)> {
    let stem = name.strip_suffix(".tar.gz").unwrap_or(name);
    let mut candidate = name.to_owned();
    for n in 2..=MAX_BACKUP_NAME_ATTEMPTS {
        let path = dir.join(&candidate);
        if !tokio::fs::try_exists(&path).await? {
            return Ok((candidate, path));
        }
        candidate = format!("{stem}_{n}.tar.gz");
    }
    Err(ControlError::conflict(format!(
        "no free backup file name for {name}"
    )))
}

async fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = remove_file(path).await {
            debug!(path = %path.display(), error = %e, "failed to remove scratch dump");
        }
    }
}

async fn remove_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
