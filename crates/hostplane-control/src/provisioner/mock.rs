//! In-process provisioners.
//!
//! Used by the test suite and wired in place of the live backends when
//! `orchestrator.provisioners = "mock"`. Each double keeps its state in
//! memory and can be switched into a failing mode.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hostplane_container::{ContainerStats, ExecOutput};
use tracing::debug;

use crate::error::{ControlError, ControlResult, Provider};
use crate::types::{Site, SiteDatabase};

use super::container::{container_name, ContainerManager, SiteContainer};
use super::database::TenantEngine;
use super::dns::DnsVerifier;
use super::ssl::{CertificateIssuer, IssuedCertificate, ReachabilityProbe};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Database engine
// =============================================================================

/// Tenant engine keeping databases as named lists of tables.
///
/// Logins are tracked separately so a username reused across databases is
/// rejected the way a MySQL server rejects `CREATE USER`.
#[derive(Debug, Default)]
pub struct MockEngine {
    databases: Mutex<HashMap<String, Vec<String>>>,
    users: Mutex<HashSet<String>>,
    failing: AtomicBool,
}

impl MockEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether a database with this name exists.
    #[must_use]
    pub fn exists(&self, database_name: &str) -> bool {
        lock(&self.databases).contains_key(database_name)
    }

    /// Add a table to an existing database.
    pub fn add_table(&self, database_name: &str, table: &str) {
        if let Some(tables) = lock(&self.databases).get_mut(database_name) {
            tables.push(table.to_owned());
            tables.sort();
        }
    }

    /// Whether a login with this name exists.
    #[must_use]
    pub fn has_user(&self, username: &str) -> bool {
        lock(&self.users).contains(username)
    }

    /// Number of databases on the engine.
    #[must_use]
    pub fn database_count(&self) -> usize {
        lock(&self.databases).len()
    }

    fn check(&self) -> ControlResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::provider(
                Provider::Database,
                "database engine unavailable",
            ));
        }
        Ok(())
    }

    fn tables_of(&self, database: &SiteDatabase) -> ControlResult<Vec<String>> {
        lock(&self.databases)
            .get(&database.database_name)
            .cloned()
            .ok_or_else(|| ControlError::not_found("database", &database.database_name))
    }
}

#[async_trait]
impl TenantEngine for MockEngine {
    async fn create(&self, database: &SiteDatabase) -> ControlResult<()> {
        self.check()?;
        let mut databases = lock(&self.databases);
        if databases.contains_key(&database.database_name) {
            return Err(ControlError::provider(
                Provider::Database,
                format!("database {} exists", database.database_name),
            ));
        }
        let mut users = lock(&self.users);
        if users.contains(&database.username) {
            return Err(ControlError::provider(
                Provider::Database,
                format!("user {} exists", database.username),
            ));
        }
        databases.insert(database.database_name.clone(), Vec::new());
        users.insert(database.username.clone());
        Ok(())
    }

    async fn destroy(&self, database: &SiteDatabase) -> ControlResult<()> {
        self.check()?;
        lock(&self.databases).remove(&database.database_name);
        lock(&self.users).remove(&database.username);
        Ok(())
    }

    async fn copy_data(&self, source: &SiteDatabase, target: &SiteDatabase) -> ControlResult<()> {
        self.check()?;
        let tables = self.tables_of(source)?;
        lock(&self.databases).insert(target.database_name.clone(), tables);
        Ok(())
    }

    async fn ping(&self, database: &SiteDatabase) -> ControlResult<()> {
        self.check()?;
        if !self.has_user(&database.username) {
            return Err(ControlError::provider(
                Provider::Database,
                format!("access denied for user {}", database.username),
            ));
        }
        self.tables_of(database).map(|_| ())
    }

    async fn tables(&self, database: &SiteDatabase) -> ControlResult<Vec<String>> {
        self.check()?;
        self.tables_of(database)
    }

    async fn size_bytes(&self, database: &SiteDatabase) -> ControlResult<u64> {
        self.check()?;
        let tables = self.tables_of(database)?;
        Ok(u64::try_from(tables.len()).unwrap_or(u64::MAX) * 16 * 1024)
    }

    async fn dump(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()> {
        self.check()?;
        let mut dump = format!("-- dump of {}\n", database.database_name);
        for table in self.tables_of(database)? {
            dump.push_str(&format!("CREATE TABLE `{table}`;\n"));
        }
        tokio::fs::write(path, dump).await?;
        Ok(())
    }

    async fn restore(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()> {
        self.check()?;
        let dump = tokio::fs::read_to_string(path).await?;
        let mut tables: Vec<String> = dump
            .lines()
            .filter_map(|line| line.strip_prefix("CREATE TABLE `"))
            .filter_map(|rest| rest.split('`').next())
            .map(str::to_owned)
            .collect();
        tables.sort();
        lock(&self.databases).insert(database.database_name.clone(), tables);
        Ok(())
    }
}

// =============================================================================
// Container runtime
// =============================================================================

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    running: bool,
    memory_bytes: i64,
}

/// Container manager tracking containers in memory.
#[derive(Debug)]
pub struct MockContainerManager {
    containers: Mutex<HashMap<String, MockContainer>>,
    next_port: AtomicU16,
    failing: AtomicBool,
}

impl Default for MockContainerManager {
    fn default() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(20_000),
            failing: AtomicBool::new(false),
        }
    }
}

impl MockContainerManager {
    /// Create a working manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager whose every operation fails.
    #[must_use]
    pub fn failing() -> Self {
        let manager = Self::default();
        manager.set_failing(true);
        manager
    }

    /// Make every subsequent operation fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Whether the container exists and is running.
    #[must_use]
    pub fn is_running(&self, container_id: &str) -> bool {
        lock(&self.containers)
            .get(container_id)
            .is_some_and(|c| c.running)
    }

    /// Number of containers that exist.
    #[must_use]
    pub fn container_count(&self) -> usize {
        lock(&self.containers).len()
    }

    fn check(&self) -> ControlResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::provider(
                Provider::Container,
                "container runtime unavailable",
            ));
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> ControlResult<T> {
        self.check()?;
        lock(&self.containers)
            .get_mut(container_id)
            .map(f)
            .ok_or_else(|| ControlError::not_found("container", container_id))
    }
}

#[async_trait]
impl ContainerManager for MockContainerManager {
    async fn create_site_container(
        &self,
        site: &Site,
        _site_dir: &Path,
    ) -> ControlResult<SiteContainer> {
        self.check()?;
        let id = format!("mock-{}", ulid::Ulid::new().to_string().to_lowercase());
        let name = container_name(site);
        let host_port = self.next_port.fetch_add(1, Ordering::SeqCst);

        lock(&self.containers).insert(
            id.clone(),
            MockContainer {
                name: name.clone(),
                running: false,
                memory_bytes: i64::from(site.storage_limit_gb) << 30,
            },
        );
        debug!(container_id = %id, "mock container created");

        Ok(SiteContainer {
            id,
            name,
            host_port,
        })
    }

    async fn start(&self, container_id: &str) -> ControlResult<()> {
        self.with_container(container_id, |c| c.running = true)
    }

    async fn stop(&self, container_id: &str) -> ControlResult<()> {
        self.with_container(container_id, |c| c.running = false)
    }

    async fn restart(&self, container_id: &str) -> ControlResult<()> {
        self.with_container(container_id, |c| c.running = true)
    }

    async fn remove(&self, container_id: &str) -> ControlResult<()> {
        self.check()?;
        lock(&self.containers)
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ControlError::not_found("container", container_id))
    }

    async fn logs(&self, container_id: &str, tail: u32) -> ControlResult<String> {
        let name = self.with_container(container_id, |c| c.name.clone())?;
        let now = Utc::now().to_rfc3339();
        let lines = [
            format!("{now} {name} starting"),
            format!("{now} {name} listening on :80"),
        ];
        let keep = usize::try_from(tail).unwrap_or(usize::MAX);
        let skip = lines.len().saturating_sub(keep);
        Ok(lines[skip..].join("\n"))
    }

    async fn exec(&self, container_id: &str, command: &str) -> ControlResult<ExecOutput> {
        self.with_container(container_id, |_| ExecOutput {
            exit_code: 0,
            output: format!("{command}\n"),
        })
    }

    async fn stats(&self, container_id: &str) -> ControlResult<ContainerStats> {
        self.with_container(container_id, |c| ContainerStats {
            memory_limit_bytes: u64::try_from(c.memory_bytes).unwrap_or_default(),
            status: if c.running { "running" } else { "exited" }.to_owned(),
            ..ContainerStats::default()
        })
    }

    async fn update_resources(
        &self,
        container_id: &str,
        memory_bytes: i64,
        cpus: f64,
    ) -> ControlResult<()> {
        if memory_bytes <= 0 || cpus.is_nan() || cpus <= 0.0 {
            return Err(ControlError::validation(
                "memory and cpu limits must be positive",
            ));
        }
        self.with_container(container_id, |c| c.memory_bytes = memory_bytes)
    }

    async fn list_site_containers(&self) -> ControlResult<Vec<String>> {
        self.check()?;
        let mut names: Vec<String> = lock(&self.containers)
            .values()
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

// =============================================================================
// Certificates, reachability and DNS
// =============================================================================

/// Certificate issuer recording expiries in memory.
#[derive(Debug)]
pub struct MockIssuer {
    certificates: Mutex<HashMap<String, DateTime<Utc>>>,
    validity: Duration,
    failing: AtomicBool,
}

impl MockIssuer {
    /// Create an issuer handing out certificates valid for `validity_days`.
    #[must_use]
    pub fn new(validity_days: u32) -> Self {
        Self {
            certificates: Mutex::new(HashMap::new()),
            validity: Duration::days(i64::from(validity_days)),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent issuance fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Pretend a certificate for `domain` expires at `expires_at`.
    pub fn set_expiry(&self, domain: &str, expires_at: DateTime<Utc>) {
        lock(&self.certificates).insert(domain.to_owned(), expires_at);
    }

    /// Whether a certificate is installed for `domain`.
    #[must_use]
    pub fn has_certificate(&self, domain: &str) -> bool {
        lock(&self.certificates).contains_key(domain)
    }
}

impl Default for MockIssuer {
    fn default() -> Self {
        Self::new(90)
    }
}

#[async_trait]
impl CertificateIssuer for MockIssuer {
    async fn issue(&self, domain: &str) -> ControlResult<IssuedCertificate> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ControlError::provider(
                Provider::Certificate,
                "issuer unavailable",
            ));
        }
        let expires_at = Utc::now() + self.validity;
        lock(&self.certificates).insert(domain.to_owned(), expires_at);
        Ok(IssuedCertificate {
            cert_path: PathBuf::from(format!("/mock/certs/{domain}.crt")),
            key_path: PathBuf::from(format!("/mock/private/{domain}.key")),
            expires_at,
        })
    }

    async fn revoke(&self, domain: &str) -> ControlResult<bool> {
        Ok(lock(&self.certificates).remove(domain).is_some())
    }

    async fn expiry(&self, domain: &str) -> ControlResult<Option<DateTime<Utc>>> {
        Ok(lock(&self.certificates).get(domain).copied())
    }
}

/// Reachability probe with a fixed answer.
#[derive(Debug)]
pub struct StaticProbe {
    reachable: AtomicBool,
}

impl StaticProbe {
    /// Create a probe answering `reachable` for every domain.
    #[must_use]
    pub const fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    /// Change the answer.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityProbe for StaticProbe {
    async fn is_reachable(&self, _domain: &str) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// DNS verifier answering from an in-memory TXT table.
#[derive(Debug, Default)]
pub struct MockDnsVerifier {
    records: Mutex<HashMap<String, Vec<String>>>,
}

impl MockDnsVerifier {
    /// Create a verifier with no records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a TXT record.
    pub fn add_txt(&self, name: &str, value: &str) {
        lock(&self.records)
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_owned());
    }
}

#[async_trait]
impl DnsVerifier for MockDnsVerifier {
    async fn txt_records(&self, name: &str) -> ControlResult<Vec<String>> {
        Ok(lock(&self.records)
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }
}
