//! In-memory store for testing.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ControlError, ControlResult};
use crate::types::{
    BackupId, DatabaseId, DeploymentId, DeploymentRecord, DeploymentStatus, Domain, DomainId,
    Site, SiteBackup, SiteDatabase, SiteId, SiteStatus,
};

use super::{check_transition, DeploymentFilter, DeploymentStore, SiteFilter, SiteStore};

/// Site-side tables, guarded by one lock so registration is atomic.
#[derive(Debug, Default)]
struct Tables {
    sites: HashMap<String, Site>,
    domains: HashMap<String, Domain>,
    databases: HashMap<String, SiteDatabase>,
    backups: HashMap<String, SiteBackup>,
}

impl Tables {
    fn domain_taken(&self, domain_name: &str) -> bool {
        self.sites.values().any(|s| s.domain == domain_name)
            || self.domains.values().any(|d| d.domain_name == domain_name)
    }
}

/// In-memory store for testing.
///
/// This implementation is not suitable for production use as data is lost
/// when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read_tables(&self) -> ControlResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write_tables(&self) -> ControlResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }
}

#[allow(clippy::as_conversions)]
fn paginate<T>(items: Vec<T>, offset: Option<u32>, limit: Option<u32>) -> Vec<T> {
    let iter = items.into_iter().skip(offset.unwrap_or(0) as usize);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.data.id.as_str().to_owned();
        if deployments.contains_key(&key) {
            return Err(ControlError::conflict(format!(
                "deployment {key} already exists"
            )));
        }

        deployments.insert(key, record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        from: DeploymentStatus,
    ) -> ControlResult<()> {
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let stored = deployments
            .get_mut(record.data.id.as_str())
            .ok_or_else(|| ControlError::not_found("deployment", &record.data.id))?;

        check_transition(stored.status, from, record.status)?;

        stored.status = record.status;
        stored.data.message.clone_from(&record.data.message);
        stored.data.updated_at = record.data.updated_at;
        // Timestamps are write-once.
        if stored.data.started_at.is_none() {
            stored.data.started_at = record.data.started_at;
        }
        if stored.data.completed_at.is_none() {
            stored.data.completed_at = record.data.completed_at;
        }

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| {
                if let Some(ref site_id) = filter.site_id {
                    if &r.data.site_id != site_id {
                        return false;
                    }
                }
                if let Some(status) = filter.status {
                    if r.status != status {
                        return false;
                    }
                }
                if let Some(deployment_type) = filter.deployment_type {
                    if r.data.deployment_type != deployment_type {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| {
            b.data
                .created_at
                .cmp(&a.data.created_at)
                .then_with(|| b.data.id.cmp(&a.data.id))
        });

        Ok(paginate(results, filter.offset, filter.limit))
    }

    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut counts: HashMap<DeploymentStatus, u64> = HashMap::new();
        for record in deployments.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(DeploymentStatus::ALL
            .iter()
            .map(|s| (*s, counts.get(s).copied().unwrap_or(0)))
            .collect())
    }
}

#[async_trait]
impl SiteStore for MemoryStore {
    async fn register_site(
        &self,
        site: &Site,
        primary_domain: &Domain,
        max_sites_per_user: u32,
    ) -> ControlResult<()> {
        let mut tables = self.write_tables()?;

        if tables.domain_taken(&primary_domain.domain_name) {
            return Err(ControlError::conflict(format!(
                "domain {} is already in use",
                primary_domain.domain_name
            )));
        }

        let owned = tables
            .sites
            .values()
            .filter(|s| s.user_id == site.user_id && s.status != SiteStatus::Deleted)
            .count();
        if owned >= usize::try_from(max_sites_per_user).unwrap_or(usize::MAX) {
            return Err(ControlError::validation(format!(
                "user {} has reached the limit of {max_sites_per_user} sites",
                site.user_id
            )));
        }

        if tables.sites.contains_key(site.id.as_str()) {
            return Err(ControlError::conflict(format!(
                "site {} already exists",
                site.id
            )));
        }

        tables
            .sites
            .insert(site.id.as_str().to_owned(), site.clone());
        tables
            .domains
            .insert(primary_domain.id.as_str().to_owned(), primary_domain.clone());
        Ok(())
    }

    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<Site>> {
        Ok(self.read_tables()?.sites.get(id.as_str()).cloned())
    }

    async fn update_site(&self, site: &Site) -> ControlResult<()> {
        let mut tables = self.write_tables()?;
        let stored = tables
            .sites
            .get_mut(site.id.as_str())
            .ok_or_else(|| ControlError::not_found("site", &site.id))?;
        *stored = site.clone();
        Ok(())
    }

    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<Site>> {
        let tables = self.read_tables()?;
        let mut results: Vec<_> = tables
            .sites
            .values()
            .filter(|s| filter.user_id.as_ref().map_or(true, |u| &s.user_id == u))
            .filter(|s| filter.status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(results, filter.offset, filter.limit))
    }

    async fn count_sites_by_status(&self) -> ControlResult<Vec<(SiteStatus, u64)>> {
        let tables = self.read_tables()?;
        let mut counts: HashMap<SiteStatus, u64> = HashMap::new();
        for site in tables.sites.values() {
            *counts.entry(site.status).or_default() += 1;
        }
        Ok(SiteStatus::ALL
            .iter()
            .map(|s| (*s, counts.get(s).copied().unwrap_or(0)))
            .collect())
    }

    async fn domain_in_use(&self, domain_name: &str) -> ControlResult<bool> {
        Ok(self.read_tables()?.domain_taken(domain_name))
    }

    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<Domain>> {
        Ok(self.read_tables()?.domains.get(id.as_str()).cloned())
    }

    async fn update_domain(&self, domain: &Domain) -> ControlResult<()> {
        let mut tables = self.write_tables()?;
        let stored = tables
            .domains
            .get_mut(domain.id.as_str())
            .ok_or_else(|| ControlError::not_found("domain", &domain.id))?;
        *stored = domain.clone();
        Ok(())
    }

    async fn list_domains(&self, site_id: &SiteId) -> ControlResult<Vec<Domain>> {
        let tables = self.read_tables()?;
        let mut results: Vec<_> = tables
            .domains
            .values()
            .filter(|d| &d.site_id == site_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            b.is_primary
                .cmp(&a.is_primary)
                .then_with(|| a.domain_name.cmp(&b.domain_name))
        });
        Ok(results)
    }

    async fn delete_domains(&self, site_id: &SiteId) -> ControlResult<u64> {
        let mut tables = self.write_tables()?;
        let before = tables.domains.len();
        tables.domains.retain(|_, d| &d.site_id != site_id);
        Ok(u64::try_from(before - tables.domains.len()).unwrap_or(u64::MAX))
    }

    async fn domains_expiring_before(&self, before: DateTime<Utc>) -> ControlResult<Vec<Domain>> {
        let tables = self.read_tables()?;
        let mut results: Vec<_> = tables
            .domains
            .values()
            .filter(|d| d.ssl_enabled && d.ssl_expires_at.is_some_and(|at| at <= before))
            .cloned()
            .collect();
        results.sort_by_key(|d| d.ssl_expires_at);
        Ok(results)
    }

    async fn database_name_in_use(&self, database_name: &str) -> ControlResult<bool> {
        Ok(self
            .read_tables()?
            .databases
            .values()
            .any(|d| d.database_name == database_name))
    }

    async fn database_username_in_use(&self, username: &str) -> ControlResult<bool> {
        Ok(self
            .read_tables()?
            .databases
            .values()
            .any(|d| d.username == username))
    }

    async fn insert_database(&self, database: &SiteDatabase) -> ControlResult<()> {
        let mut tables = self.write_tables()?;
        if tables
            .databases
            .values()
            .any(|d| d.database_name == database.database_name)
        {
            return Err(ControlError::conflict(format!(
                "database {} already exists",
                database.database_name
            )));
        }
        tables
            .databases
            .insert(database.id.as_str().to_owned(), database.clone());
        Ok(())
    }

    async fn get_database(&self, id: &DatabaseId) -> ControlResult<Option<SiteDatabase>> {
        Ok(self.read_tables()?.databases.get(id.as_str()).cloned())
    }

    async fn list_databases(&self, site_id: &SiteId) -> ControlResult<Vec<SiteDatabase>> {
        let tables = self.read_tables()?;
        let mut results: Vec<_> = tables
            .databases
            .values()
            .filter(|d| &d.site_id == site_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }

    async fn delete_database(&self, id: &DatabaseId) -> ControlResult<bool> {
        Ok(self.write_tables()?.databases.remove(id.as_str()).is_some())
    }

    async fn insert_backup(&self, backup: &SiteBackup) -> ControlResult<()> {
        let mut tables = self.write_tables()?;
        if tables.backups.contains_key(backup.id.as_str()) {
            return Err(ControlError::conflict(format!(
                "backup {} already exists",
                backup.id
            )));
        }
        tables
            .backups
            .insert(backup.id.as_str().to_owned(), backup.clone());
        Ok(())
    }

    async fn get_backup(&self, id: &BackupId) -> ControlResult<Option<SiteBackup>> {
        Ok(self.read_tables()?.backups.get(id.as_str()).cloned())
    }

    async fn list_backups(&self, site_id: &SiteId) -> ControlResult<Vec<SiteBackup>> {
        let tables = self.read_tables()?;
        let mut results: Vec<_> = tables
            .backups
            .values()
            .filter(|b| &b.site_id == site_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, DeploymentData, DeploymentType, DomainType, UserId};

    fn test_site(user: &str) -> Site {
        Site::new(
            "Blog".to_owned(),
            "blog.example.com".to_owned(),
            UserId::new(user),
            "wordpress".to_owned(),
            "default".to_owned(),
            10,
        )
    }

    fn primary_domain(site: &Site, name: &str) -> Domain {
        Domain::new(site.id.clone(), name.to_owned(), DomainType::Subdomain, true)
    }

    fn test_deployment(site_id: &SiteId) -> DeploymentRecord {
        DeploymentRecord::new(DeploymentData::new(
            site_id.clone(),
            DeploymentType::Create,
            &Actor::system(),
        ))
    }

    #[tokio::test]
    async fn register_and_get() {
        let store = MemoryStore::new();
        let site = test_site("alice");
        let domain = primary_domain(&site, "blog.example.com");

        store
            .register_site(&site, &domain, 50)
            .await
            .expect("register failed");

        let retrieved = store
            .get_site(&site.id)
            .await
            .expect("get failed")
            .expect("site not found");
        assert_eq!(retrieved.status, SiteStatus::Creating);

        let domains = store.list_domains(&site.id).await.expect("list failed");
        assert_eq!(domains.len(), 1);
        assert!(domains[0].is_primary);
    }

    #[tokio::test]
    async fn duplicate_domain_is_rejected_atomically() {
        let store = MemoryStore::new();
        let first = test_site("alice");
        store
            .register_site(&first, &primary_domain(&first, "blog.example.com"), 50)
            .await
            .expect("register failed");

        let second = test_site("bob");
        let err = store
            .register_site(&second, &primary_domain(&second, "blog.example.com"), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
        assert!(store.get_site(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn per_user_limit_ignores_deleted_sites() {
        let store = MemoryStore::new();
        let mut first = test_site("alice");
        store
            .register_site(&first, &primary_domain(&first, "a.example.com"), 1)
            .await
            .expect("register failed");

        let second = test_site("alice");
        let err = store
            .register_site(&second, &primary_domain(&second, "b.example.com"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        first.status = SiteStatus::Deleted;
        store.update_site(&first).await.expect("update failed");
        store
            .register_site(&second, &primary_domain(&second, "b.example.com"), 1)
            .await
            .expect("register after delete failed");
    }

    #[tokio::test]
    async fn deleted_site_keeps_its_domain() {
        let store = MemoryStore::new();
        let mut site = test_site("alice");
        store
            .register_site(&site, &primary_domain(&site, "blog.example.com"), 50)
            .await
            .expect("register failed");

        assert!(store.domain_in_use("blog.example.com").await.unwrap());
        assert_eq!(store.delete_domains(&site.id).await.unwrap(), 1);
        site.status = SiteStatus::Deleted;
        store.update_site(&site).await.expect("update failed");
        assert!(store.domain_in_use("blog.example.com").await.unwrap());

        let other = test_site("bob");
        let err = store
            .register_site(&other, &primary_domain(&other, "blog.example.com"), 50)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[tokio::test]
    async fn usernames_are_tracked() {
        let store = MemoryStore::new();
        let site = test_site("alice");
        store
            .register_site(&site, &primary_domain(&site, "db.example.com"), 50)
            .await
            .expect("register failed");
        let database = SiteDatabase {
            id: DatabaseId::generate(),
            site_id: site.id.clone(),
            database_name: "site_abc".to_owned(),
            username: "site_abc_user".to_owned(),
            password: "secret".to_owned(),
            host: "mysql".to_owned(),
            port: 3306,
            engine: crate::types::DatabaseEngine::MySql,
            created_at: Utc::now(),
        };
        store.insert_database(&database).await.expect("insert failed");

        assert!(store.database_username_in_use(&database.username).await.unwrap());
        assert!(!store.database_username_in_use("site_other_user").await.unwrap());
    }

    #[tokio::test]
    async fn deployment_updates_are_monotonic() {
        let store = MemoryStore::new();
        let mut record = test_deployment(&SiteId::new("site-1"));
        let id = record.data.id.clone();
        store.insert(&record).await.expect("insert failed");

        // Skipping running is rejected.
        record.status = DeploymentStatus::Completed;
        let err = store
            .update(&record, DeploymentStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidStateTransition { .. }));

        record.status = DeploymentStatus::Running;
        record.data.started_at = Some(Utc::now());
        store
            .update(&record, DeploymentStatus::Pending)
            .await
            .expect("start failed");

        record.status = DeploymentStatus::Failed;
        record.data.completed_at = Some(Utc::now());
        store
            .update(&record, DeploymentStatus::Running)
            .await
            .expect("fail failed");

        // Terminal records never move again.
        record.status = DeploymentStatus::Completed;
        assert!(store
            .update(&record, DeploymentStatus::Failed)
            .await
            .is_err());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert!(stored.data.completed_at.is_some());
    }

    #[tokio::test]
    async fn list_deployments_by_site() {
        let store = MemoryStore::new();
        let site_a = SiteId::new("a");
        let site_b = SiteId::new("b");

        for _ in 0..3 {
            store.insert(&test_deployment(&site_a)).await.unwrap();
        }
        store.insert(&test_deployment(&site_b)).await.unwrap();

        let a = store
            .list(&DeploymentFilter::new().with_site(site_a.clone()))
            .await
            .unwrap();
        assert_eq!(a.len(), 3);

        let page = store
            .list(&DeploymentFilter::new().with_site(site_a).with_limit(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let counts = store.count_by_status().await.unwrap();
        assert!(counts.contains(&(DeploymentStatus::Pending, 4)));
    }

    #[tokio::test]
    async fn database_names_are_unique() {
        let store = MemoryStore::new();
        let database = SiteDatabase {
            id: DatabaseId::generate(),
            site_id: SiteId::new("a"),
            database_name: "site_a".to_owned(),
            username: "site_a_user".to_owned(),
            password: "secret".to_owned(),
            host: "mysql".to_owned(),
            port: 3306,
            engine: crate::types::DatabaseEngine::MySql,
            created_at: Utc::now(),
        };
        store.insert_database(&database).await.unwrap();

        let mut dup = database.clone();
        dup.id = DatabaseId::generate();
        assert!(matches!(
            store.insert_database(&dup).await,
            Err(ControlError::Conflict(_))
        ));

        assert!(store.delete_database(&database.id).await.unwrap());
        assert!(!store.delete_database(&database.id).await.unwrap());
    }
}
