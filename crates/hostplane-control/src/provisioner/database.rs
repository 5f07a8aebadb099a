//! Tenant database provisioning.
//!
//! [`DatabaseProvisioner`] owns naming, credentials and the metadata rows in
//! the site store. The engine-level work (DDL, dumps, connectivity) goes
//! through a [`TenantEngine`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::store::SiteStore;
use crate::types::{DatabaseEngine, DatabaseId, Site, SiteDatabase};

/// Characters a generated password is drawn from.
const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Length of a generated password.
const PASSWORD_LEN: usize = 16;

/// MySQL limits user names to 32 characters.
const MAX_USERNAME_LEN: usize = 32;

/// How many suffixed names to try before giving up on a free database name.
const MAX_NAME_ATTEMPTS: u32 = 10;

/// Result of dropping a tenant database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// The database and its user were removed.
    Dropped,
    /// No database with that ID is recorded.
    NotFound,
}

/// Engine-level operations on tenant databases.
#[async_trait]
pub trait TenantEngine: Send + Sync {
    /// Create the schema and a user with full privileges on it.
    async fn create(&self, database: &SiteDatabase) -> ControlResult<()>;

    /// Drop the schema and its user. Missing objects are not an error.
    async fn destroy(&self, database: &SiteDatabase) -> ControlResult<()>;

    /// Copy all data from `source` into the empty `target`.
    async fn copy_data(&self, source: &SiteDatabase, target: &SiteDatabase) -> ControlResult<()>;

    /// Connect with the tenant credentials.
    async fn ping(&self, database: &SiteDatabase) -> ControlResult<()>;

    /// Table names, sorted.
    async fn tables(&self, database: &SiteDatabase) -> ControlResult<Vec<String>>;

    /// Data plus index size in bytes.
    async fn size_bytes(&self, database: &SiteDatabase) -> ControlResult<u64>;

    /// Write an SQL dump to `path`.
    async fn dump(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()>;

    /// Load an SQL dump from `path`.
    async fn restore(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()>;
}

/// Creates, drops and clones tenant databases for sites.
pub struct DatabaseProvisioner {
    store: Arc<dyn SiteStore>,
    engine: Arc<dyn TenantEngine>,
    host: String,
    port: u16,
}

impl DatabaseProvisioner {
    /// Create a provisioner recording `host:port` as the address sites use.
    pub fn new(
        store: Arc<dyn SiteStore>,
        engine: Arc<dyn TenantEngine>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            store,
            engine,
            host: host.into(),
            port,
        }
    }

    /// Provision a database and user for a site.
    pub async fn create_database(&self, site: &Site) -> ControlResult<SiteDatabase> {
        let database_name = self.free_database_name(site).await?;
        let database = SiteDatabase {
            id: DatabaseId::generate(),
            site_id: site.id.clone(),
            username: username_for(&database_name),
            database_name,
            password: generate_password(),
            host: self.host.clone(),
            port: self.port,
            engine: DatabaseEngine::MySql,
            created_at: Utc::now(),
        };

        self.engine.create(&database).await?;

        if let Err(e) = self.store.insert_database(&database).await {
            warn!(
                database = %database.database_name,
                error = %e,
                "failed to record database, dropping it"
            );
            if let Err(drop_err) = self.engine.destroy(&database).await {
                warn!(database = %database.database_name, error = %drop_err, "cleanup failed");
            }
            return Err(e);
        }

        info!(
            site_id = %site.id,
            database = %database.database_name,
            "created database"
        );
        Ok(database)
    }

    /// Drop a database and its user.
    ///
    /// An unknown ID yields [`DropOutcome::NotFound`], so repeated drops are
    /// safe.
    pub async fn drop_database(&self, id: &DatabaseId) -> ControlResult<DropOutcome> {
        let Some(database) = self.store.get_database(id).await? else {
            debug!(database_id = %id, "drop of unknown database");
            return Ok(DropOutcome::NotFound);
        };

        self.engine.destroy(&database).await?;
        self.store.delete_database(id).await?;

        info!(database = %database.database_name, "dropped database");
        Ok(DropOutcome::Dropped)
    }

    /// Create a database for `target` holding a copy of `source_id`.
    pub async fn clone_database(
        &self,
        source_id: &DatabaseId,
        target: &Site,
    ) -> ControlResult<SiteDatabase> {
        let source = self
            .store
            .get_database(source_id)
            .await?
            .ok_or_else(|| ControlError::not_found("database", source_id))?;

        let database = self.create_database(target).await?;

        if let Err(e) = self.engine.copy_data(&source, &database).await {
            warn!(
                source = %source.database_name,
                target = %database.database_name,
                error = %e,
                "copy failed, dropping target database"
            );
            if let Err(drop_err) = self.drop_database(&database.id).await {
                warn!(database = %database.database_name, error = %drop_err, "cleanup failed");
            }
            return Err(e);
        }

        info!(
            source = %source.database_name,
            target = %database.database_name,
            "cloned database"
        );
        Ok(database)
    }

    /// Whether the tenant credentials can connect.
    pub async fn test_connection(&self, id: &DatabaseId) -> ControlResult<bool> {
        let database = self.require(id).await?;
        match self.engine.ping(&database).await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(database = %database.database_name, error = %e, "connection test failed");
                Ok(false)
            }
        }
    }

    /// Tables in a tenant database.
    pub async fn list_tables(&self, id: &DatabaseId) -> ControlResult<Vec<String>> {
        let database = self.require(id).await?;
        self.engine.tables(&database).await
    }

    /// Size of a tenant database in bytes.
    pub async fn database_size(&self, id: &DatabaseId) -> ControlResult<u64> {
        let database = self.require(id).await?;
        self.engine.size_bytes(&database).await
    }

    /// Write an SQL dump of a tenant database to `path`.
    pub async fn dump_database(&self, id: &DatabaseId, path: &Path) -> ControlResult<()> {
        let database = self.require(id).await?;
        self.engine.dump(&database, path).await
    }

    /// Load an SQL dump into a tenant database.
    pub async fn restore_database(&self, id: &DatabaseId, path: &Path) -> ControlResult<()> {
        let database = self.require(id).await?;
        self.engine.restore(&database, path).await
    }

    async fn require(&self, id: &DatabaseId) -> ControlResult<SiteDatabase> {
        self.store
            .get_database(id)
            .await?
            .ok_or_else(|| ControlError::not_found("database", id))
    }

    async fn name_is_free(&self, database_name: &str) -> ControlResult<bool> {
        Ok(!self.store.database_name_in_use(database_name).await?
            && !self
                .store
                .database_username_in_use(&username_for(database_name))
                .await?)
    }

    async fn free_database_name(&self, site: &Site) -> ControlResult<String> {
        let base = database_name_for(site);
        if self.name_is_free(&base).await? {
            return Ok(base);
        }
        for n in 2..=MAX_NAME_ATTEMPTS {
            let candidate = format!("{base}_{n}");
            if self.name_is_free(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(ControlError::conflict(format!(
            "no free database name for site {}",
            site.id
        )))
    }
}

impl std::fmt::Debug for DatabaseProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseProvisioner")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// `site_{id}` with the id stripped to identifier characters.
#[must_use]
pub fn database_name_for(site: &Site) -> String {
    let compact: String = site
        .id
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("site_{compact}")
}

/// `{database}_user`, shortening the id part so a numeric name suffix
/// survives.
fn username_for(database_name: &str) -> String {
    let full = format!("{database_name}_user");
    if full.len() <= MAX_USERNAME_LEN {
        return full;
    }
    let (stem, suffix) = match database_name.rsplit_once('_') {
        Some((stem, n)) if stem.contains('_') && n.bytes().all(|b| b.is_ascii_digit()) => {
            (stem, &database_name[stem.len()..])
        }
        _ => (database_name, ""),
    };
    let keep = (MAX_USERNAME_LEN - "_user".len())
        .saturating_sub(suffix.len())
        .min(stem.len());
    format!("{}{suffix}_user", &stem[..keep])
}

/// Random password from [`PASSWORD_CHARSET`].
#[must_use]
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LEN)
        .map(|_| char::from(PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())]))
        .collect()
}

/// Reject anything that is not a plain identifier.
pub(crate) fn checked_identifier(name: &str) -> ControlResult<&str> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(ControlError::validation(format!(
            "invalid database identifier: {name}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::mock::MockEngine;
    use crate::store::MemoryStore;
    use crate::types::{DomainType, Domain, UserId};

    async fn setup() -> (Arc<MemoryStore>, Arc<MockEngine>, DatabaseProvisioner, Site) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MockEngine::new());
        let provisioner = DatabaseProvisioner::new(
            store.clone(),
            engine.clone(),
            "mysql",
            3306,
        );
        let site = Site::new(
            "Blog".to_owned(),
            "blog.example.com".to_owned(),
            UserId::new("alice"),
            "wordpress".to_owned(),
            "default".to_owned(),
            10,
        );
        let domain = Domain::new(
            site.id.clone(),
            site.domain.clone(),
            DomainType::Subdomain,
            true,
        );
        store.register_site(&site, &domain, 50).await.unwrap();
        (store, engine, provisioner, site)
    }

    #[test]
    fn passwords_use_the_charset() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
    }

    #[test]
    fn usernames_fit_mysql_limit() {
        let short = username_for("site_abc");
        assert_eq!(short, "site_abc_user");

        let long = username_for("site_01hzy3k8r4q9m2c7v5x6w0b1nd");
        assert!(long.len() <= MAX_USERNAME_LEN);
        assert!(long.starts_with("site_01hzy"));
        assert!(long.ends_with("_user"));
    }

    #[test]
    fn suffixed_usernames_stay_distinct() {
        let base = "site_01m59h1x28yfeysa4cthvn56aq";
        let first = username_for(base);
        let second = username_for(&format!("{base}_2"));
        let tenth = username_for(&format!("{base}_10"));

        assert_ne!(first, second);
        assert_ne!(second, tenth);
        assert!(second.ends_with("_2_user"), "{second}");
        assert!(tenth.ends_with("_10_user"), "{tenth}");
        for name in [&first, &second, &tenth] {
            assert!(name.len() <= MAX_USERNAME_LEN, "{name}");
        }
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(checked_identifier("site_abc").is_ok());
        assert!(checked_identifier("site`; DROP").is_err());
        assert!(checked_identifier("").is_err());
    }

    #[tokio::test]
    async fn create_records_database() {
        let (store, engine, provisioner, site) = setup().await;

        let database = provisioner.create_database(&site).await.unwrap();
        assert_eq!(database.database_name, database_name_for(&site));
        assert_eq!(database.host, "mysql");
        assert!(engine.exists(&database.database_name));

        let recorded = store.list_databases(&site.id).await.unwrap();
        assert_eq!(recorded.len(), 1);
    }

    #[tokio::test]
    async fn second_database_gets_suffixed_name() {
        let (_store, _engine, provisioner, site) = setup().await;

        let first = provisioner.create_database(&site).await.unwrap();
        let second = provisioner.create_database(&site).await.unwrap();
        assert_ne!(first.database_name, second.database_name);
        assert!(second.database_name.ends_with("_2"));
        assert_ne!(first.username, second.username);
    }

    #[tokio::test]
    async fn dropping_one_database_keeps_sibling_login() {
        let (_store, engine, provisioner, site) = setup().await;

        let first = provisioner.create_database(&site).await.unwrap();
        let second = provisioner.create_database(&site).await.unwrap();
        provisioner.drop_database(&first.id).await.unwrap();

        assert!(engine.has_user(&second.username));
        assert!(provisioner.test_connection(&second.id).await.unwrap());
    }

    #[tokio::test]
    async fn repeated_drop_reports_not_found() {
        let (_store, engine, provisioner, site) = setup().await;

        let database = provisioner.create_database(&site).await.unwrap();
        assert_eq!(
            provisioner.drop_database(&database.id).await.unwrap(),
            DropOutcome::Dropped
        );
        assert!(!engine.exists(&database.database_name));
        assert_eq!(
            provisioner.drop_database(&database.id).await.unwrap(),
            DropOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn clone_of_missing_source_is_not_found() {
        let (_store, _engine, provisioner, site) = setup().await;

        let err = provisioner
            .clone_database(&DatabaseId::new("missing"), &site)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn clone_copies_tables() {
        let (_store, engine, provisioner, site) = setup().await;

        let source = provisioner.create_database(&site).await.unwrap();
        engine.add_table(&source.database_name, "wp_posts");

        let copy = provisioner.clone_database(&source.id, &site).await.unwrap();
        assert_eq!(
            provisioner.list_tables(&copy.id).await.unwrap(),
            vec!["wp_posts".to_owned()]
        );
    }

    #[tokio::test]
    async fn failing_engine_records_nothing() {
        let (store, engine, provisioner, site) = setup().await;
        engine.set_failing(true);

        assert!(provisioner.create_database(&site).await.is_err());
        assert!(store.list_databases(&site.id).await.unwrap().is_empty());
    }
}
