//! PostgreSQL store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    BackupId, DatabaseId, DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus,
    Domain, DomainId, Site, SiteBackup, SiteDatabase, SiteId, SiteStatus, UserId,
};

use super::{check_transition, DeploymentFilter, DeploymentStore, SiteFilter, SiteStore};

const SITE_COLUMNS: &str = "id, name, description, domain, user_id, platform, template, status, \
     storage_limit_gb, storage_used_mb, directory, container_id, container_name, container_port, \
     created_at, updated_at, last_backup_at";

const DOMAIN_COLUMNS: &str = "id, site_id, domain_name, domain_type, is_primary, ssl_enabled, \
     ssl_expires_at, dns_verified, verification_token, created_at, updated_at";

const DATABASE_COLUMNS: &str =
    "id, site_id, database_name, username, password, host, port, engine, created_at";

const BACKUP_COLUMNS: &str = "id, site_id, file_name, file_path, size_bytes, backup_type, \
     description, includes_database, includes_files, created_at, expires_at";

const DEPLOYMENT_COLUMNS: &str = "id, site_id, deployment_type, status, message, initiated_by, \
     created_at, updated_at, started_at, completed_at";

/// Matches a domain held by a domain row or by any site, deleted or not.
const DOMAIN_TAKEN: &str = "SELECT 1 FROM domains WHERE domain_name = $1 \
     UNION ALL SELECT 1 FROM sites WHERE domain = $1 LIMIT 1";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> ControlResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                domain TEXT NOT NULL,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                template TEXT NOT NULL,
                status TEXT NOT NULL,
                storage_limit_gb INTEGER NOT NULL,
                storage_used_mb BIGINT NOT NULL DEFAULT 0,
                directory TEXT,
                container_id TEXT,
                container_name TEXT,
                container_port INTEGER,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_backup_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_domain ON sites (domain)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id),
                domain_name TEXT NOT NULL UNIQUE,
                domain_type TEXT NOT NULL,
                is_primary BOOLEAN NOT NULL DEFAULT FALSE,
                ssl_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                ssl_expires_at TIMESTAMPTZ,
                dns_verified BOOLEAN NOT NULL DEFAULT FALSE,
                verification_token TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_domains_one_primary
            ON domains (site_id) WHERE is_primary
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS site_databases (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id),
                database_name TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL UNIQUE,
                password TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                engine TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS site_backups (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL REFERENCES sites(id),
                file_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                size_bytes BIGINT NOT NULL,
                backup_type TEXT NOT NULL,
                description TEXT,
                includes_database BOOLEAN NOT NULL,
                includes_files BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                deployment_type TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT,
                initiated_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_sites_user ON sites (user_id)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_site
            ON deployments (site_id, created_at DESC)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_domains_ssl_expiry
            ON domains (ssl_expires_at) WHERE ssl_enabled
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn row_to_site(row: &PgRow) -> ControlResult<Site> {
        let status: String = row.get("status");
        let storage_limit_gb: i32 = row.get("storage_limit_gb");
        let storage_used_mb: i64 = row.get("storage_used_mb");
        let container_port: Option<i32> = row.get("container_port");

        Ok(Site {
            id: SiteId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            description: row.get("description"),
            domain: row.get("domain"),
            user_id: UserId::new(row.get::<String, _>("user_id")),
            platform: row.get("platform"),
            template: row.get("template"),
            status: parse_column("site status", &status)?,
            storage_limit_gb: u32::try_from(storage_limit_gb).unwrap_or_default(),
            storage_used_mb: u64::try_from(storage_used_mb).unwrap_or_default(),
            directory: row.get("directory"),
            container_id: row.get("container_id"),
            container_name: row.get("container_name"),
            container_port: container_port.and_then(|p| u16::try_from(p).ok()),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_backup_at: row.get("last_backup_at"),
        })
    }

    fn row_to_domain(row: &PgRow) -> ControlResult<Domain> {
        let domain_type: String = row.get("domain_type");
        Ok(Domain {
            id: DomainId::new(row.get::<String, _>("id")),
            site_id: SiteId::new(row.get::<String, _>("site_id")),
            domain_name: row.get("domain_name"),
            domain_type: parse_column("domain type", &domain_type)?,
            is_primary: row.get("is_primary"),
            ssl_enabled: row.get("ssl_enabled"),
            ssl_expires_at: row.get("ssl_expires_at"),
            dns_verified: row.get("dns_verified"),
            verification_token: row.get("verification_token"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_database(row: &PgRow) -> ControlResult<SiteDatabase> {
        let engine: String = row.get("engine");
        let port: i32 = row.get("port");
        Ok(SiteDatabase {
            id: DatabaseId::new(row.get::<String, _>("id")),
            site_id: SiteId::new(row.get::<String, _>("site_id")),
            database_name: row.get("database_name"),
            username: row.get("username"),
            password: row.get("password"),
            host: row.get("host"),
            port: u16::try_from(port).map_err(|e| {
                ControlError::Serialisation(format!("invalid database port {port}: {e}"))
            })?,
            engine: parse_column("database engine", &engine)?,
            created_at: row.get("created_at"),
        })
    }

    fn row_to_backup(row: &PgRow) -> ControlResult<SiteBackup> {
        let backup_type: String = row.get("backup_type");
        let size_bytes: i64 = row.get("size_bytes");
        Ok(SiteBackup {
            id: BackupId::new(row.get::<String, _>("id")),
            site_id: SiteId::new(row.get::<String, _>("site_id")),
            file_name: row.get("file_name"),
            file_path: row.get("file_path"),
            size_bytes: u64::try_from(size_bytes).unwrap_or_default(),
            backup_type: parse_column("backup type", &backup_type)?,
            description: row.get("description"),
            includes_database: row.get("includes_database"),
            includes_files: row.get("includes_files"),
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        })
    }

    fn row_to_deployment(row: &PgRow) -> ControlResult<DeploymentRecord> {
        let deployment_type: String = row.get("deployment_type");
        let status: String = row.get("status");
        Ok(DeploymentRecord {
            data: DeploymentData {
                id: DeploymentId::new(row.get::<String, _>("id")),
                site_id: SiteId::new(row.get::<String, _>("site_id")),
                deployment_type: parse_column("deployment type", &deployment_type)?,
                message: row.get("message"),
                initiated_by: row.get("initiated_by"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
            },
            status: parse_column("deployment status", &status)?,
        })
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(what: &str, value: &str) -> ControlResult<T> {
    value
        .parse()
        .map_err(|e| ControlError::Serialisation(format!("failed to parse {what} '{value}': {e}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Map unique-constraint violations to `Conflict`.
fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> ControlError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => ControlError::Conflict(what()),
        _ => ControlError::Database(err),
    }
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, site_id, deployment_type, status, message, initiated_by,
                created_at, updated_at, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.data.id.as_str())
        .bind(record.data.site_id.as_str())
        .bind(record.data.deployment_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.data.message)
        .bind(&record.data.initiated_by)
        .bind(record.data.created_at)
        .bind(record.data.updated_at)
        .bind(record.data.started_at)
        .bind(record.data.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("deployment {} already exists", record.data.id)))?;

        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn update(
        &self,
        record: &DeploymentRecord,
        from: DeploymentStatus,
    ) -> ControlResult<()> {
        // Validate the move itself before touching the row; the WHERE clause
        // then guards against a concurrent writer.
        check_transition(from, from, record.status)?;

        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $1,
                message = $2,
                updated_at = $3,
                started_at = COALESCE(started_at, $4),
                completed_at = COALESCE(completed_at, $5)
            WHERE id = $6 AND status = $7
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.data.message)
        .bind(record.data.updated_at)
        .bind(record.data.started_at)
        .bind(record.data.completed_at)
        .bind(record.data.id.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(&record.data.id).await? {
                Some(stored) => Err(ControlError::InvalidStateTransition {
                    from: stored.status.as_str(),
                    to: record.status.as_str(),
                }),
                None => Err(ControlError::not_found("deployment", &record.data.id)),
            };
        }

        Ok(())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref site_id) = filter.site_id {
            params.push(site_id.as_str().to_owned());
            query.push_str(&format!(" AND site_id = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        if let Some(deployment_type) = filter.deployment_type {
            params.push(deployment_type.as_str().to_owned());
            query.push_str(&format!(" AND deployment_type = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM deployments GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: Vec<(DeploymentStatus, u64)> =
            DeploymentStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let status: DeploymentStatus = parse_column("deployment status", &status)?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 = u64::try_from(n).unwrap_or_default();
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl SiteStore for PostgresStore {
    async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn register_site(
        &self,
        site: &Site,
        primary_domain: &Domain,
        max_sites_per_user: u32,
    ) -> ControlResult<()> {
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query(DOMAIN_TAKEN)
            .bind(&primary_domain.domain_name)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(ControlError::conflict(format!(
                "domain {} is already in use",
                primary_domain.domain_name
            )));
        }

        let owned: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM sites WHERE user_id = $1 AND status <> 'deleted'",
        )
        .bind(site.user_id.as_str())
        .fetch_one(&mut *tx)
        .await?
        .get("n");

        if owned >= i64::from(max_sites_per_user) {
            return Err(ControlError::validation(format!(
                "user {} has reached the limit of {max_sites_per_user} sites",
                site.user_id
            )));
        }

        sqlx::query(&format!(
            "INSERT INTO sites ({SITE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(site.id.as_str())
        .bind(&site.name)
        .bind(&site.description)
        .bind(&site.domain)
        .bind(site.user_id.as_str())
        .bind(&site.platform)
        .bind(&site.template)
        .bind(site.status.as_str())
        .bind(i32::try_from(site.storage_limit_gb).unwrap_or(i32::MAX))
        .bind(to_i64(site.storage_used_mb))
        .bind(&site.directory)
        .bind(&site.container_id)
        .bind(&site.container_name)
        .bind(site.container_port.map(i32::from))
        .bind(site.created_at)
        .bind(site.updated_at)
        .bind(site.last_backup_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("site {} or domain {} already exists", site.id, site.domain)
            })
        })?;

        sqlx::query(&format!(
            "INSERT INTO domains ({DOMAIN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(primary_domain.id.as_str())
        .bind(primary_domain.site_id.as_str())
        .bind(&primary_domain.domain_name)
        .bind(primary_domain.domain_type.as_str())
        .bind(primary_domain.is_primary)
        .bind(primary_domain.ssl_enabled)
        .bind(primary_domain.ssl_expires_at)
        .bind(primary_domain.dns_verified)
        .bind(&primary_domain.verification_token)
        .bind(primary_domain.created_at)
        .bind(primary_domain.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("domain {} is already in use", primary_domain.domain_name)
            })
        })?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_site(&self, id: &SiteId) -> ControlResult<Option<Site>> {
        let row = sqlx::query(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_site).transpose()
    }

    async fn update_site(&self, site: &Site) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites
            SET name = $1, description = $2, domain = $3, platform = $4, template = $5,
                status = $6, storage_limit_gb = $7, storage_used_mb = $8, directory = $9,
                container_id = $10, container_name = $11, container_port = $12,
                updated_at = $13, last_backup_at = $14
            WHERE id = $15
            "#,
        )
        .bind(&site.name)
        .bind(&site.description)
        .bind(&site.domain)
        .bind(&site.platform)
        .bind(&site.template)
        .bind(site.status.as_str())
        .bind(i32::try_from(site.storage_limit_gb).unwrap_or(i32::MAX))
        .bind(to_i64(site.storage_used_mb))
        .bind(&site.directory)
        .bind(&site.container_id)
        .bind(&site.container_name)
        .bind(site.container_port.map(i32::from))
        .bind(site.updated_at)
        .bind(site.last_backup_at)
        .bind(site.id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("site", &site.id));
        }
        Ok(())
    }

    async fn list_sites(&self, filter: &SiteFilter) -> ControlResult<Vec<Site>> {
        let mut query = format!("SELECT {SITE_COLUMNS} FROM sites WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            params.push(user_id.as_str().to_owned());
            query.push_str(&format!(" AND user_id = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_site).collect()
    }

    async fn count_sites_by_status(&self) -> ControlResult<Vec<(SiteStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sites GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: Vec<(SiteStatus, u64)> =
            SiteStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let status: SiteStatus = parse_column("site status", &status)?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 = u64::try_from(n).unwrap_or_default();
            }
        }
        Ok(counts)
    }

    async fn domain_in_use(&self, domain_name: &str) -> ControlResult<bool> {
        let row = sqlx::query(DOMAIN_TAKEN)
            .bind(domain_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_domain(&self, id: &DomainId) -> ControlResult<Option<Domain>> {
        let row = sqlx::query(&format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_domain).transpose()
    }

    async fn update_domain(&self, domain: &Domain) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE domains
            SET domain_type = $1, is_primary = $2, ssl_enabled = $3, ssl_expires_at = $4,
                dns_verified = $5, verification_token = $6, updated_at = $7
            WHERE id = $8
            "#,
        )
        .bind(domain.domain_type.as_str())
        .bind(domain.is_primary)
        .bind(domain.ssl_enabled)
        .bind(domain.ssl_expires_at)
        .bind(domain.dns_verified)
        .bind(&domain.verification_token)
        .bind(domain.updated_at)
        .bind(domain.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("site {} already has a primary domain", domain.site_id)
            })
        })?;

        if result.rows_affected() == 0 {
            return Err(ControlError::not_found("domain", &domain.id));
        }
        Ok(())
    }

    async fn list_domains(&self, site_id: &SiteId) -> ControlResult<Vec<Domain>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE site_id = $1 \
             ORDER BY is_primary DESC, domain_name"
        ))
        .bind(site_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_domain).collect()
    }

    async fn delete_domains(&self, site_id: &SiteId) -> ControlResult<u64> {
        let result = sqlx::query("DELETE FROM domains WHERE site_id = $1")
            .bind(site_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn domains_expiring_before(&self, before: DateTime<Utc>) -> ControlResult<Vec<Domain>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains \
             WHERE ssl_enabled AND ssl_expires_at <= $1 ORDER BY ssl_expires_at"
        ))
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_domain).collect()
    }

    async fn database_name_in_use(&self, database_name: &str) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 FROM site_databases WHERE database_name = $1")
            .bind(database_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn database_username_in_use(&self, username: &str) -> ControlResult<bool> {
        let row = sqlx::query("SELECT 1 FROM site_databases WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_database(&self, database: &SiteDatabase) -> ControlResult<()> {
        sqlx::query(&format!(
            "INSERT INTO site_databases ({DATABASE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(database.id.as_str())
        .bind(database.site_id.as_str())
        .bind(&database.database_name)
        .bind(&database.username)
        .bind(&database.password)
        .bind(&database.host)
        .bind(i32::from(database.port))
        .bind(database.engine.as_str())
        .bind(database.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("database {} already exists", database.database_name)
            })
        })?;

        Ok(())
    }

    async fn get_database(&self, id: &DatabaseId) -> ControlResult<Option<SiteDatabase>> {
        let row = sqlx::query(&format!(
            "SELECT {DATABASE_COLUMNS} FROM site_databases WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_database).transpose()
    }

    async fn list_databases(&self, site_id: &SiteId) -> ControlResult<Vec<SiteDatabase>> {
        let rows = sqlx::query(&format!(
            "SELECT {DATABASE_COLUMNS} FROM site_databases WHERE site_id = $1 ORDER BY created_at"
        ))
        .bind(site_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_database).collect()
    }

    async fn delete_database(&self, id: &DatabaseId) -> ControlResult<bool> {
        let result = sqlx::query("DELETE FROM site_databases WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_backup(&self, backup: &SiteBackup) -> ControlResult<()> {
        sqlx::query(&format!(
            "INSERT INTO site_backups ({BACKUP_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(backup.id.as_str())
        .bind(backup.site_id.as_str())
        .bind(&backup.file_name)
        .bind(&backup.file_path)
        .bind(to_i64(backup.size_bytes))
        .bind(backup.backup_type.as_str())
        .bind(&backup.description)
        .bind(backup.includes_database)
        .bind(backup.includes_files)
        .bind(backup.created_at)
        .bind(backup.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_on_unique(e, || format!("backup {} already exists", backup.id)))?;

        Ok(())
    }

    async fn get_backup(&self, id: &BackupId) -> ControlResult<Option<SiteBackup>> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM site_backups WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_backup).transpose()
    }

    async fn list_backups(&self, site_id: &SiteId) -> ControlResult<Vec<SiteBackup>> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM site_backups WHERE site_id = $1 ORDER BY created_at DESC"
        ))
        .bind(site_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_backup).collect()
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, DeploymentType, DomainType};

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    fn test_site() -> (Site, Domain) {
        let site = Site::new(
            "Blog".to_owned(),
            format!("{}.example.com", SiteId::generate()),
            UserId::new("pg-test"),
            "hugo".to_owned(),
            "default".to_owned(),
            10,
        );
        let domain = Domain::new(
            site.id.clone(),
            site.domain.clone(),
            DomainType::Subdomain,
            true,
        );
        (site, domain)
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn register_and_get() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url, 2).await.expect("failed to connect");

        let (site, domain) = test_site();
        store
            .register_site(&site, &domain, 1000)
            .await
            .expect("register failed");

        let retrieved = store
            .get_site(&site.id)
            .await
            .expect("get failed")
            .expect("site not found");
        assert_eq!(retrieved.domain, site.domain);
        assert!(store.domain_in_use(&site.domain).await.unwrap());

        let (other, mut dup) = test_site();
        dup.domain_name.clone_from(&site.domain);
        assert!(matches!(
            store.register_site(&other, &dup, 1000).await,
            Err(ControlError::Conflict(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn deployment_transitions() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url, 2).await.expect("failed to connect");

        let mut record = DeploymentRecord::new(DeploymentData::new(
            SiteId::generate(),
            DeploymentType::Restart,
            &Actor::system(),
        ));
        store.insert(&record).await.expect("insert failed");

        record.status = DeploymentStatus::Running;
        record.data.started_at = Some(Utc::now());
        store
            .update(&record, DeploymentStatus::Pending)
            .await
            .expect("update failed");

        // A stale writer still thinking the record is pending loses.
        assert!(store
            .update(&record, DeploymentStatus::Pending)
            .await
            .is_err());

        let stored = store.get(&record.data.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Running);
    }
}
