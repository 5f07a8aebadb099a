//! MySQL tenant engine.
//!
//! DDL runs over an admin pool; dumps and restores shell out to the
//! `mysqldump` and `mysql` clients with the tenant's own credentials passed
//! through `MYSQL_PWD`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::{Connection, Row};
use tracing::{debug, instrument, warn};

use crate::config::MySqlConfig;
use crate::error::{ControlError, ControlResult, Provider};
use crate::process::ProcessCommand;
use crate::types::SiteDatabase;

use super::database::{checked_identifier, TenantEngine};

/// Tenant engine backed by a shared MySQL server.
pub struct MySqlEngine {
    admin: MySqlPool,
    config: MySqlConfig,
}

impl MySqlEngine {
    /// Create an engine. The admin pool connects lazily on first use.
    pub fn new(config: MySqlConfig) -> ControlResult<Self> {
        let admin = MySqlPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&config.admin_url)
            .map_err(|e| ControlError::Config(format!("invalid mysql admin url: {e}")))?;
        Ok(Self { admin, config })
    }

    async fn execute_admin(&self, sql: &str) -> ControlResult<()> {
        sqlx::raw_sql(sql)
            .execute(&self.admin)
            .await
            .map_err(|e| ControlError::provider(Provider::Database, e.to_string()))?;
        Ok(())
    }

    fn client(&self, program: &str, database: &SiteDatabase) -> ProcessCommand {
        ProcessCommand::new(program, self.config.dump_timeout())
            .arg("-h")
            .arg(&database.host)
            .arg("-P")
            .arg(database.port.to_string())
            .arg("-u")
            .arg(&database.username)
            .env("MYSQL_PWD", &database.password)
    }

    fn scratch_path(database: &SiteDatabase) -> PathBuf {
        std::env::temp_dir().join(format!(
            "hostplane-clone-{}-{}.sql",
            database.database_name,
            ulid::Ulid::new().to_string().to_lowercase()
        ))
    }
}

/// Quote a value as an SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

#[async_trait]
impl TenantEngine for MySqlEngine {
    #[instrument(skip(self, database), fields(database = %database.database_name))]
    async fn create(&self, database: &SiteDatabase) -> ControlResult<()> {
        let name = checked_identifier(&database.database_name)?;
        let user = checked_identifier(&database.username)?;

        self.execute_admin(&format!(
            "CREATE DATABASE `{name}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
        ))
        .await?;
        let created_user = self
            .execute_admin(&format!(
                "CREATE USER '{user}'@'%' IDENTIFIED BY {}",
                quote_literal(&database.password)
            ))
            .await;
        let granted = match created_user {
            Ok(()) => async {
                self.execute_admin(&format!(
                    "GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'%'"
                ))
                .await?;
                self.execute_admin("FLUSH PRIVILEGES").await
            }
            .await
            .map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };

        if let Err((e, owns_user)) = granted {
            // A user that already existed belongs to someone else
            let mut cleanup = vec![format!("DROP DATABASE IF EXISTS `{name}`")];
            if owns_user {
                cleanup.push(format!("DROP USER IF EXISTS '{user}'@'%'"));
            }
            for sql in cleanup {
                if let Err(drop_err) = self.execute_admin(&sql).await {
                    warn!(error = %drop_err, "cleanup after failed user setup failed");
                }
            }
            return Err(e);
        }

        debug!("database and user created");
        Ok(())
    }

    #[instrument(skip(self, database), fields(database = %database.database_name))]
    async fn destroy(&self, database: &SiteDatabase) -> ControlResult<()> {
        let name = checked_identifier(&database.database_name)?;
        let user = checked_identifier(&database.username)?;

        self.execute_admin(&format!("DROP DATABASE IF EXISTS `{name}`"))
            .await?;
        self.execute_admin(&format!("DROP USER IF EXISTS '{user}'@'%'"))
            .await?;
        Ok(())
    }

    async fn copy_data(&self, source: &SiteDatabase, target: &SiteDatabase) -> ControlResult<()> {
        let scratch = Self::scratch_path(source);
        let result = async {
            self.dump(source, &scratch).await?;
            self.restore(target, &scratch).await
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            debug!(path = %scratch.display(), error = %e, "failed to remove scratch dump");
        }
        result
    }

    async fn ping(&self, database: &SiteDatabase) -> ControlResult<()> {
        let options = MySqlConnectOptions::new()
            .host(&database.host)
            .port(database.port)
            .username(&database.username)
            .password(&database.password)
            .database(&database.database_name);

        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| ControlError::provider(Provider::Database, e.to_string()))?;
        conn.close()
            .await
            .map_err(|e| ControlError::provider(Provider::Database, e.to_string()))?;
        Ok(())
    }

    async fn tables(&self, database: &SiteDatabase) -> ControlResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT CAST(table_name AS CHAR) AS name FROM information_schema.tables \
             WHERE table_schema = ? ORDER BY table_name",
        )
        .bind(&database.database_name)
        .fetch_all(&self.admin)
        .await
        .map_err(|e| ControlError::provider(Provider::Database, e.to_string()))?;

        Ok(rows.iter().map(|row| row.get::<String, _>("name")).collect())
    }

    async fn size_bytes(&self, database: &SiteDatabase) -> ControlResult<u64> {
        let size: i64 = sqlx::query(
            "SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED) AS size \
             FROM information_schema.tables WHERE table_schema = ?",
        )
        .bind(&database.database_name)
        .fetch_one(&self.admin)
        .await
        .map_err(|e| ControlError::provider(Provider::Database, e.to_string()))?
        .get("size");

        Ok(u64::try_from(size).unwrap_or_default())
    }

    async fn dump(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()> {
        self.client(&self.config.mysqldump_path, database)
            .arg("--single-transaction")
            .arg("--routines")
            .arg(&database.database_name)
            .stdout_to(path)
            .run()
            .await?;
        Ok(())
    }

    async fn restore(&self, database: &SiteDatabase, path: &Path) -> ControlResult<()> {
        self.client(&self.config.mysql_path, database)
            .arg(&database.database_name)
            .stdin_from(path)
            .run()
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MySqlEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlEngine")
            .field("site_host", &self.config.site_host)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_are_quoted() {
        assert_eq!(quote_literal("abc!@#"), "'abc!@#'");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn engine_builds_without_connecting() {
        let engine = MySqlEngine::new(MySqlConfig::default());
        assert!(engine.is_ok());
    }
}
