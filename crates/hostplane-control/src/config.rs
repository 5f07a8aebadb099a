//! Configuration for hostplane-control.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};

/// Top-level configuration for the control service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostplaneConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Ledger database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Tenant MySQL engine configuration.
    #[serde(default)]
    pub mysql: MySqlConfig,

    /// Container runtime configuration.
    #[serde(default)]
    pub docker: DockerConfig,

    /// Site storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Certificate and reverse proxy configuration.
    #[serde(default)]
    pub ssl: SslConfig,

    /// DNS verification configuration.
    #[serde(default)]
    pub dns: DnsConfig,

    /// Workflow behaviour configuration.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl HostplaneConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `hostplane.toml` in the current directory (if present)
    /// 3. Environment variables with `HOSTPLANE_` prefix
    pub fn load() -> ControlResult<Self> {
        Self::from_file("hostplane.toml")
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HOSTPLANE_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))
    }
}

/// Address the HTTP API listens on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Listen {
    /// TCP socket address.
    Tcp {
        /// Socket address (IP and port).
        addr: SocketAddr,
    },
    /// Unix domain socket.
    Unix {
        /// Path to the socket file.
        path: PathBuf,
    },
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: Listen,

    /// Request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> Listen {
    Listen::Tcp {
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8085),
    }
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Ledger database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/hostplane".to_owned()
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Tenant MySQL engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MySqlConfig {
    /// Admin connection URL used to create databases and users.
    #[serde(default = "default_mysql_admin_url")]
    pub admin_url: String,

    /// Host recorded for tenant databases (as seen from site containers).
    #[serde(default = "default_mysql_site_host")]
    pub site_host: String,

    /// Port recorded for tenant databases.
    #[serde(default = "default_mysql_site_port")]
    pub site_port: u16,

    /// Path to the `mysqldump` binary.
    #[serde(default = "default_mysqldump")]
    pub mysqldump_path: String,

    /// Path to the `mysql` client binary.
    #[serde(default = "default_mysql_client")]
    pub mysql_path: String,

    /// Time limit for a dump or restore in seconds.
    #[serde(default = "default_dump_timeout_secs")]
    pub dump_timeout_secs: u64,
}

fn default_mysql_admin_url() -> String {
    "mysql://root@mysql:3306".to_owned()
}

fn default_mysql_site_host() -> String {
    "mysql".to_owned()
}

const fn default_mysql_site_port() -> u16 {
    3306
}

fn default_mysqldump() -> String {
    "mysqldump".to_owned()
}

fn default_mysql_client() -> String {
    "mysql".to_owned()
}

const fn default_dump_timeout_secs() -> u64 {
    600
}

impl MySqlConfig {
    /// Time limit for a dump or restore.
    #[must_use]
    pub const fn dump_timeout(&self) -> Duration {
        Duration::from_secs(self.dump_timeout_secs)
    }
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            admin_url: default_mysql_admin_url(),
            site_host: default_mysql_site_host(),
            site_port: default_mysql_site_port(),
            mysqldump_path: default_mysqldump(),
            mysql_path: default_mysql_client(),
            dump_timeout_secs: default_dump_timeout_secs(),
        }
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// Path to the Docker Engine socket.
    #[serde(default = "default_docker_socket")]
    pub socket: PathBuf,

    /// Bridge network site containers join.
    #[serde(default = "default_docker_network")]
    pub network: String,

    /// Grace period before a stopping container is killed, in seconds.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Number of log lines returned by a log tail.
    #[serde(default = "default_log_tail")]
    pub log_tail: u32,
}

fn default_docker_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_docker_network() -> String {
    "hostplane-sites".to_owned()
}

const fn default_stop_grace_secs() -> u64 {
    10
}

const fn default_log_tail() -> u32 {
    100
}

impl DockerConfig {
    /// Grace period before a stopping container is killed.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            network: default_docker_network(),
            stop_grace_secs: default_stop_grace_secs(),
            log_tail: default_log_tail(),
        }
    }
}

/// Site storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per site.
    #[serde(default = "default_sites_root")]
    pub sites_root: PathBuf,

    /// Directory holding `{platform}/{template}` template trees.
    #[serde(default = "default_templates_root")]
    pub templates_root: PathBuf,

    /// Directory backups are written to.
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Name of the optional install script inside a template tree.
    #[serde(default = "default_install_script")]
    pub install_script: String,

    /// Time limit for an install script in seconds.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// Time limit for creating or extracting an archive in seconds.
    #[serde(default = "default_archive_timeout_secs")]
    pub archive_timeout_secs: u64,
}

fn default_sites_root() -> PathBuf {
    PathBuf::from("/var/www/sites")
}

fn default_templates_root() -> PathBuf {
    PathBuf::from("/templates")
}

fn default_backup_root() -> PathBuf {
    PathBuf::from("/var/backups/hostplane")
}

fn default_install_script() -> String {
    "install.sh".to_owned()
}

const fn default_install_timeout_secs() -> u64 {
    300
}

const fn default_archive_timeout_secs() -> u64 {
    1800
}

impl StorageConfig {
    /// Time limit for an install script.
    #[must_use]
    pub const fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Time limit for an archive job.
    #[must_use]
    pub const fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sites_root: default_sites_root(),
            templates_root: default_templates_root(),
            backup_root: default_backup_root(),
            install_script: default_install_script(),
            install_timeout_secs: default_install_timeout_secs(),
            archive_timeout_secs: default_archive_timeout_secs(),
        }
    }
}

/// Certificate and reverse proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    /// Directory certificates are written to.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Directory private keys are written to.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,

    /// Validity of issued certificates in days.
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,

    /// Certificates expiring within this many days are renewed.
    #[serde(default = "default_renewal_threshold_days")]
    pub renewal_threshold_days: u32,

    /// Time limit for the HTTP reachability check in seconds.
    #[serde(default = "default_reachability_timeout_secs")]
    pub reachability_timeout_secs: u64,

    /// Issue certificates with a `*.domain` SAN.
    #[serde(default)]
    pub wildcard: bool,

    /// Directory reverse proxy server blocks are written to. No proxy
    /// configuration is written when unset.
    #[serde(default)]
    pub proxy_config_dir: Option<PathBuf>,

    /// Command that reloads the reverse proxy. Empty disables reloads.
    #[serde(default = "default_reload_command")]
    pub reload_command: Vec<String>,

    /// Time limit for the reload command in seconds.
    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("/etc/ssl/certs")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/etc/ssl/private")
}

const fn default_validity_days() -> u32 {
    90
}

const fn default_renewal_threshold_days() -> u32 {
    30
}

const fn default_reachability_timeout_secs() -> u64 {
    10
}

fn default_reload_command() -> Vec<String> {
    vec!["nginx".to_owned(), "-s".to_owned(), "reload".to_owned()]
}

const fn default_reload_timeout_secs() -> u64 {
    30
}

impl SslConfig {
    /// Time limit for the HTTP reachability check.
    #[must_use]
    pub const fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    /// Time limit for a proxy reload.
    #[must_use]
    pub const fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            key_dir: default_key_dir(),
            validity_days: default_validity_days(),
            renewal_threshold_days: default_renewal_threshold_days(),
            reachability_timeout_secs: default_reachability_timeout_secs(),
            wildcard: false,
            proxy_config_dir: None,
            reload_command: default_reload_command(),
            reload_timeout_secs: default_reload_timeout_secs(),
        }
    }
}

/// DNS verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Label prepended to a domain to find its verification TXT record.
    #[serde(default = "default_verification_prefix")]
    pub verification_prefix: String,

    /// Time limit for a TXT lookup in seconds.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
}

fn default_verification_prefix() -> String {
    "_hostplane-verification".to_owned()
}

const fn default_lookup_timeout_secs() -> u64 {
    10
}

impl DnsConfig {
    /// Time limit for a TXT lookup.
    #[must_use]
    pub const fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            verification_prefix: default_verification_prefix(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

/// Workflow behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Which provisioner implementations to wire.
    #[serde(default)]
    pub provisioners: ProvisionerType,

    /// Maximum number of non-deleted sites per user.
    #[serde(default = "default_max_sites_per_user")]
    pub max_sites_per_user: u32,

    /// Days a backup is kept before it may be expired.
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,

    /// Storage quota for sites that do not request one, in GB.
    #[serde(default = "default_storage_limit_gb")]
    pub default_storage_limit_gb: u32,
}

const fn default_max_sites_per_user() -> u32 {
    50
}

const fn default_backup_retention_days() -> u32 {
    30
}

const fn default_storage_limit_gb() -> u32 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provisioners: ProvisionerType::default(),
            max_sites_per_user: default_max_sites_per_user(),
            backup_retention_days: default_backup_retention_days(),
            default_storage_limit_gb: default_storage_limit_gb(),
        }
    }
}

/// Which provisioner implementations to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerType {
    /// Docker, MySQL, DNS and self-signed certificates.
    #[default]
    Live,

    /// In-process mocks for testing.
    Mock,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HostplaneConfig::default();
        match &config.server.listen {
            Listen::Tcp { addr } => assert_eq!(addr.port(), 8085),
            Listen::Unix { .. } => panic!("expected TCP listener"),
        }
        assert_eq!(config.docker.network, "hostplane-sites");
        assert_eq!(config.docker.stop_grace(), Duration::from_secs(10));
        assert_eq!(config.docker.log_tail, 100);
        assert_eq!(config.ssl.renewal_threshold_days, 30);
        assert_eq!(config.dns.verification_prefix, "_hostplane-verification");
        assert_eq!(config.orchestrator.max_sites_per_user, 50);
        assert_eq!(config.orchestrator.provisioners, ProvisionerType::Live);
    }

    #[test]
    fn config_from_toml() {
        let toml = r#"
            [server.listen]
            type = "unix"
            path = "/run/hostplane.sock"

            [mysql]
            admin_url = "mysql://admin:secret@db:3306"
            site_port = 3307

            [ssl]
            proxy_config_dir = "/etc/nginx/sites-enabled"
            reload_command = []

            [orchestrator]
            provisioners = "mock"
            max_sites_per_user = 5
        "#;

        let config: HostplaneConfig = toml::from_str(toml).unwrap();
        assert_eq!(
            config.server.listen,
            Listen::Unix {
                path: PathBuf::from("/run/hostplane.sock")
            }
        );
        assert_eq!(config.mysql.admin_url, "mysql://admin:secret@db:3306");
        assert_eq!(config.mysql.site_port, 3307);
        assert_eq!(config.mysql.site_host, "mysql");
        assert!(config.ssl.reload_command.is_empty());
        assert_eq!(
            config.ssl.proxy_config_dir,
            Some(PathBuf::from("/etc/nginx/sites-enabled"))
        );
        assert_eq!(config.orchestrator.provisioners, ProvisionerType::Mock);
        assert_eq!(config.orchestrator.max_sites_per_user, 5);
        assert_eq!(config.orchestrator.backup_retention_days, 30);
    }
}
