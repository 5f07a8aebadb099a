//! Core types for hostplane-control.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, generated) => {
        string_id!($(#[$meta])* $name);

        impl $name {
            /// Generate a new unique ID using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }
        }
    };
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an ID from an existing value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a site.
    SiteId,
    generated
);
string_id!(
    /// Unique identifier for a domain.
    DomainId,
    generated
);
string_id!(
    /// Unique identifier for a tenant database.
    DatabaseId,
    generated
);
string_id!(
    /// Unique identifier for a backup.
    BackupId,
    generated
);
string_id!(
    /// Unique identifier for a deployment ledger entry.
    DeploymentId,
    generated
);
string_id!(
    /// Identifier of a panel user.
    UserId
);

/// Declares a string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $what:literal { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Get the name as a static string.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("unknown ", $what, ": {}"), s)),
                }
            }
        }
    };
}

string_enum!(
    /// Lifecycle status of a site.
    SiteStatus, "site status" {
        /// Provisioning in progress.
        Creating => "creating",
        /// Serving traffic.
        Active => "active",
        /// Stopped by an operator.
        Suspended => "suspended",
        /// Provisioning failed; needs intervention or retry.
        Error => "error",
        /// Teardown in progress.
        Deleting => "deleting",
        /// Torn down; record retained for audit.
        Deleted => "deleted",
    }
);

impl SiteStatus {
    /// Whether the site may move from `self` to `next`.
    ///
    /// `error -> creating` is the retry edge for a failed create.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Active | Self::Error)
                | (Self::Error, Self::Creating)
                | (Self::Active, Self::Suspended)
                | (Self::Suspended, Self::Active)
                | (
                    Self::Active | Self::Error | Self::Suspended,
                    Self::Deleting
                )
                | (Self::Deleting, Self::Deleted)
        )
    }
}

string_enum!(
    /// How a domain is verified.
    DomainType, "domain type" {
        /// Subdomain of a panel-controlled zone; verified automatically.
        Subdomain => "subdomain",
        /// Customer-owned domain; verified through a DNS TXT record.
        Custom => "custom",
    }
);

string_enum!(
    /// Tenant database engine.
    DatabaseEngine, "database engine" {
        /// MySQL or MariaDB.
        MySql => "mysql",
    }
);

string_enum!(
    /// Kind of workflow a deployment records.
    DeploymentType, "deployment type" {
        /// Full site provisioning.
        Create => "create",
        /// Best-effort teardown.
        Delete => "delete",
        /// Archive of files and databases.
        Backup => "backup",
        /// Copy of a site into a new one.
        Clone => "clone",
        /// Container restart.
        Restart => "restart",
        /// Container stop for a suspended site.
        Suspend => "suspend",
        /// Container start for a resumed site.
        Resume => "resume",
    }
);

string_enum!(
    /// Persisted status of a deployment.
    DeploymentStatus, "deployment status" {
        /// Recorded, not yet started.
        Pending => "pending",
        /// Workflow in progress.
        Running => "running",
        /// Workflow finished successfully.
        Completed => "completed",
        /// Workflow aborted or finished with errors.
        Failed => "failed",
    }
);

impl DeploymentStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the ledger may move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running) | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

string_enum!(
    /// Origin of a backup.
    BackupType, "backup type" {
        /// Requested by a user.
        Manual => "manual",
        /// Taken by a schedule.
        Automatic => "automatic",
    }
);

/// Principal on whose behalf a workflow runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A panel user.
    User(UserId),
    /// The control plane itself (background work).
    System,
}

impl Actor {
    /// The system principal used by background tasks.
    #[must_use]
    pub const fn system() -> Self {
        Self::System
    }

    /// A user principal.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(UserId::new(id))
    }

    /// Identifier recorded in the ledger.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::User(id) => id.as_str(),
            Self::System => "system",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A hosted site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    /// Unique site identifier.
    pub id: SiteId,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Primary domain name.
    pub domain: String,
    /// Owning user.
    pub user_id: UserId,
    /// Platform (wordpress, hugo, ...).
    pub platform: String,
    /// Template name within the platform.
    pub template: String,
    /// Current lifecycle status.
    pub status: SiteStatus,
    /// Storage quota in GB.
    pub storage_limit_gb: u32,
    /// Storage used in MB.
    pub storage_used_mb: u64,
    /// Site directory on the host, once allocated.
    #[serde(default)]
    pub directory: Option<String>,
    /// Container id, once provisioned.
    #[serde(default)]
    pub container_id: Option<String>,
    /// Container name, once provisioned.
    #[serde(default)]
    pub container_name: Option<String>,
    /// Host port published for the container.
    #[serde(default)]
    pub container_port: Option<u16>,
    /// When the site was created.
    pub created_at: DateTime<Utc>,
    /// When the site was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the last backup finished.
    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
}

impl Site {
    /// Create a new site in the `creating` state.
    #[must_use]
    pub fn new(
        name: String,
        domain: String,
        user_id: UserId,
        platform: String,
        template: String,
        storage_limit_gb: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SiteId::generate(),
            name,
            description: None,
            domain,
            user_id,
            platform,
            template,
            status: SiteStatus::Creating,
            storage_limit_gb,
            storage_used_mb: 0,
            directory: None,
            container_id: None,
            container_name: None,
            container_port: None,
            created_at: now,
            updated_at: now,
            last_backup_at: None,
        }
    }

    /// Container id, if the site has been provisioned.
    #[must_use]
    pub fn container(&self) -> Option<&str> {
        self.container_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A domain attached to a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    /// Unique domain identifier.
    pub id: DomainId,
    /// Owning site.
    pub site_id: SiteId,
    /// Fully qualified domain name, globally unique.
    pub domain_name: String,
    /// Verification mode.
    pub domain_type: DomainType,
    /// Whether this is the site's primary domain.
    pub is_primary: bool,
    /// Whether a certificate is installed.
    pub ssl_enabled: bool,
    /// Certificate expiry, if installed.
    #[serde(default)]
    pub ssl_expires_at: Option<DateTime<Utc>>,
    /// Whether DNS ownership has been verified.
    pub dns_verified: bool,
    /// Token expected in the verification TXT record.
    #[serde(default)]
    pub verification_token: Option<String>,
    /// When the domain was created.
    pub created_at: DateTime<Utc>,
    /// When the domain was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    /// Create an unverified domain without a certificate.
    #[must_use]
    pub fn new(
        site_id: SiteId,
        domain_name: String,
        domain_type: DomainType,
        is_primary: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DomainId::generate(),
            site_id,
            domain_name: normalise_domain(&domain_name),
            domain_type,
            is_primary,
            ssl_enabled: false,
            ssl_expires_at: None,
            dns_verified: false,
            verification_token: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lower-case a domain name and strip a trailing dot.
#[must_use]
pub fn normalise_domain(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// A tenant database provisioned for a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteDatabase {
    /// Unique database identifier.
    pub id: DatabaseId,
    /// Owning site.
    pub site_id: SiteId,
    /// Database name on the engine, globally unique.
    pub database_name: String,
    /// Login user.
    pub username: String,
    /// Generated password.
    #[serde(skip_serializing)]
    pub password: String,
    /// Host sites use to reach the engine.
    pub host: String,
    /// Port sites use to reach the engine.
    pub port: u16,
    /// Engine type.
    pub engine: DatabaseEngine,
    /// When the database was created.
    pub created_at: DateTime<Utc>,
}

/// A backup archive of a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteBackup {
    /// Unique backup identifier.
    pub id: BackupId,
    /// Site the backup belongs to.
    pub site_id: SiteId,
    /// Archive file name.
    pub file_name: String,
    /// Absolute archive path.
    pub file_path: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// Manual or automatic.
    pub backup_type: BackupType,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether database dumps are included.
    pub includes_database: bool,
    /// Whether site files are included.
    pub includes_files: bool,
    /// When the backup was taken.
    pub created_at: DateTime<Utc>,
    /// When retention may delete the backup.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Site the workflow acted on.
    pub site_id: SiteId,
    /// Workflow kind.
    pub deployment_type: DeploymentType,
    /// Latest progress or outcome message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Principal that initiated the workflow.
    pub initiated_by: String,
    /// When the deployment was recorded.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
    /// Set once, on the transition to running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, on the terminal transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeploymentData {
    /// Create new deployment data.
    #[must_use]
    pub fn new(site_id: SiteId, deployment_type: DeploymentType, actor: &Actor) -> Self {
        let now = Utc::now();
        Self {
            id: DeploymentId::generate(),
            site_id,
            deployment_type,
            message: None,
            initiated_by: actor.as_str().to_owned(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A deployment record as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
}

impl DeploymentRecord {
    /// Create a new deployment record in the pending state.
    #[must_use]
    pub const fn new(data: DeploymentData) -> Self {
        Self {
            data,
            status: DeploymentStatus::Pending,
        }
    }
}

/// Request to register a new site.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSiteRequest {
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Primary domain name.
    pub domain: String,
    /// How the primary domain is verified.
    #[serde(default = "default_domain_type")]
    pub domain_type: DomainType,
    /// Platform (wordpress, hugo, ...).
    pub platform: String,
    /// Template name within the platform.
    #[serde(default = "default_template")]
    pub template: String,
    /// Storage quota in GB; the configured default when absent.
    #[serde(default)]
    pub storage_limit_gb: Option<u32>,
}

const fn default_domain_type() -> DomainType {
    DomainType::Subdomain
}

fn default_template() -> String {
    "default".to_owned()
}

/// Options for a backup.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBackupRequest {
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Include a dump of every site database.
    #[serde(default = "default_true")]
    pub include_database: bool,
    /// Include the site directory.
    #[serde(default = "default_true")]
    pub include_files: bool,
}

impl Default for CreateBackupRequest {
    fn default() -> Self {
        Self {
            description: None,
            include_database: true,
            include_files: true,
        }
    }
}

/// Options for cloning a site.
#[derive(Debug, Clone, Deserialize)]
pub struct CloneSiteRequest {
    /// Name of the new site.
    pub name: String,
    /// Primary domain of the new site.
    pub domain: String,
    /// Description of the new site.
    #[serde(default)]
    pub description: Option<String>,
    /// Clone every source database.
    #[serde(default = "default_true")]
    pub clone_database: bool,
    /// Copy the source file tree.
    #[serde(default = "default_true")]
    pub clone_files: bool,
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_status_machine() {
        use SiteStatus::*;

        assert!(Creating.can_transition_to(Active));
        assert!(Creating.can_transition_to(Error));
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(Error.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));

        assert!(!Creating.can_transition_to(Deleting));
        assert!(!Active.can_transition_to(Creating));
        for next in SiteStatus::ALL {
            assert!(!Deleted.can_transition_to(*next));
        }
    }

    #[test]
    fn deployment_status_is_monotonic() {
        use DeploymentStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in DeploymentStatus::ALL {
                assert!(!terminal.can_transition_to(*next));
            }
        }
    }

    #[test]
    fn enum_string_roundtrip() {
        for status in SiteStatus::ALL {
            assert_eq!(status.as_str().parse::<SiteStatus>().unwrap(), *status);
        }
        assert!("bogus".parse::<DeploymentType>().is_err());
    }

    #[test]
    fn actor_names() {
        assert_eq!(Actor::system().as_str(), "system");
        assert_eq!(Actor::user("u-1").as_str(), "u-1");
    }

    #[test]
    fn domains_are_normalised() {
        let domain = Domain::new(
            SiteId::new("s"),
            " Blog.Example.COM. ".to_owned(),
            DomainType::Custom,
            true,
        );
        assert_eq!(domain.domain_name, "blog.example.com");
    }

    #[test]
    fn clone_request_defaults() {
        let request: CloneSiteRequest =
            serde_json::from_str(r#"{"name":"copy","domain":"copy.example.com"}"#).unwrap();
        assert!(request.clone_database);
        assert!(request.clone_files);
    }
}
