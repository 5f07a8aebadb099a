//! Request fixtures for control plane integration tests.

use hostplane_control::types::{
    Actor, CloneSiteRequest, CreateBackupRequest, DomainType, NewSiteRequest, UserId,
};

pub const OWNER: &str = "user-1";

/// The user owning test sites.
pub fn owner() -> UserId {
    UserId::new(OWNER)
}

/// The owner acting on their sites.
pub fn actor() -> Actor {
    Actor::user(OWNER)
}

/// Request for a subdomain site on `platform` with the default template.
pub fn new_site(domain: &str, platform: &str) -> NewSiteRequest {
    NewSiteRequest {
        name: format!("{platform} site"),
        description: None,
        domain: domain.to_owned(),
        domain_type: DomainType::Subdomain,
        platform: platform.to_owned(),
        template: "default".to_owned(),
        storage_limit_gb: None,
    }
}

/// Clone request copying files and databases as asked.
pub fn clone_request(domain: &str, clone_database: bool, clone_files: bool) -> CloneSiteRequest {
    CloneSiteRequest {
        name: "staging copy".to_owned(),
        domain: domain.to_owned(),
        description: Some("staging".to_owned()),
        clone_database,
        clone_files,
    }
}

/// Full backup request.
pub fn full_backup() -> CreateBackupRequest {
    CreateBackupRequest {
        description: Some("before upgrade".to_owned()),
        ..CreateBackupRequest::default()
    }
}
