//! Hostplane control plane.
//!
//! This crate orchestrates the lifecycle of hosted sites: provisioning the
//! directory tree, tenant database, container, domain and certificate for a
//! new site, tearing them down again, cloning, backing up and restarting.
//!
//! # Architecture
//!
//! - **Provisioners** own one subsystem each (databases, containers, domains
//!   and certificates, files) behind traits with live and mock
//!   implementations.
//! - **Orchestrator** sequences provisioners into workflows. Every step
//!   persists its own result; a failed create leaves the site in `error`
//!   rather than rolling back.
//! - **Dispatcher** runs long workflows in the background and admits at most
//!   one workflow per site.
//! - **Ledger** records each workflow run as a deployment.
//!
//! # Deployment ledger
//!
//! Deployment status follows a strict state machine enforced at compile time
//! using the typestate pattern:
//!
//! ```text
//! Pending ──▶ Running ──▶ Completed
//!                │
//!                ▼
//!              Failed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use hostplane_control::{Deployment, Pending};
//! use hostplane_control::types::{Actor, DeploymentData, DeploymentType, SiteId};
//!
//! let data = DeploymentData::new(SiteId::generate(), DeploymentType::Create, &Actor::system());
//! let running = Deployment::<Pending>::create(data).start("Starting site creation process");
//! let completed = running.complete("Site created successfully");
//!
//! // This would not compile:
//! // completed.fail("too late");
//! ```

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod process;
pub mod provisioner;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::HostplaneConfig;
pub use dispatcher::{SiteLease, WorkflowDispatcher, WorkflowHandle};
pub use error::{ControlError, ControlResult};
pub use ledger::DeploymentLedger;
pub use orchestrator::{ClonedSite, SiteDetails, SiteOrchestrator, SiteWorkflow};
pub use provisioner::{create_provisioners, Provisioners};
pub use service::HostplaneService;
pub use state::{AnyDeployment, Completed, Deployment, DeploymentState, Failed, Pending, Running};
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore, SiteFilter, SiteStore};
pub use types::{
    Actor, DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentType, Site, SiteId,
    SiteStatus,
};
