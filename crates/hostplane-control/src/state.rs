//! Typestate pattern for the deployment ledger.
//!
//! A deployment moves `pending -> running -> completed | failed`. Encoding
//! the states as types means a ledger entry can only be completed after it
//! was started, and a finished entry has no transition methods at all.
//!
//! # Example
//!
//! ```ignore
//! let pending = Deployment::<Pending>::create(data);
//! let running = pending.start();
//! let completed = running.complete("site is live");
//! // completed.start() would not compile - invalid transition
//! ```

use std::marker::PhantomData;

use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn persisted() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

/// Recorded, not yet started.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Workflow in progress.
#[derive(Debug, Clone, Copy)]
pub struct Running;

/// Workflow finished successfully.
#[derive(Debug, Clone, Copy)]
pub struct Completed;

/// Workflow aborted or finished with errors.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Pending {}
impl private::Sealed for Running {}
impl private::Sealed for Completed {}
impl private::Sealed for Failed {}

impl DeploymentState for Pending {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Pending
    }
}

impl DeploymentState for Running {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Running
    }
}

impl DeploymentState for Completed {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Completed
    }
}

impl DeploymentState for Failed {
    fn persisted() -> DeploymentStatus {
        DeploymentStatus::Failed
    }
}

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current status as a persisted value.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::persisted()
    }

    /// Snapshot as a storable record.
    #[must_use]
    pub fn to_record(&self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data.clone(),
            status: S::persisted(),
        }
    }

    /// Convert into the underlying data.
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    fn transition_with<T: DeploymentState>(
        mut self,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.data.updated_at = Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Pending> {
    /// Create a new deployment in the pending state.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Transition to running. Writes `started_at`.
    #[must_use]
    pub fn start(self, message: impl Into<String>) -> Deployment<Running> {
        let message = message.into();
        self.transition_with(|data| {
            data.started_at = Some(Utc::now());
            data.message = Some(message);
        })
    }
}

impl Deployment<Running> {
    /// Record a progress message without changing state.
    pub fn progress(&mut self, message: impl Into<String>) {
        self.data.message = Some(message.into());
        self.data.updated_at = Utc::now();
    }

    /// Transition to completed. Writes `completed_at`.
    #[must_use]
    pub fn complete(self, message: impl Into<String>) -> Deployment<Completed> {
        let message = message.into();
        self.transition_with(|data| {
            data.completed_at = Some(Utc::now());
            data.message = Some(message);
        })
    }

    /// Transition to failed. Writes `completed_at`.
    #[must_use]
    pub fn fail(self, message: impl Into<String>) -> Deployment<Failed> {
        let message = message.into();
        self.transition_with(|data| {
            data.completed_at = Some(Utc::now());
            data.message = Some(message);
        })
    }
}

// =============================================================================
// Loading from persisted state
// =============================================================================

/// A deployment loaded from the store, in whichever state it was persisted.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in pending state.
    Pending(Deployment<Pending>),
    /// Deployment in running state.
    Running(Deployment<Running>),
    /// Deployment in completed state.
    Completed(Deployment<Completed>),
    /// Deployment in failed state.
    Failed(Deployment<Failed>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from a stored record.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        let data = record.data;
        match record.status {
            DeploymentStatus::Pending => Self::Pending(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Running => Self::Running(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Completed => Self::Completed(Deployment {
                data,
                _state: PhantomData,
            }),
            DeploymentStatus::Failed => Self::Failed(Deployment {
                data,
                _state: PhantomData,
            }),
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Pending(d) => d.data(),
            Self::Running(d) => d.data(),
            Self::Completed(d) => d.data(),
            Self::Failed(d) => d.data(),
        }
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Pending(_) => DeploymentStatus::Pending,
            Self::Running(_) => DeploymentStatus::Running,
            Self::Completed(_) => DeploymentStatus::Completed,
            Self::Failed(_) => DeploymentStatus::Failed,
        }
    }

    /// Try to extract a running deployment.
    pub fn try_into_running(self) -> ControlResult<Deployment<Running>> {
        match self {
            Self::Running(d) => Ok(d),
            other => Err(ControlError::InvalidStateTransition {
                from: other.status().as_str(),
                to: "running",
            }),
        }
    }

    /// Check if the deployment can no longer transition.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, DeploymentType, SiteId};

    fn test_data() -> DeploymentData {
        DeploymentData::new(
            SiteId::new("site-1"),
            DeploymentType::Create,
            &Actor::user("alice"),
        )
    }

    #[test]
    fn happy_path_sets_timestamps_once() {
        let pending = Deployment::<Pending>::create(test_data());
        assert_eq!(pending.status(), DeploymentStatus::Pending);
        assert!(pending.data().started_at.is_none());

        let mut running = pending.start("starting");
        assert_eq!(running.status(), DeploymentStatus::Running);
        let started = running.data().started_at;
        assert!(started.is_some());

        running.progress("container started");
        assert_eq!(running.data().message.as_deref(), Some("container started"));
        assert_eq!(running.data().started_at, started);

        let completed = running.complete("done");
        assert_eq!(completed.status(), DeploymentStatus::Completed);
        assert_eq!(completed.data().started_at, started);
        assert!(completed.data().completed_at.is_some());
        assert_eq!(completed.data().initiated_by, "alice");
    }

    #[test]
    fn fail_from_running() {
        let failed = Deployment::<Pending>::create(test_data())
            .start("starting")
            .fail("container runtime unavailable");
        assert_eq!(failed.status(), DeploymentStatus::Failed);
        assert_eq!(
            failed.data().message.as_deref(),
            Some("container runtime unavailable")
        );
        assert!(failed.data().completed_at.is_some());
    }

    #[test]
    fn any_deployment_roundtrip() {
        let running = Deployment::<Pending>::create(test_data()).start("go");
        let id = running.id().clone();

        let any = AnyDeployment::from_record(running.to_record());
        assert_eq!(any.status(), DeploymentStatus::Running);
        assert!(!any.is_terminal());
        assert_eq!(any.data().id, id);

        let running = any.try_into_running().unwrap();
        assert_eq!(running.id(), &id);
    }

    #[test]
    fn any_deployment_wrong_state() {
        let completed = Deployment::<Pending>::create(test_data())
            .start("go")
            .complete("done");
        let any = AnyDeployment::from_record(completed.to_record());
        assert!(any.is_terminal());
        assert!(matches!(
            any.try_into_running(),
            Err(ControlError::InvalidStateTransition {
                from: "completed",
                to: "running"
            })
        ));
    }
}
