//! Background workflow dispatch with per-site single flight.
//!
//! At most one workflow runs per site. A caller first takes a [`SiteLease`]
//! with [`WorkflowDispatcher::try_acquire`]; the lease is released when it is
//! dropped, which for background work happens when the spawned task ends.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentType, SiteId};

/// Exclusive claim on a site for one workflow.
#[derive(Debug)]
pub struct SiteLease {
    site_id: SiteId,
    workflow: DeploymentType,
    in_flight: Arc<DashMap<SiteId, DeploymentType>>,
}

impl SiteLease {
    /// The leased site.
    #[must_use]
    pub const fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    /// The workflow holding the lease.
    #[must_use]
    pub const fn workflow(&self) -> DeploymentType {
        self.workflow
    }
}

impl Drop for SiteLease {
    fn drop(&mut self) {
        self.in_flight.remove(&self.site_id);
        debug!(site_id = %self.site_id, workflow = %self.workflow, "site lease released");
    }
}

/// Handle to a workflow running in the background.
#[derive(Debug)]
pub struct WorkflowHandle<T> {
    site_id: SiteId,
    workflow: DeploymentType,
    join: JoinHandle<T>,
}

impl<T> WorkflowHandle<T> {
    /// Site the workflow acts on.
    #[must_use]
    pub const fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    /// Kind of workflow.
    #[must_use]
    pub const fn workflow(&self) -> DeploymentType {
        self.workflow
    }

    /// Whether the workflow has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the workflow to finish.
    pub async fn wait(self) -> ControlResult<T> {
        self.join.await.map_err(|e| {
            ControlError::internal(format!(
                "{} workflow for site {} aborted: {e}",
                self.workflow, self.site_id
            ))
        })
    }
}

/// Runs site workflows in the background, one per site at a time.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDispatcher {
    in_flight: Arc<DashMap<SiteId, DeploymentType>>,
    tracker: TaskTracker,
}

impl WorkflowDispatcher {
    /// Create a new dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a site for a workflow.
    ///
    /// Fails with [`ControlError::SiteBusy`] if another workflow holds it.
    pub fn try_acquire(&self, site_id: &SiteId, workflow: DeploymentType) -> ControlResult<SiteLease> {
        match self.in_flight.entry(site_id.clone()) {
            Entry::Occupied(entry) => Err(ControlError::SiteBusy {
                site_id: site_id.to_string(),
                workflow: entry.get().as_str(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(workflow);
                debug!(site_id = %site_id, workflow = %workflow, "site lease acquired");
                Ok(SiteLease {
                    site_id: site_id.clone(),
                    workflow,
                    in_flight: Arc::clone(&self.in_flight),
                })
            }
        }
    }

    /// Whether a workflow currently holds the site.
    #[must_use]
    pub fn is_busy(&self, site_id: &SiteId) -> bool {
        self.in_flight.contains_key(site_id)
    }

    /// Workflow currently holding the site, if any.
    #[must_use]
    pub fn current(&self, site_id: &SiteId) -> Option<DeploymentType> {
        self.in_flight.get(site_id).map(|entry| *entry.value())
    }

    /// Run `workflow` in the background while holding `lease`.
    pub fn submit<F>(&self, lease: SiteLease, workflow: F) -> WorkflowHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let site_id = lease.site_id.clone();
        let kind = lease.workflow;

        info!(site_id = %site_id, workflow = %kind, "dispatching workflow");

        let join = self.tracker.spawn(async move {
            let _lease = lease;
            workflow.await
        });

        WorkflowHandle {
            site_id,
            workflow: kind,
            join,
        }
    }

    /// Number of workflows currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop accepting new work and wait for running workflows to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(running = self.tracker.len(), "waiting for workflows to finish");
        }
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn second_workflow_for_same_site_is_rejected() {
        let dispatcher = WorkflowDispatcher::new();
        let site = SiteId::new("site-1");

        let lease = dispatcher
            .try_acquire(&site, DeploymentType::Create)
            .unwrap();
        let err = dispatcher
            .try_acquire(&site, DeploymentType::Delete)
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::SiteBusy {
                workflow: "create",
                ..
            }
        ));

        drop(lease);
        assert!(dispatcher
            .try_acquire(&site, DeploymentType::Delete)
            .is_ok());
    }

    #[tokio::test]
    async fn different_sites_run_concurrently() {
        let dispatcher = WorkflowDispatcher::new();
        let _a = dispatcher
            .try_acquire(&SiteId::new("a"), DeploymentType::Create)
            .unwrap();
        let _b = dispatcher
            .try_acquire(&SiteId::new("b"), DeploymentType::Create)
            .unwrap();
        assert_eq!(dispatcher.in_flight(), 2);
    }

    #[tokio::test]
    async fn lease_is_held_until_workflow_ends() {
        let dispatcher = WorkflowDispatcher::new();
        let site = SiteId::new("site-1");
        let (tx, rx) = oneshot::channel::<()>();

        let lease = dispatcher
            .try_acquire(&site, DeploymentType::Delete)
            .unwrap();
        let handle = dispatcher.submit(lease, async move {
            let _ = rx.await;
            42
        });

        assert!(dispatcher.is_busy(&site));
        assert_eq!(dispatcher.current(&site), Some(DeploymentType::Delete));

        tx.send(()).unwrap();
        assert_eq!(handle.wait().await.unwrap(), 42);
        assert!(!dispatcher.is_busy(&site));
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_workflows() {
        let dispatcher = WorkflowDispatcher::new();
        let site = SiteId::new("site-1");
        let lease = dispatcher
            .try_acquire(&site, DeploymentType::Create)
            .unwrap();
        let handle = dispatcher.submit(lease, async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        });

        dispatcher.shutdown().await;
        assert!(handle.is_finished());
    }
}
