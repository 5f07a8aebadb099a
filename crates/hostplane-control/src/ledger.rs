//! Deployment ledger.
//!
//! Every workflow run opens a fresh ledger entry and drives it through
//! `pending -> running -> completed | failed`. The typestate in
//! [`crate::state`] guarantees the order at compile time; the store's
//! compare-and-set update guarantees it for the persisted row.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ControlResult;
use crate::state::{Deployment, Pending, Running};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{
    Actor, DeploymentData, DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentType,
    SiteId,
};

/// Append-only record of orchestration attempts.
#[derive(Clone)]
pub struct DeploymentLedger {
    store: Arc<dyn DeploymentStore>,
}

impl DeploymentLedger {
    /// Create a ledger over a deployment store.
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Record a new deployment and move it straight to running.
    pub async fn open(
        &self,
        site_id: &SiteId,
        deployment_type: DeploymentType,
        actor: &Actor,
        message: impl Into<String>,
    ) -> ControlResult<Deployment<Running>> {
        let pending = Deployment::<Pending>::create(DeploymentData::new(
            site_id.clone(),
            deployment_type,
            actor,
        ));
        self.store.insert(&pending.to_record()).await?;

        let running = pending.start(message);
        self.store
            .update(&running.to_record(), DeploymentStatus::Pending)
            .await?;

        debug!(
            deployment_id = %running.id(),
            site_id = %site_id,
            deployment_type = %deployment_type,
            actor = %actor,
            "deployment started"
        );
        Ok(running)
    }

    /// Record a progress message on a running deployment.
    ///
    /// Progress is informational; a failed write is logged and ignored.
    pub async fn progress(&self, deployment: &mut Deployment<Running>, message: impl Into<String>) {
        deployment.progress(message);
        if let Err(e) = self
            .store
            .update(&deployment.to_record(), DeploymentStatus::Running)
            .await
        {
            warn!(deployment_id = %deployment.id(), error = %e, "failed to record progress");
        }
    }

    /// Mark a running deployment completed.
    pub async fn complete(
        &self,
        deployment: Deployment<Running>,
        message: impl Into<String>,
    ) -> ControlResult<DeploymentRecord> {
        let record = deployment.complete(message).to_record();
        self.store.update(&record, DeploymentStatus::Running).await?;
        debug!(deployment_id = %record.data.id, "deployment completed");
        Ok(record)
    }

    /// Mark a running deployment failed.
    pub async fn fail(
        &self,
        deployment: Deployment<Running>,
        message: impl Into<String>,
    ) -> ControlResult<DeploymentRecord> {
        let record = deployment.fail(message).to_record();
        self.store.update(&record, DeploymentStatus::Running).await?;
        debug!(
            deployment_id = %record.data.id,
            message = record.data.message.as_deref().unwrap_or_default(),
            "deployment failed"
        );
        Ok(record)
    }

    /// Get a deployment by ID.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.store.get(id).await
    }

    /// List deployments matching a filter, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    /// Deployments recorded against a site, newest first.
    pub async fn list_for_site(&self, site_id: &SiteId) -> ControlResult<Vec<DeploymentRecord>> {
        self.store
            .list(&DeploymentFilter::new().with_site(site_id.clone()))
            .await
    }

    /// Number of deployments per status.
    pub async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>> {
        self.store.count_by_status().await
    }
}

impl std::fmt::Debug for DeploymentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentLedger").finish_non_exhaustive()
    }
}
