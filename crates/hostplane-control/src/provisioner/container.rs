//! Site container management.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hostplane_container::{
    allocate_free_port, image_for_platform, ContainerConfig, ContainerStats, DockerClient,
    ExecOutput, SITE_MOUNT_PATH,
};
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::Site;

/// Bytes per GB of storage quota, used as the container memory limit.
const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

/// Label marking containers owned by hostplane.
const SITE_LABEL: &str = "io.hostplane.site";

/// A created site container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteContainer {
    /// Runtime container ID.
    pub id: String,
    /// Container name (`site-{id}`).
    pub name: String,
    /// Host port published for the container's HTTP port.
    pub host_port: u16,
}

/// Container name for a site.
#[must_use]
pub fn container_name(site: &Site) -> String {
    format!("site-{}", site.id)
}

/// Operations on the isolated runtime instance backing a site.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Create (but do not start) the container for a site, bound to its
    /// directory and a free host port.
    async fn create_site_container(&self, site: &Site, site_dir: &Path)
        -> ControlResult<SiteContainer>;

    /// Start a container.
    async fn start(&self, container_id: &str) -> ControlResult<()>;

    /// Stop a container within the configured grace period.
    async fn stop(&self, container_id: &str) -> ControlResult<()>;

    /// Restart a container.
    async fn restart(&self, container_id: &str) -> ControlResult<()>;

    /// Stop, then force-remove a container with its volumes.
    async fn remove(&self, container_id: &str) -> ControlResult<()>;

    /// Last `tail` log lines with timestamps.
    async fn logs(&self, container_id: &str, tail: u32) -> ControlResult<String>;

    /// Run a shell command inside a container.
    async fn exec(&self, container_id: &str, command: &str) -> ControlResult<ExecOutput>;

    /// Resource usage snapshot.
    async fn stats(&self, container_id: &str) -> ControlResult<ContainerStats>;

    /// Change memory and CPU limits.
    async fn update_resources(
        &self,
        container_id: &str,
        memory_bytes: i64,
        cpus: f64,
    ) -> ControlResult<()>;

    /// Names of all site containers.
    async fn list_site_containers(&self) -> ControlResult<Vec<String>>;
}

/// Container manager backed by the Docker Engine API.
#[derive(Debug)]
pub struct DockerContainerManager {
    client: DockerClient,
    network: String,
    stop_grace: Duration,
}

impl DockerContainerManager {
    /// Create a manager from configuration.
    #[must_use]
    pub fn new(config: &DockerConfig) -> Self {
        Self {
            client: DockerClient::new(&config.socket),
            network: config.network.clone(),
            stop_grace: config.stop_grace(),
        }
    }

    fn site_config(&self, site: &Site, site_dir: &Path, host_port: u16) -> ContainerConfig {
        let memory_bytes = i64::from(site.storage_limit_gb).saturating_mul(BYTES_PER_GB);
        ContainerConfig::new(
            container_name(site),
            image_for_platform(&site.platform),
            site_dir.to_path_buf(),
        )
        .with_env("SITE_ID", site.id.as_str())
        .with_env("DOMAIN", &site.domain)
        .with_env("PLATFORM", &site.platform)
        .with_env("SITE_PATH", SITE_MOUNT_PATH)
        .with_host_port(host_port)
        .with_network(&self.network)
        .with_memory_bytes(memory_bytes)
        .with_label(SITE_LABEL, site.id.as_str())
    }
}

#[async_trait]
impl ContainerManager for DockerContainerManager {
    async fn create_site_container(
        &self,
        site: &Site,
        site_dir: &Path,
    ) -> ControlResult<SiteContainer> {
        self.client.ensure_network(&self.network).await?;

        let config = self.site_config(site, site_dir, 0);
        self.client.ensure_image(&config.image).await?;

        // The port can be taken between probing and binding; creation then
        // fails and the workflow records it.
        let host_port = allocate_free_port()?;
        let config = config.with_host_port(host_port);

        let id = self.client.create_container(&config).await?;
        info!(
            site_id = %site.id,
            container = %config.name,
            image = %config.image,
            host_port,
            "created site container"
        );

        Ok(SiteContainer {
            id,
            name: config.name,
            host_port,
        })
    }

    async fn start(&self, container_id: &str) -> ControlResult<()> {
        self.client.start_container(container_id).await?;
        debug!(container_id, "container started");
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> ControlResult<()> {
        self.client
            .stop_container(container_id, self.stop_grace)
            .await?;
        debug!(container_id, "container stopped");
        Ok(())
    }

    async fn restart(&self, container_id: &str) -> ControlResult<()> {
        self.client
            .restart_container(container_id, self.stop_grace)
            .await?;
        info!(container_id, "container restarted");
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> ControlResult<()> {
        if let Err(e) = self
            .client
            .stop_container(container_id, self.stop_grace)
            .await
        {
            if e.is_not_found() {
                return Err(e.into());
            }
            warn!(container_id, error = %e, "stop before removal failed, forcing");
        }
        self.client.remove_container(container_id).await?;
        info!(container_id, "container removed");
        Ok(())
    }

    async fn logs(&self, container_id: &str, tail: u32) -> ControlResult<String> {
        let tail = usize::try_from(tail).unwrap_or(usize::MAX);
        Ok(self.client.container_logs(container_id, tail).await?)
    }

    async fn exec(&self, container_id: &str, command: &str) -> ControlResult<ExecOutput> {
        Ok(self.client.exec(container_id, command).await?)
    }

    async fn stats(&self, container_id: &str) -> ControlResult<ContainerStats> {
        Ok(self.client.container_stats(container_id).await?)
    }

    async fn update_resources(
        &self,
        container_id: &str,
        memory_bytes: i64,
        cpus: f64,
    ) -> ControlResult<()> {
        if memory_bytes <= 0 || cpus.is_nan() || cpus <= 0.0 {
            return Err(ControlError::validation(
                "memory and cpu limits must be positive",
            ));
        }
        self.client
            .update_resources(container_id, memory_bytes, cpus)
            .await?;
        info!(container_id, memory_bytes, cpus, "container resources updated");
        Ok(())
    }

    async fn list_site_containers(&self) -> ControlResult<Vec<String>> {
        let containers = self.client.list_containers("site-").await?;
        Ok(containers
            .into_iter()
            .flat_map(|c| c.names)
            .map(|name| name.trim_start_matches('/').to_owned())
            .filter(|name| name.starts_with("site-"))
            .collect())
    }
}
