//! Container configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Port the site's web server listens on inside the container.
pub const CONTAINER_HTTP_PORT: &str = "80/tcp";

/// Mount point of the site directory inside the container.
pub const SITE_MOUNT_PATH: &str = "/var/www/html";

/// Configuration for a site container.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container name, unique on the engine.
    pub name: String,

    /// Image reference to run.
    pub image: String,

    /// Environment variables as `KEY=value` pairs.
    pub env: Vec<(String, String)>,

    /// Host directory bind-mounted at [`SITE_MOUNT_PATH`].
    pub site_dir: PathBuf,

    /// Host port published for [`CONTAINER_HTTP_PORT`].
    pub host_port: u16,

    /// Network the container joins.
    pub network: String,

    /// Memory limit in bytes, zero for unlimited.
    pub memory_bytes: i64,

    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>, site_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            site_dir,
            host_port: 0,
            network: "bridge".to_owned(),
            memory_bytes: 0,
            labels: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = port;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_memory_bytes(mut self, bytes: i64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Build the engine request body for `POST /containers/create`.
    pub fn to_create_request(&self) -> api::CreateContainer {
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(CONTAINER_HTTP_PORT.to_owned(), api::Empty {});

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            CONTAINER_HTTP_PORT.to_owned(),
            vec![api::PortBinding {
                host_ip: String::new(),
                host_port: self.host_port.to_string(),
            }],
        );

        api::CreateContainer {
            image: self.image.clone(),
            env: self
                .env
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect(),
            exposed_ports,
            labels: self.labels.clone(),
            host_config: api::HostConfig {
                binds: vec![format!("{}:{SITE_MOUNT_PATH}:rw", self.site_dir.display())],
                port_bindings,
                memory: self.memory_bytes,
                network_mode: self.network.clone(),
                restart_policy: api::RestartPolicy {
                    name: "unless-stopped".to_owned(),
                },
            },
        }
    }
}

/// Docker Engine API request and response types.
pub mod api {
    use super::*;

    #[derive(Debug, Default, Serialize, Deserialize)]
    pub struct Empty {}

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CreateContainer {
        pub image: String,
        pub env: Vec<String>,
        pub exposed_ports: HashMap<String, Empty>,
        pub labels: HashMap<String, String>,
        pub host_config: HostConfig,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct HostConfig {
        pub binds: Vec<String>,
        pub port_bindings: HashMap<String, Vec<PortBinding>>,
        pub memory: i64,
        pub network_mode: String,
        pub restart_policy: RestartPolicy,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct PortBinding {
        #[serde(default)]
        pub host_ip: String,
        #[serde(default)]
        pub host_port: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct RestartPolicy {
        pub name: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct IdResponse {
        pub id: String,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CreateNetwork {
        pub name: String,
        pub driver: String,
        pub check_duplicate: bool,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct CreateExec {
        pub attach_stdout: bool,
        pub attach_stderr: bool,
        pub cmd: Vec<String>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct StartExec {
        pub detach: bool,
        pub tty: bool,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ExecInspect {
        #[serde(default)]
        pub exit_code: Option<i64>,
        #[serde(default)]
        pub running: bool,
    }

    /// Body for `POST /containers/{id}/update`.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct UpdateResources {
        pub memory: i64,
        pub memory_swap: i64,
        pub cpu_period: i64,
        pub cpu_quota: i64,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ContainerInspect {
        pub id: String,
        pub name: String,
        pub state: ContainerState,
        #[serde(default)]
        pub network_settings: NetworkSettings,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ContainerState {
        pub status: String,
        pub running: bool,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct NetworkSettings {
        #[serde(default)]
        pub ports: HashMap<String, Option<Vec<PortBinding>>>,
        #[serde(default)]
        pub networks: HashMap<String, serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ContainerSummary {
        pub id: String,
        #[serde(default)]
        pub names: Vec<String>,
        #[serde(default)]
        pub image: String,
        #[serde(default)]
        pub state: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stats {
        pub cpu_stats: CpuStats,
        pub precpu_stats: CpuStats,
        #[serde(default)]
        pub memory_stats: MemoryStats,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct CpuStats {
        #[serde(default)]
        pub cpu_usage: CpuUsage,
        #[serde(default)]
        pub system_cpu_usage: Option<u64>,
        #[serde(default)]
        pub online_cpus: Option<u32>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct CpuUsage {
        #[serde(default)]
        pub total_usage: u64,
        #[serde(default)]
        pub percpu_usage: Option<Vec<u64>>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct MemoryStats {
        #[serde(default)]
        pub usage: Option<u64>,
        #[serde(default)]
        pub limit: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorResponse {
        pub message: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_binds_site_dir_and_port() {
        let config = ContainerConfig::new("site-abc", "nginx:alpine", PathBuf::from("/srv/abc"))
            .with_env("SITE_ID", "abc")
            .with_host_port(49152)
            .with_network("hostplane-sites")
            .with_memory_bytes(1024);

        let body = serde_json::to_value(config.to_create_request()).unwrap();

        assert_eq!(body["Image"], "nginx:alpine");
        assert_eq!(body["Env"][0], "SITE_ID=abc");
        assert_eq!(body["HostConfig"]["Binds"][0], "/srv/abc:/var/www/html:rw");
        assert_eq!(
            body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"],
            "49152"
        );
        assert_eq!(body["HostConfig"]["NetworkMode"], "hostplane-sites");
        assert_eq!(body["HostConfig"]["Memory"], 1024);
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
    }
}
