//! Docker Engine API client over the daemon's Unix socket.

use crate::config::{api, ContainerConfig};
use crate::error::{ContainerError, Result};
use crate::logs::decode_output;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const API_VERSION: &str = "v1.43";
const CPU_PERIOD: i64 = 100_000;

/// Output of a command run inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Published ports as `container_port -> host_port`.
    pub ports: Vec<(String, String)>,
    pub networks: Vec<String>,
    pub status: String,
}

/// Client for the Docker Engine HTTP API.
pub struct DockerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl DockerClient {
    /// Create a client for the daemon listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            client: Client::unix(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and return the raw response body.
    ///
    /// 404 responses become [`ContainerError::NotFound`] tagged with `kind`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        kind: &'static str,
    ) -> Result<Bytes> {
        if !self.socket_path.exists() {
            return Err(ContainerError::SocketNotFound(
                self.socket_path.display().to_string(),
            ));
        }

        let url: hyper::Uri = Uri::new(&self.socket_path, &format!("/{API_VERSION}{path}")).into();

        let request = Request::builder()
            .method(method)
            .uri(url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ContainerError::RequestFailed(format!("Failed to build request: {e}")))?;

        debug!("Sending {} {}", request.method(), path);

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ContainerError::RequestFailed(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .collect()
            .await
            .map_err(|e| ContainerError::RequestFailed(format!("Failed to read response: {e}")))?
            .to_bytes();

        // 304 means the container is already in the requested state.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(bytes);
        }

        let message = serde_json::from_slice::<api::ErrorResponse>(&bytes)
            .map(|e| e.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());

        if status == StatusCode::NOT_FOUND {
            return Err(ContainerError::NotFound {
                kind,
                id: message,
            });
        }

        Err(ContainerError::ApiError {
            status: status.as_u16(),
            message,
        })
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&impl Serialize>,
        kind: &'static str,
    ) -> Result<T> {
        let body = body.map(serde_json::to_vec).transpose()?;
        let bytes = self.request(method, path, body, kind).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ContainerError::InvalidResponse(format!("{path}: {e}")))
    }

    async fn send<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        kind: &'static str,
    ) -> Result<()> {
        let body = body.map(serde_json::to_vec).transpose()?;
        self.request(method, path, body, kind).await?;
        Ok(())
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.request(Method::GET, "/_ping", None, "daemon").await?;
        Ok(())
    }

    /// Create a bridge network unless it already exists.
    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .request(Method::GET, &format!("/networks/{name}"), None, "network")
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        info!(network = %name, "Creating site network");
        let body = api::CreateNetwork {
            name: name.to_owned(),
            driver: "bridge".to_owned(),
            check_duplicate: true,
        };
        self.send(Method::POST, "/networks/create", Some(&body), "network")
            .await
    }

    /// Pull an image unless the engine already has it.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        match self
            .request(Method::GET, &format!("/images/{image}/json"), None, "image")
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let (repo, tag) = crate::images::split_image_reference(image);
        info!(image = %image, "Pulling image");
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            encode_query_value(repo),
            encode_query_value(tag)
        );
        self.request(Method::POST, &path, None, "image").await?;
        Ok(())
    }

    /// Create a container and return its id.
    pub async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let path = format!("/containers/create?name={}", encode_query_value(&config.name));
        let created: api::IdResponse = self
            .request_json(
                Method::POST,
                &path,
                Some(&config.to_create_request()),
                "image",
            )
            .await?;

        info!(container = %config.name, id = %created.id, "Container created");
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.send::<api::Empty>(Method::POST, &format!("/containers/{id}/start"), None, "container")
            .await
    }

    /// Stop a container, killing it once `grace` has elapsed.
    pub async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let path = format!("/containers/{id}/stop?t={}", grace.as_secs());
        self.send::<api::Empty>(Method::POST, &path, None, "container")
            .await
    }

    pub async fn restart_container(&self, id: &str, grace: Duration) -> Result<()> {
        let path = format!("/containers/{id}/restart?t={}", grace.as_secs());
        self.send::<api::Empty>(Method::POST, &path, None, "container")
            .await
    }

    /// Force-remove a container together with its anonymous volumes.
    pub async fn remove_container(&self, id: &str) -> Result<()> {
        let path = format!("/containers/{id}?force=true&v=true");
        self.send::<api::Empty>(Method::DELETE, &path, None, "container")
            .await
    }

    pub async fn inspect_container(&self, id: &str) -> Result<api::ContainerInspect> {
        self.request_json(
            Method::GET,
            &format!("/containers/{id}/json"),
            None::<&api::Empty>,
            "container",
        )
        .await
    }

    /// Fetch the last `tail` log lines with timestamps.
    pub async fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        let path = format!("/containers/{id}/logs?stdout=true&stderr=true&timestamps=true&tail={tail}");
        let body = self.request(Method::GET, &path, None, "container").await?;
        Ok(decode_output(&body))
    }

    /// Run `command` through `/bin/sh -c` inside the container.
    pub async fn exec(&self, id: &str, command: &str) -> Result<ExecOutput> {
        let create = api::CreateExec {
            attach_stdout: true,
            attach_stderr: true,
            cmd: vec!["/bin/sh".to_owned(), "-c".to_owned(), command.to_owned()],
        };
        let exec: api::IdResponse = self
            .request_json(
                Method::POST,
                &format!("/containers/{id}/exec"),
                Some(&create),
                "container",
            )
            .await?;

        let start = api::StartExec {
            detach: false,
            tty: false,
        };
        let body = self
            .request(
                Method::POST,
                &format!("/exec/{}/start", exec.id),
                Some(serde_json::to_vec(&start)?),
                "exec",
            )
            .await?;

        let inspect: api::ExecInspect = self
            .request_json(
                Method::GET,
                &format!("/exec/{}/json", exec.id),
                None::<&api::Empty>,
                "exec",
            )
            .await?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output: decode_output(&body),
        })
    }

    /// Take a single stats sample and combine it with inspect data.
    pub async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let stats: api::Stats = self
            .request_json(
                Method::GET,
                &format!("/containers/{id}/stats?stream=false"),
                None::<&api::Empty>,
                "container",
            )
            .await?;
        let inspect = self.inspect_container(id).await?;

        let mut ports: Vec<(String, String)> = inspect
            .network_settings
            .ports
            .iter()
            .filter_map(|(container_port, bindings)| {
                bindings
                    .as_ref()
                    .and_then(|b| b.first())
                    .map(|b| (container_port.clone(), b.host_port.clone()))
            })
            .collect();
        ports.sort();

        let mut networks: Vec<String> = inspect.network_settings.networks.keys().cloned().collect();
        networks.sort();

        Ok(ContainerStats {
            cpu_percent: cpu_percent(&stats),
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            ports,
            networks,
            status: inspect.state.status,
        })
    }

    /// Apply new memory and CPU limits to a running container.
    pub async fn update_resources(&self, id: &str, memory_bytes: i64, cpus: f64) -> Result<()> {
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        let cpu_quota = (cpus * CPU_PERIOD as f64) as i64;
        let body = api::UpdateResources {
            memory: memory_bytes,
            memory_swap: -1,
            cpu_period: CPU_PERIOD,
            cpu_quota,
        };
        self.send(
            Method::POST,
            &format!("/containers/{id}/update"),
            Some(&body),
            "container",
        )
        .await
    }

    /// List containers (running or not) whose name contains `name_fragment`.
    pub async fn list_containers(&self, name_fragment: &str) -> Result<Vec<api::ContainerSummary>> {
        let filters = serde_json::json!({ "name": [name_fragment] }).to_string();
        let path = format!("/containers/json?all=true&filters={}", encode_query_value(&filters));
        self.request_json(Method::GET, &path, None::<&api::Empty>, "container")
            .await
    }
}

/// CPU usage as a percentage of one core, the way `docker stats` reports it.
fn cpu_percent(stats: &api::Stats) -> f64 {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));

    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let online = stats.cpu_stats.online_cpus.map_or_else(
        || {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map_or(1, Vec::len)
        },
        |n| usize::try_from(n).unwrap_or(1),
    );

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    let percent = (cpu_delta as f64 / system_delta as f64) * online as f64 * 100.0;
    percent
}

/// Percent-encode a query string value.
fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_encoded() {
        assert_eq!(encode_query_value("site-01"), "site-01");
        assert_eq!(
            encode_query_value(r#"{"name":["site-"]}"#),
            "%7B%22name%22%3A%5B%22site-%22%5D%7D"
        );
        assert_eq!(encode_query_value("klakegg/hugo"), "klakegg%2Fhugo");
    }

    #[test]
    fn cpu_percent_uses_deltas() {
        let stats: api::Stats = serde_json::from_value(serde_json::json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 300 },
                "system_cpu_usage": 2000,
                "online_cpus": 2
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 100 },
                "system_cpu_usage": 1000
            },
            "memory_stats": { "usage": 10, "limit": 100 }
        }))
        .unwrap();

        let percent = cpu_percent(&stats);
        assert!((percent - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_percent_without_previous_sample_is_zero() {
        let stats: api::Stats = serde_json::from_value(serde_json::json!({
            "cpu_stats": { "cpu_usage": { "total_usage": 300 } },
            "precpu_stats": {}
        }))
        .unwrap();

        assert!(cpu_percent(&stats).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_socket_is_reported() {
        let client = DockerClient::new("/nonexistent/docker.sock");
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ContainerError::SocketNotFound(_)));
    }
}
