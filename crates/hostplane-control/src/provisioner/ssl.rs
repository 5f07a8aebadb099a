//! Certificate issuance and reverse proxy wiring.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use tracing::{debug, info, warn};

use crate::config::SslConfig;
use crate::error::{ControlError, ControlResult, Provider};
use crate::process::ProcessCommand;

/// Paths and expiry of an installed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM certificate.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
    /// `notAfter` of the certificate.
    pub expires_at: DateTime<Utc>,
}

/// Issues and revokes per-domain certificates.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue (or reissue) a certificate for `domain`.
    async fn issue(&self, domain: &str) -> ControlResult<IssuedCertificate>;

    /// Remove the certificate for `domain`. Returns whether one existed.
    async fn revoke(&self, domain: &str) -> ControlResult<bool>;

    /// Expiry of the installed certificate, if any.
    async fn expiry(&self, domain: &str) -> ControlResult<Option<DateTime<Utc>>>;
}

/// Checks that a domain answers over HTTP before issuance.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether `http://{domain}/` answers with a success status.
    async fn is_reachable(&self, domain: &str) -> bool;
}

/// Self-signed certificates written to the configured directories.
#[derive(Debug, Clone)]
pub struct SelfSignedIssuer {
    cert_dir: PathBuf,
    key_dir: PathBuf,
    validity_days: u32,
    wildcard: bool,
}

impl SelfSignedIssuer {
    /// Create an issuer from configuration.
    #[must_use]
    pub fn new(config: &SslConfig) -> Self {
        Self {
            cert_dir: config.cert_dir.clone(),
            key_dir: config.key_dir.clone(),
            validity_days: config.validity_days,
            wildcard: config.wildcard,
        }
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.cert_dir.join(format!("{domain}.crt"))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.key_dir.join(format!("{domain}.key"))
    }

    fn generate(&self, domain: &str) -> ControlResult<(String, String)> {
        let mut names = vec![domain.to_owned()];
        if self.wildcard {
            names.push(format!("*.{domain}"));
        }

        let mut params = CertificateParams::new(names).map_err(certificate_error)?;
        params.distinguished_name.push(DnType::CommonName, domain);
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));

        let key_pair = KeyPair::generate().map_err(certificate_error)?;
        let cert = params.self_signed(&key_pair).map_err(certificate_error)?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }
}

fn certificate_error(e: impl std::fmt::Display) -> ControlError {
    ControlError::provider(Provider::Certificate, e.to_string())
}

/// Read the `notAfter` of a PEM certificate.
pub fn pem_expiry(pem: &[u8]) -> ControlResult<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(certificate_error)?;
    let cert = pem.parse_x509().map_err(certificate_error)?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| certificate_error(format!("expiry out of range: {timestamp}")))
}

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str) -> ControlResult<IssuedCertificate> {
        let (cert_pem, key_pem) = self.generate(domain)?;
        let expires_at = pem_expiry(cert_pem.as_bytes())?;

        tokio::fs::create_dir_all(&self.cert_dir).await?;
        tokio::fs::create_dir_all(&self.key_dir).await?;

        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);
        tokio::fs::write(&cert_path, cert_pem).await?;
        write_private(&key_path, key_pem.as_bytes()).await?;

        info!(domain, expires_at = %expires_at, "issued certificate");
        Ok(IssuedCertificate {
            cert_path,
            key_path,
            expires_at,
        })
    }

    async fn revoke(&self, domain: &str) -> ControlResult<bool> {
        let removed_cert = remove_if_exists(&self.cert_path(domain)).await?;
        let removed_key = remove_if_exists(&self.key_path(domain)).await?;
        if removed_cert || removed_key {
            info!(domain, "removed certificate");
        }
        Ok(removed_cert)
    }

    async fn expiry(&self, domain: &str) -> ControlResult<Option<DateTime<Utc>>> {
        match tokio::fs::read(self.cert_path(domain)).await {
            Ok(pem) => pem_expiry(&pem).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
async fn write_private(path: &Path, contents: &[u8]) -> ControlResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &Path, contents: &[u8]) -> ControlResult<()> {
    tokio::fs::write(path, contents).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> ControlResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Probes `http://{domain}/` with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe giving up after `timeout`.
    pub fn new(timeout: Duration) -> ControlResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self, domain: &str) -> bool {
        match self.client.get(format!("http://{domain}/")).send().await {
            Ok(response) => {
                debug!(domain, status = %response.status(), "reachability probe answered");
                response.status().is_success()
            }
            Err(e) => {
                debug!(domain, error = %e, "reachability probe failed");
                false
            }
        }
    }
}

/// Writes nginx server blocks for certified domains and reloads the proxy.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfigurator {
    config_dir: Option<PathBuf>,
    reload_command: Vec<String>,
    reload_timeout: Duration,
}

impl ProxyConfigurator {
    /// Create a configurator from configuration.
    #[must_use]
    pub fn new(config: &SslConfig) -> Self {
        Self {
            config_dir: config.proxy_config_dir.clone(),
            reload_command: config.reload_command.clone(),
            reload_timeout: config.reload_timeout(),
        }
    }

    /// A configurator that writes nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    fn config_path(&self, domain: &str) -> Option<PathBuf> {
        self.config_dir
            .as_ref()
            .map(|dir| dir.join(format!("{domain}.conf")))
    }

    /// Write the server block for `domain` and reload.
    pub async fn install(
        &self,
        domain: &str,
        certificate: &IssuedCertificate,
        upstream_port: Option<u16>,
    ) -> ControlResult<()> {
        let Some(path) = self.config_path(domain) else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&path, server_block(domain, certificate, upstream_port)).await?;
        debug!(domain, path = %path.display(), "wrote proxy configuration");
        self.reload().await
    }

    /// Remove the server block for `domain` and reload.
    pub async fn remove(&self, domain: &str) -> ControlResult<()> {
        let Some(path) = self.config_path(domain) else {
            return Ok(());
        };
        if remove_if_exists(&path).await? {
            self.reload().await?;
        }
        Ok(())
    }

    async fn reload(&self) -> ControlResult<()> {
        let Some((program, args)) = self.reload_command.split_first() else {
            return Ok(());
        };
        ProcessCommand::new(program, self.reload_timeout)
            .args(args.iter().cloned())
            .run()
            .await
            .map_err(|e| {
                warn!(error = %e, "proxy reload failed");
                ControlError::provider(Provider::Proxy, e.to_string())
            })?;
        Ok(())
    }
}

fn server_block(domain: &str, certificate: &IssuedCertificate, upstream_port: Option<u16>) -> String {
    let location = match upstream_port {
        Some(port) => format!(
            "        proxy_pass http://127.0.0.1:{port};\n\
             \x20       proxy_set_header Host $host;\n\
             \x20       proxy_set_header X-Real-IP $remote_addr;\n\
             \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             \x20       proxy_set_header X-Forwarded-Proto $scheme;\n"
        ),
        None => "        return 503;\n".to_owned(),
    };

    format!(
        "server {{\n\
         \x20   listen 80;\n\
         \x20   server_name {domain};\n\
         \x20   return 301 https://$host$request_uri;\n\
         }}\n\
         \n\
         server {{\n\
         \x20   listen 443 ssl;\n\
         \x20   server_name {domain};\n\
         \n\
         \x20   ssl_certificate {cert};\n\
         \x20   ssl_certificate_key {key};\n\
         \n\
         \x20   location / {{\n\
         {location}\
         \x20   }}\n\
         }}\n",
        cert = certificate.cert_path.display(),
        key = certificate.key_path.display(),
    )
}
