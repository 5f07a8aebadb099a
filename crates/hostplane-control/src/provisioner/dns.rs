//! DNS lookups and record management.

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info};

use crate::error::{ControlError, ControlResult, Provider};

/// Resolves TXT records used for ownership verification.
#[async_trait]
pub trait DnsVerifier: Send + Sync {
    /// TXT record values at `name`. A missing name yields no records.
    async fn txt_records(&self, name: &str) -> ControlResult<Vec<String>>;
}

/// Manages records at the DNS provider.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a record.
    async fn create_record(&self, name: &str, record_type: &str, value: &str) -> ControlResult<()>;

    /// Replace the value of a record.
    async fn update_record(&self, name: &str, record_type: &str, value: &str) -> ControlResult<()>;

    /// Delete a record.
    async fn delete_record(&self, name: &str, record_type: &str) -> ControlResult<()>;
}

/// TXT lookups through the system's upstream resolvers.
#[derive(Clone)]
pub struct HickoryVerifier {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryVerifier {
    /// Create a verifier giving up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            timeout,
        }
    }
}

impl std::fmt::Debug for HickoryVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryVerifier")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DnsVerifier for HickoryVerifier {
    async fn txt_records(&self, name: &str) -> ControlResult<Vec<String>> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.txt_lookup(name))
            .await
            .map_err(|_| ControlError::Timeout {
                operation: format!("TXT lookup for {name}"),
                limit: self.timeout,
            })?;

        match lookup {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk))
                        .collect::<String>()
                })
                .collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                debug!(name, "no TXT records");
                Ok(Vec::new())
            }
            Err(e) => Err(ControlError::provider(Provider::Dns, e.to_string())),
        }
    }
}

/// Provider that only logs record changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDnsProvider;

#[async_trait]
impl DnsProvider for LoggingDnsProvider {
    async fn create_record(&self, name: &str, record_type: &str, value: &str) -> ControlResult<()> {
        info!(name, record_type, value, "create DNS record");
        Ok(())
    }

    async fn update_record(&self, name: &str, record_type: &str, value: &str) -> ControlResult<()> {
        info!(name, record_type, value, "update DNS record");
        Ok(())
    }

    async fn delete_record(&self, name: &str, record_type: &str) -> ControlResult<()> {
        info!(name, record_type, "delete DNS record");
        Ok(())
    }
}
