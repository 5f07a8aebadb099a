//! Domain verification and certificate lifecycle.
//!
//! Subdomains of the panel are verified on configuration. Custom domains
//! must publish their verification token in a TXT record at
//! `{prefix}.{domain}` before a certificate is requested.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::store::SiteStore;
use crate::types::{Domain, DomainId, DomainType};

use super::dns::{DnsProvider, DnsVerifier};
use super::ssl::{CertificateIssuer, ProxyConfigurator, ReachabilityProbe};

/// Default TXT label for verification tokens.
const DEFAULT_VERIFICATION_PREFIX: &str = "_hostplane-verification";

/// Certificates closer than this to expiry are renewed.
const DEFAULT_RENEWAL_THRESHOLD_DAYS: u32 = 30;

/// First 16 hex characters of a random UUID, upper-cased.
#[must_use]
pub fn generate_verification_token() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(16)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Configures DNS verification and certificates for domains.
pub struct DomainManager {
    store: Arc<dyn SiteStore>,
    issuer: Arc<dyn CertificateIssuer>,
    probe: Arc<dyn ReachabilityProbe>,
    verifier: Arc<dyn DnsVerifier>,
    dns: Arc<dyn DnsProvider>,
    proxy: ProxyConfigurator,
    verification_prefix: String,
    renewal_threshold: Duration,
}

impl DomainManager {
    /// Create a manager without reverse proxy wiring.
    pub fn new(
        store: Arc<dyn SiteStore>,
        issuer: Arc<dyn CertificateIssuer>,
        probe: Arc<dyn ReachabilityProbe>,
        verifier: Arc<dyn DnsVerifier>,
        dns: Arc<dyn DnsProvider>,
    ) -> Self {
        Self {
            store,
            issuer,
            probe,
            verifier,
            dns,
            proxy: ProxyConfigurator::disabled(),
            verification_prefix: DEFAULT_VERIFICATION_PREFIX.to_owned(),
            renewal_threshold: Duration::days(i64::from(DEFAULT_RENEWAL_THRESHOLD_DAYS)),
        }
    }

    /// Write proxy configuration when certificates are installed.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfigurator) -> Self {
        self.proxy = proxy;
        self
    }

    /// Use a different TXT label for verification tokens.
    #[must_use]
    pub fn with_verification_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.verification_prefix = prefix.into();
        self
    }

    /// Renew certificates expiring within `days`.
    #[must_use]
    pub fn with_renewal_threshold_days(mut self, days: u32) -> Self {
        self.renewal_threshold = Duration::days(i64::from(days));
        self
    }

    /// TXT record name holding the verification token for `domain_name`.
    #[must_use]
    pub fn verification_record(&self, domain_name: &str) -> String {
        format!("{}.{domain_name}", self.verification_prefix)
    }

    async fn require(&self, id: &DomainId) -> ControlResult<Domain> {
        self.store
            .get_domain(id)
            .await?
            .ok_or_else(|| ControlError::not_found("domain", id))
    }

    /// Generate a verification token and, once verified, request a
    /// certificate.
    ///
    /// Subdomains are verified immediately. Custom domains stay unverified
    /// until [`DomainManager::verify_dns`] finds the token.
    pub async fn configure_domain(&self, id: &DomainId) -> ControlResult<Domain> {
        let mut domain = self.require(id).await?;

        let token = generate_verification_token();
        domain.verification_token = Some(token.clone());
        domain.dns_verified = domain.domain_type == DomainType::Subdomain;
        domain.updated_at = Utc::now();
        self.store.update_domain(&domain).await?;

        if domain.domain_type == DomainType::Custom {
            self.dns
                .create_record(&self.verification_record(&domain.domain_name), "TXT", &token)
                .await?;
        }

        info!(
            domain = %domain.domain_name,
            domain_type = %domain.domain_type,
            verified = domain.dns_verified,
            "domain configured"
        );

        if domain.dns_verified {
            self.setup_ssl_certificate(id).await?;
            return self.require(id).await;
        }
        Ok(domain)
    }

    /// Check the verification TXT record and persist the result.
    pub async fn verify_dns(&self, id: &DomainId) -> ControlResult<bool> {
        let mut domain = self.require(id).await?;

        let verified = match domain.domain_type {
            DomainType::Subdomain => true,
            DomainType::Custom => match domain.verification_token.as_deref() {
                None => false,
                Some(token) => {
                    let name = self.verification_record(&domain.domain_name);
                    match self.verifier.txt_records(&name).await {
                        Ok(records) => records.iter().any(|r| r.trim() == token),
                        Err(e) => {
                            warn!(record = %name, error = %e, "verification lookup failed");
                            false
                        }
                    }
                }
            },
        };

        if verified != domain.dns_verified {
            domain.dns_verified = verified;
            domain.updated_at = Utc::now();
            self.store.update_domain(&domain).await?;
        }
        debug!(domain = %domain.domain_name, verified, "DNS verification checked");
        Ok(verified)
    }

    /// Request a certificate for a verified domain.
    ///
    /// Returns `false` without error when the domain does not answer over
    /// HTTP yet.
    pub async fn setup_ssl_certificate(&self, id: &DomainId) -> ControlResult<bool> {
        let mut domain = self.require(id).await?;
        if !domain.dns_verified {
            return Err(ControlError::validation(format!(
                "domain {} is not verified",
                domain.domain_name
            )));
        }

        if !self.probe.is_reachable(&domain.domain_name).await {
            warn!(domain = %domain.domain_name, "domain not reachable, certificate skipped");
            return Ok(false);
        }

        self.install_certificate(&mut domain).await?;
        Ok(true)
    }

    async fn install_certificate(&self, domain: &mut Domain) -> ControlResult<()> {
        let certificate = self.issuer.issue(&domain.domain_name).await?;
        let upstream = self
            .store
            .get_site(&domain.site_id)
            .await?
            .and_then(|site| site.container_port);
        self.proxy
            .install(&domain.domain_name, &certificate, upstream)
            .await?;

        domain.ssl_enabled = true;
        domain.ssl_expires_at = Some(certificate.expires_at);
        domain.updated_at = Utc::now();
        self.store.update_domain(domain).await?;

        info!(
            domain = %domain.domain_name,
            expires_at = %certificate.expires_at,
            "certificate installed"
        );
        Ok(())
    }

    /// Remove a domain's certificate and proxy configuration.
    ///
    /// Returns whether a certificate existed.
    pub async fn remove_ssl_certificate(&self, id: &DomainId) -> ControlResult<bool> {
        let mut domain = self.require(id).await?;

        self.proxy.remove(&domain.domain_name).await?;
        let removed = self.issuer.revoke(&domain.domain_name).await?;

        if domain.ssl_enabled || domain.ssl_expires_at.is_some() {
            domain.ssl_enabled = false;
            domain.ssl_expires_at = None;
            domain.updated_at = Utc::now();
            self.store.update_domain(&domain).await?;
        }
        if domain.domain_type == DomainType::Custom {
            self.dns
                .delete_record(&self.verification_record(&domain.domain_name), "TXT")
                .await?;
        }
        Ok(removed)
    }

    /// Renew a certificate close to expiry.
    ///
    /// Returns `false` when the domain has no certificate. A certificate
    /// with more than the renewal threshold left is kept and reported as
    /// renewed.
    pub async fn renew_ssl_certificate(&self, id: &DomainId) -> ControlResult<bool> {
        let mut domain = self.require(id).await?;

        let Some(expires_at) = self.issuer.expiry(&domain.domain_name).await? else {
            warn!(domain = %domain.domain_name, "no certificate to renew");
            return Ok(false);
        };

        if expires_at > Utc::now() + self.renewal_threshold {
            debug!(domain = %domain.domain_name, %expires_at, "certificate does not need renewal");
            return Ok(true);
        }

        self.install_certificate(&mut domain).await?;
        info!(domain = %domain.domain_name, "certificate renewed");
        Ok(true)
    }

    /// Expiry of the certificate installed for `domain_name`.
    pub async fn certificate_expiry(&self, domain_name: &str) -> ControlResult<Option<DateTime<Utc>>> {
        self.issuer.expiry(domain_name).await
    }

    /// Whether `domain_name` has an unexpired certificate.
    pub async fn is_certificate_valid(&self, domain_name: &str) -> ControlResult<bool> {
        Ok(self
            .certificate_expiry(domain_name)
            .await?
            .is_some_and(|expires_at| expires_at > Utc::now()))
    }

    /// Domains whose certificate expires within `days`.
    pub async fn expiring_certificates(&self, days: u32) -> ControlResult<Vec<Domain>> {
        let before = Utc::now() + Duration::days(i64::from(days));
        self.store.domains_expiring_before(before).await
    }
}

impl std::fmt::Debug for DomainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainManager")
            .field("verification_prefix", &self.verification_prefix)
            .field("renewal_threshold_days", &self.renewal_threshold.num_days())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::dns::LoggingDnsProvider;
    use crate::provisioner::mock::{MockDnsVerifier, MockIssuer, StaticProbe};
    use crate::store::MemoryStore;
    use crate::types::{Site, UserId};

    struct Fixture {
        store: Arc<MemoryStore>,
        issuer: Arc<MockIssuer>,
        probe: Arc<StaticProbe>,
        verifier: Arc<MockDnsVerifier>,
        manager: DomainManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let issuer = Arc::new(MockIssuer::new(90));
        let probe = Arc::new(StaticProbe::new(true));
        let verifier = Arc::new(MockDnsVerifier::new());
        let manager = DomainManager::new(
            store.clone(),
            issuer.clone(),
            probe.clone(),
            verifier.clone(),
            Arc::new(LoggingDnsProvider),
        );
        Fixture {
            store,
            issuer,
            probe,
            verifier,
            manager,
        }
    }

    async fn register(store: &MemoryStore, name: &str, domain_type: DomainType) -> Domain {
        let site = Site::new(
            "Blog".to_owned(),
            name.to_owned(),
            UserId::new("alice"),
            "nginx".to_owned(),
            "default".to_owned(),
            1,
        );
        let domain = Domain::new(site.id.clone(), name.to_owned(), domain_type, true);
        store.register_site(&site, &domain, 50).await.unwrap();
        domain
    }

    #[test]
    fn tokens_are_sixteen_upper_hex() {
        let token = generate_verification_token();
        assert_eq!(token.len(), 16);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[tokio::test]
    async fn subdomain_is_verified_and_certified() {
        let f = fixture();
        let domain = register(&f.store, "blog.panel.test", DomainType::Subdomain).await;

        let configured = f.manager.configure_domain(&domain.id).await.unwrap();
        assert!(configured.dns_verified);
        assert!(configured.verification_token.is_some());
        assert!(configured.ssl_enabled);
        assert!(configured.ssl_expires_at.is_some());
        assert!(f.issuer.has_certificate("blog.panel.test"));
    }

    #[tokio::test]
    async fn custom_domain_waits_for_txt_record() {
        let f = fixture();
        let domain = register(&f.store, "shop.example.com", DomainType::Custom).await;

        let configured = f.manager.configure_domain(&domain.id).await.unwrap();
        assert!(!configured.dns_verified);
        assert!(!configured.ssl_enabled);
        assert!(!f.manager.verify_dns(&domain.id).await.unwrap());

        let token = configured.verification_token.unwrap();
        f.verifier
            .add_txt("_hostplane-verification.shop.example.com", &token);
        assert!(f.manager.verify_dns(&domain.id).await.unwrap());

        let stored = f.store.get_domain(&domain.id).await.unwrap().unwrap();
        assert!(stored.dns_verified);
    }

    #[tokio::test]
    async fn unverified_domain_cannot_get_certificate() {
        let f = fixture();
        let domain = register(&f.store, "shop.example.com", DomainType::Custom).await;

        let err = f.manager.setup_ssl_certificate(&domain.id).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }

    #[tokio::test]
    async fn unreachable_domain_is_skipped() {
        let f = fixture();
        f.probe.set_reachable(false);
        let domain = register(&f.store, "blog.panel.test", DomainType::Subdomain).await;

        let configured = f.manager.configure_domain(&domain.id).await.unwrap();
        assert!(configured.dns_verified);
        assert!(!configured.ssl_enabled);
        assert!(!f.issuer.has_certificate("blog.panel.test"));
    }

    #[tokio::test]
    async fn renewal_respects_threshold() {
        let f = fixture();
        let domain = register(&f.store, "blog.panel.test", DomainType::Subdomain).await;

        assert!(!f.manager.renew_ssl_certificate(&domain.id).await.unwrap());

        let far = Utc::now() + Duration::days(45);
        f.issuer.set_expiry("blog.panel.test", far);
        assert!(f.manager.renew_ssl_certificate(&domain.id).await.unwrap());
        assert_eq!(
            f.manager.certificate_expiry("blog.panel.test").await.unwrap(),
            Some(far)
        );

        let near = Utc::now() + Duration::days(10);
        f.issuer.set_expiry("blog.panel.test", near);
        assert!(f.manager.renew_ssl_certificate(&domain.id).await.unwrap());
        let renewed = f
            .manager
            .certificate_expiry("blog.panel.test")
            .await
            .unwrap()
            .unwrap();
        assert!(renewed > Utc::now() + Duration::days(80));

        let stored = f.store.get_domain(&domain.id).await.unwrap().unwrap();
        assert_eq!(stored.ssl_expires_at, Some(renewed));
    }

    #[tokio::test]
    async fn removal_clears_certificate_state() {
        let f = fixture();
        let domain = register(&f.store, "blog.panel.test", DomainType::Subdomain).await;
        f.manager.configure_domain(&domain.id).await.unwrap();

        assert!(f.manager.remove_ssl_certificate(&domain.id).await.unwrap());
        assert!(!f.manager.is_certificate_valid("blog.panel.test").await.unwrap());

        let stored = f.store.get_domain(&domain.id).await.unwrap().unwrap();
        assert!(!stored.ssl_enabled);
        assert!(stored.ssl_expires_at.is_none());
    }

    #[tokio::test]
    async fn expiring_certificates_lists_domains_in_window() {
        let f = fixture();
        let domain = register(&f.store, "blog.panel.test", DomainType::Subdomain).await;
        f.manager.configure_domain(&domain.id).await.unwrap();

        assert!(f.manager.expiring_certificates(30).await.unwrap().is_empty());
        let expiring = f.manager.expiring_certificates(120).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].domain_name, "blog.panel.test");
    }
}
