//! Automatic certificate issuance built on `instant-acme`.
//!
//! The manager owns the on-disk certificate cache and the HTTP-01 challenge
//! token map. The challenge listener serves tokens out of that map at
//! `/.well-known/acme-challenge/:token` while an order is in flight.

use axum_server::tls_rustls::RustlsConfig;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{Certificate, CertificateParams, PKCS_ECDSA_P256_SHA256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Tokens for in-flight HTTP-01 challenges, shared with the challenge route.
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

/// Certificates are re-issued this long before they expire.
const RENEWAL_WINDOW: Duration = Duration::days(30);

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("certificate request error: {0}")]
    Rcgen(#[from] rcgen::RcgenError),
    #[error("acme client error: {0}")]
    Client(#[from] instant_acme::Error),
    #[error("acme error: {0}")]
    Acme(String),
}

/// Account, domain and cache settings for the ACME manager.
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub domain: String,
    pub cache_dir: PathBuf,
    pub directory_url: String,
    pub contact_email: Option<String>,
}

impl AcmeSettings {
    pub fn new(domain: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            domain: domain.into(),
            cache_dir: cache_dir.into(),
            directory_url: LetsEncrypt::Production.url().to_string(),
            contact_email: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AcmeManager {
    settings: AcmeSettings,
    tokens: ChallengeTokens,
}

impl AcmeManager {
    /// Validates the settings and prepares the cache directory.
    ///
    /// No network traffic happens here; the ACME directory is only contacted
    /// once a certificate is actually requested.
    pub fn new(settings: AcmeSettings) -> Result<Self, AcmeError> {
        if settings.domain.is_empty() {
            return Err(AcmeError::Configuration(
                "automatic certificates require a domain".into(),
            ));
        }
        fs::create_dir_all(&settings.cache_dir)?;
        Ok(Self {
            settings,
            tokens: Arc::default(),
        })
    }

    /// The token map served by the HTTP-01 challenge route.
    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.tokens.clone()
    }

    /// Returns a TLS config backed by a cached certificate when one is still
    /// comfortably valid, issuing a fresh one otherwise.
    pub async fn certificate(&self) -> Result<RustlsConfig, AcmeError> {
        if let Some((cert_pem, key_pem)) = self.load_cached()? {
            info!(domain = %self.settings.domain, "Using cached certificate");
            return Ok(RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes()).await?);
        }

        info!(domain = %self.settings.domain, "Requesting certificate");
        let (cert_pem, key_pem) = self.issue().await?;
        Ok(RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.into_bytes()).await?)
    }

    /// Keeps the given TLS config fresh by re-issuing near expiry.
    pub fn spawn_renewal(&self, tls: RustlsConfig) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(manager.renewal_delay()).await;
                match manager.issue().await {
                    Ok((cert_pem, key_pem)) => {
                        match tls
                            .reload_from_pem(cert_pem.into_bytes(), key_pem.into_bytes())
                            .await
                        {
                            Ok(()) => info!(domain = %manager.settings.domain, "Certificate renewed"),
                            Err(err) => error!(%err, "Failed to load renewed certificate"),
                        }
                    }
                    Err(err) => {
                        warn!(%err, "Certificate renewal failed, will retry in an hour");
                        sleep(std::time::Duration::from_secs(60 * 60)).await;
                    }
                }
            }
        });
    }

    fn cert_path(&self) -> PathBuf {
        self.settings.cache_dir.join("cert.pem")
    }

    fn key_path(&self) -> PathBuf {
        self.settings.cache_dir.join("key.pem")
    }

    fn account_path(&self) -> PathBuf {
        self.settings.cache_dir.join("account.json")
    }

    /// Loads the cached certificate pair unless it is inside the renewal window.
    fn load_cached(&self) -> Result<Option<(String, String)>, AcmeError> {
        let (cert_path, key_path) = (self.cert_path(), self.key_path());
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;
        let expires_at = extract_not_after(&cert_pem)?;
        if OffsetDateTime::now_utc() >= expires_at - RENEWAL_WINDOW {
            debug!(%expires_at, "Cached certificate is due for renewal");
            return Ok(None);
        }
        Ok(Some((cert_pem, key_pem)))
    }

    fn renewal_delay(&self) -> std::time::Duration {
        let expiry = fs::read_to_string(self.cert_path())
            .ok()
            .and_then(|pem| extract_not_after(&pem).ok());
        match expiry {
            Some(expires_at) => {
                let renew_at = expires_at - RENEWAL_WINDOW;
                (renew_at - OffsetDateTime::now_utc())
                    .try_into()
                    .unwrap_or(std::time::Duration::ZERO)
            }
            None => std::time::Duration::from_secs(60 * 60),
        }
    }

    /// Runs one full HTTP-01 order and stores the result in the cache.
    async fn issue(&self) -> Result<(String, String), AcmeError> {
        let account = self.load_or_create_account().await?;
        let identifier = Identifier::Dns(self.settings.domain.clone());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authorization in &authorizations {
            if matches!(authorization.status, AuthorizationStatus::Valid) {
                continue;
            }
            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AcmeError::Acme(format!(
                        "no http-01 challenge offered for {}",
                        self.settings.domain
                    ))
                })?;

            let key_auth = order.key_authorization(challenge);
            self.tokens
                .write()
                .await
                .insert(challenge.token.clone(), key_auth.as_str().to_string());
            order.set_challenge_ready(&challenge.url).await?;
        }

        wait_for_order_ready(&mut order).await?;

        let mut params = CertificateParams::new(vec![self.settings.domain.clone()]);
        params.alg = &PKCS_ECDSA_P256_SHA256;
        let csr_cert = Certificate::from_params(params)?;
        order.finalize(&csr_cert.serialize_request_der()?).await?;

        let cert_pem = fetch_certificate(&mut order).await?;
        let key_pem = csr_cert.serialize_private_key_pem();

        fs::write(self.cert_path(), &cert_pem)?;
        crate::certs::write_key_pem(&self.key_path(), &key_pem)?;
        self.tokens.write().await.clear();

        info!(domain = %self.settings.domain, "Certificate issued");
        Ok((cert_pem, key_pem))
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        let path = self.account_path();
        if path.exists() {
            let data = tokio::fs::read(&path).await?;
            let credentials: AccountCredentials = serde_json::from_slice(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        let contacts: Vec<String> = self
            .settings
            .contact_email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect();
        let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();
        // Terms of service are accepted automatically; this server has no
        // interactive operator to prompt.
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact_refs,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.settings.directory_url,
            None,
        )
        .await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&credentials)?).await?;
        Ok(account)
    }
}

async fn wait_for_order_ready(order: &mut Order) -> Result<(), AcmeError> {
    let mut attempts = 0u8;
    let mut delay = std::time::Duration::from_millis(250);

    loop {
        sleep(delay).await;
        let state = order.refresh().await?;
        debug!(status = ?state.status, "Polled order status");

        match state.status {
            OrderStatus::Ready => return Ok(()),
            OrderStatus::Invalid => {
                return Err(AcmeError::Acme(
                    "order marked invalid while waiting for validation".into(),
                ));
            }
            _ => {}
        }

        attempts += 1;
        if attempts > 7 {
            return Err(AcmeError::Acme("timeout waiting for order readiness".into()));
        }
        delay = (delay * 2).min(std::time::Duration::from_secs(8));
    }
}

async fn fetch_certificate(order: &mut Order) -> Result<String, AcmeError> {
    for attempt in 0..10 {
        if let Some(cert) = order.certificate().await? {
            return Ok(cert);
        }
        debug!(attempt, "Certificate not ready yet");
        sleep(std::time::Duration::from_secs(1)).await;
    }
    Err(AcmeError::Acme("certificate issuance timed out".into()))
}

/// Reads the expiry timestamp out of the first certificate in a PEM bundle.
fn extract_not_after(pem: &str) -> Result<OffsetDateTime, AcmeError> {
    use x509_parser::prelude::*;

    let ders = rustls_pemfile::certs(&mut pem.as_bytes())
        .map_err(|_| AcmeError::Acme("failed to parse certificate PEM".into()))?;
    let der = ders
        .first()
        .ok_or_else(|| AcmeError::Acme("certificate chain is empty".into()))?;
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| AcmeError::Acme(format!("invalid certificate: {err}")))?;
    Ok(cert.validity().not_after.to_datetime())
}
