use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Process-wide server configuration, immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port to listen on
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port to listen on
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Enable the HTTPS listener
    #[serde(default)]
    pub ssl: bool,

    /// Path to the certificate file
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    /// Path to the private key file
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Force self-signed certificate regeneration
    #[serde(default)]
    pub gen_cert: bool,

    /// Use automatic certificate issuance instead of a self-signed certificate
    #[serde(default)]
    pub lets_encrypt: bool,

    /// Domain name for automatic issuance
    #[serde(default)]
    pub domain: String,

    /// Cache directory for automatically issued certificates
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Port for the ACME challenge listener; 0 disables it
    #[serde(default = "default_challenge_port")]
    pub challenge_port: u16,
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("cert/server.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("cert/server.key")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cert-cache")
}

fn default_challenge_port() -> u16 {
    80
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            https_port: default_https_port(),
            ssl: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            gen_cert: false,
            lets_encrypt: false,
            domain: String::new(),
            cache_dir: default_cache_dir(),
            challenge_port: default_challenge_port(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ServerConfig =
            toml::from_str(&contents).context("Failed to parse TOML configuration")?;

        Ok(config)
    }

    /// Rejects configurations that cannot produce a working server.
    ///
    /// Automatic issuance needs a domain to put on the certificate, so an
    /// empty domain with both `ssl` and `lets_encrypt` set is fatal before
    /// any listener binds.
    pub fn validate(&self) -> Result<()> {
        if self.ssl && self.lets_encrypt && self.domain.is_empty() {
            bail!("--domain is required when using --lets-encrypt");
        }
        Ok(())
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.https_port))
    }

    pub fn challenge_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.challenge_port))
    }
}
