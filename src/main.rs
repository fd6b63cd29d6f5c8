use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use azenv::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "azenv")]
#[command(about = "Diagnostic HTTP/HTTPS server that echoes request metadata", long_about = None)]
struct Args {
    /// Load the configuration from a TOML file instead of the flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP port to listen on
    #[arg(short = 'p', long, default_value_t = 8080)]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, default_value_t = 8443)]
    https_port: u16,

    /// Enable the HTTPS listener
    #[arg(long)]
    ssl: bool,

    /// Path to the certificate file
    #[arg(long, default_value = "cert/server.crt")]
    cert: PathBuf,

    /// Path to the private key file
    #[arg(long, default_value = "cert/server.key")]
    key: PathBuf,

    /// Force regeneration of the self-signed certificate
    #[arg(long)]
    gen_cert: bool,

    /// Use Let's Encrypt for automatic certificates instead of a self-signed one
    #[arg(long)]
    lets_encrypt: bool,

    /// Domain name for automatic certificates (required with --lets-encrypt)
    #[arg(long, default_value = "")]
    domain: String,

    /// Directory to cache automatically issued certificates
    #[arg(long, default_value = "cert-cache")]
    cache_dir: PathBuf,

    /// Port for the ACME challenge listener (0 disables it)
    #[arg(long, default_value_t = 80)]
    challenge_port: u16,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        if let Some(path) = &self.config {
            return ServerConfig::from_file(path);
        }
        Ok(ServerConfig {
            http_port: self.http_port,
            https_port: self.https_port,
            ssl: self.ssl,
            cert_path: self.cert,
            key_path: self.key,
            gen_cert: self.gen_cert,
            lets_encrypt: self.lets_encrypt,
            domain: self.domain,
            cache_dir: self.cache_dir,
            challenge_port: self.challenge_port,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.into_config()?;
    config.validate()?;

    tracing::info!("🚀 Starting AZenv server");
    if config.ssl && config.lets_encrypt {
        tracing::info!(domain = %config.domain, "Using Let's Encrypt for automatic certificates");
    }

    azenv::server::run(config).await
}
