use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
    routing::{any, get},
};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::acme::{AcmeManager, AcmeSettings, ChallengeTokens};
use crate::certs;
use crate::config::ServerConfig;
use crate::report;

/// Shared application state
#[derive(Clone, Default)]
pub struct AppState {
    /// HTTP-01 tokens, present only when automatic issuance is active.
    pub challenge_tokens: Option<ChallengeTokens>,
}

/// Builds the router shared by every listener.
///
/// The report route is the only real route; the ACME challenge route is
/// mounted only when automatic issuance is active.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route(report::REPORT_PATH, any(report_handler));
    if state.challenge_tokens.is_some() {
        router = router.route(
            "/.well-known/acme-challenge/:token",
            get(acme_challenge_handler),
        );
    }
    router
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Renders the request-metadata report for `/azenv`.
async fn report_handler(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    // The host field is the request's own Host header (or the authority of
    // an absolute-form URI), not X-Forwarded-Host or Forwarded.
    let host = headers
        .get(header::HOST)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .or_else(|| uri.host().map(str::to_string))
        .unwrap_or_default();
    let html = report::render_report(
        &remote.to_string(),
        &method,
        &uri,
        &host,
        &headers,
        report::now_unix(),
    );
    ([(header::CONTENT_TYPE, "text/html")], html)
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "404 page not found\n")
}

/// Answers HTTP-01 validation requests from the challenge token map.
async fn acme_challenge_handler(
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> Result<String, StatusCode> {
    if let Some(tokens) = &state.challenge_tokens {
        if let Some(key_authorization) = tokens.read().await.get(&token) {
            debug!(%token, "Serving ACME challenge");
            return Ok(key_authorization.clone());
        }
    }
    debug!(%token, "ACME challenge token not found");
    Err(StatusCode::NOT_FOUND)
}

/// Starts the configured listeners and serves until the primary HTTP
/// listener stops.
///
/// Secondary listeners (HTTPS, ACME challenge) run as detached tasks and
/// log their failures without taking the process down; a primary-listener
/// failure is fatal.
pub async fn run(config: ServerConfig) -> Result<()> {
    let mut state = AppState::default();
    let mut https_enabled = config.ssl;

    if https_enabled && config.lets_encrypt {
        // An unusable cache directory disables HTTPS for this run; only the
        // primary HTTP listener may take the process down.
        if let Some(manager) = init_acme(&config) {
            state.challenge_tokens = Some(manager.challenge_tokens());

            if config.challenge_port != 0 {
                spawn_challenge_listener(config.challenge_addr(), router(state.clone()));
            } else {
                info!(
                    "Built-in challenge listener disabled; something else must serve /.well-known/acme-challenge/"
                );
            }

            spawn_acme_https_listener(config.https_addr(), manager, router(state.clone()));
        }
    } else if https_enabled {
        if let Err(err) = certs::ensure_self_signed(&config.cert_path, &config.key_path, config.gen_cert)
        {
            error!(%err, "Certificate generation failed, disabling HTTPS");
            https_enabled = false;
        }
        if https_enabled {
            spawn_https_listener(&config, router(state.clone()));
        }
    }

    let addr = config.http_addr();
    info!("HTTP server listening on http://{addr}");
    info!(
        "Access the request report at http://localhost:{}{}",
        config.http_port,
        report::REPORT_PATH
    );
    axum::Server::try_bind(&addr)
        .context(format!("Failed to bind HTTP listener on {addr}"))?
        .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("HTTP server error")?;

    Ok(())
}

/// Prepares the ACME manager, logging failures instead of propagating them.
fn init_acme(config: &ServerConfig) -> Option<AcmeManager> {
    match AcmeManager::new(AcmeSettings::new(
        config.domain.clone(),
        config.cache_dir.clone(),
    )) {
        Ok(manager) => Some(manager),
        Err(err) => {
            error!(%err, "Failed to set up automatic certificates, disabling HTTPS");
            None
        }
    }
}

/// HTTPS from certificate/key files on disk.
fn spawn_https_listener(config: &ServerConfig, app: Router) {
    let addr = config.https_addr();
    let cert_path = config.cert_path.clone();
    let key_path = config.key_path.clone();

    tokio::spawn(async move {
        let tls = match RustlsConfig::from_pem_file(&cert_path, &key_path).await {
            Ok(tls) => tls,
            Err(err) => {
                error!(%err, cert = %cert_path.display(), "Failed to load certificate, HTTPS listener not started");
                return;
            }
        };

        info!("HTTPS server listening on https://{addr}");
        if let Err(err) = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!(%err, "HTTPS server error");
        }
    });
}

/// HTTPS backed by the ACME manager; waits for a certificate before binding.
fn spawn_acme_https_listener(addr: SocketAddr, manager: AcmeManager, app: Router) {
    tokio::spawn(async move {
        let tls = match manager.certificate().await {
            Ok(tls) => tls,
            Err(err) => {
                error!(%err, "Automatic certificate unavailable, continuing without HTTPS");
                return;
            }
        };
        manager.spawn_renewal(tls.clone());

        info!("HTTPS server listening on https://{addr}");
        if let Err(err) = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!(%err, "HTTPS server error");
        }
    });
}

/// Plain HTTP listener answering ACME domain-validation requests.
fn spawn_challenge_listener(addr: SocketAddr, app: Router) {
    tokio::spawn(async move {
        info!("ACME challenge listener on http://{addr}");
        let server = match axum::Server::try_bind(&addr) {
            Ok(server) => server,
            Err(err) => {
                error!(%err, "Failed to bind challenge listener");
                return;
            }
        };
        if let Err(err) = server
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!(%err, "Challenge listener error");
        }
    });
}
