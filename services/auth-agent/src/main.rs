//! Spotify auth agent
//!
//! Local credential broker for Spotify:
//! 1. Loads stored sessions from an owner-only secret file and refreshes them
//! 2. Signs users in with Authorization Code + PKCE through the browser
//! 3. Receives the OAuth redirect on a loopback listener
//! 4. Hands out access tokens over a small loopback HTTP API

mod browser;
mod callback;
mod config;
mod error;
mod file_store;
mod metrics;
mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use spotify_auth::ReqwestTransport;
use spotify_session::{AuthProvider, Collaborators};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use crate::browser::SystemBrowser;
use crate::callback::LoopbackRedirectWaiter;
use crate::config::Config;
use crate::file_store::FileSecretStorage;
use crate::routes::{AppState, build_router};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting spotify-auth-agent");

    // Install before any session code emits metrics
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config_path, explicit) = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), explicit, "loading configuration");
    let config = if explicit {
        Config::load(&config_path)
    } else {
        Config::load_or_default(&config_path)
    }
    .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let callback_uri = Url::parse(&config.oauth.callback_uri)
        .with_context(|| format!("invalid callback_uri {}", config.oauth.callback_uri))?;
    if callback_uri.port_or_known_default() != Some(config.server.listen_addr.port()) {
        warn!(
            callback_uri = %callback_uri,
            listen_addr = %config.server.listen_addr,
            "callback_uri port differs from listen_addr; redirects will not reach this agent"
        );
    }
    let default_scopes = config.default_scopes()?;

    info!(
        listen_addr = %config.server.listen_addr,
        client_id = %config.oauth.client_id,
        storage = %config.storage.path.display(),
        default_scopes = %default_scopes,
        "configuration loaded"
    );

    let storage = FileSecretStorage::load(config.storage.path.clone())
        .await
        .context("failed to open secret storage")?;
    let redirect = LoopbackRedirectWaiter::new();

    // Bind before initializing so a redirect can never arrive with no listener
    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;

    let provider = AuthProvider::initialize(
        config.provider_config(),
        Collaborators {
            storage: Arc::new(storage),
            redirect: Arc::new(redirect.clone()),
            browser: Arc::new(SystemBrowser::new(config.flow.open_browser)),
            transport: Arc::new(ReqwestTransport::default()),
        },
    )
    .await
    .context("failed to initialize auth provider")?;
    let provider = Arc::new(provider);

    let _changes = provider.subscribe(|event| {
        for session in &event.added {
            info!(session_id = %session.id, account = %session.account.label, "session added");
        }
        for session in &event.changed {
            info!(session_id = %session.id, "session refreshed");
        }
        for session in &event.removed {
            info!(session_id = %session.id, account = %session.account.label, "session removed");
        }
    });

    let app = build_router(
        AppState {
            provider: Arc::clone(&provider),
            redirect,
            default_scopes,
            callback_uri,
            prometheus,
            started_at: Instant::now(),
        },
        config.server.max_connections,
    );

    info!(addr = %config.server.listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Pending sign-ins would otherwise hold their requests open for the full redirect timeout
    let cancelled = provider.cancel_pending_flows();
    if cancelled > 0 {
        info!(cancelled, "cancelled pending sign-ins");
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    provider.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
