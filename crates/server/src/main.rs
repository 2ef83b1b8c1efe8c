mod authenticator;
mod config;
mod dispatcher;
mod error;
mod invites;
mod rate_limit;
mod registry;
mod sessions;
mod tokens;
mod users;
mod validate;
mod web;
mod wol;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use relay_protocol::{ShutdownPayload, WireEvent};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::invites::InviteStore;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;
use crate::sessions::SessionStore;
use crate::users::UserStore;
use crate::web::AppState;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/relay.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let users = Arc::new(
        UserStore::init(&config.server.users_file)
            .await
            .with_context(|| format!("failed to load users file: {}", config.server.users_file))?,
    );
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(config.session.ttl_hours * 3600)));
    let invites = Arc::new(InviteStore::new(Duration::from_secs(config.invite.ttl_days * 86400)));
    let registry = ConnectionRegistry::new();

    let login_limiter = RateLimiter::new(
        config.security.max_login_attempts as usize,
        Duration::from_secs(config.security.lockout_minutes * 60),
    );
    let wake_limiter = RateLimiter::new(config.security.wake_rate_limit as usize, Duration::from_secs(60));

    let sweep_interval = Duration::from_secs(config.session.sweep_interval_minutes.max(1) * 60);

    let state = Arc::new(AppState {
        users,
        sessions: Arc::clone(&sessions),
        invites,
        registry: Arc::clone(&registry),
        config,
        login_limiter,
        wake_limiter,
        started_at: Instant::now(),
        metrics_logins_attempted: AtomicU64::new(0),
        metrics_logins_failed: AtomicU64::new(0),
        metrics_wake_attempts: AtomicU64::new(0),
    });

    let app = web::build_router(Arc::clone(&state));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("relay server listening on {bind_addr}");

    let sweeper_sessions = Arc::clone(&sessions);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let removed = sweeper_sessions.sweep().await;
            if removed > 0 {
                tracing::debug!(removed, "swept expired sessions");
            }
        }
    });

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!("server error: {e}");
    }

    tracing::info!("shutting down, notifying connected sockets");
    registry
        .broadcast_all(&WireEvent::ServerShutdown(ShutdownPayload {
            message: "server is restarting".to_string(),
        }))
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    tracing::info!("relay server shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, initiating graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, initiating graceful shutdown"),
    }
}
