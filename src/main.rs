mod auth;
mod bookings;
mod config;
mod email;
mod entities;
mod http;
mod mailer;
mod models;
mod scheduler;
mod state;
mod voting;

use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenVerifier;
use crate::config::ApiConfig;
use crate::mailer::{EmailTransport, HttpMailer};
use crate::scheduler::Scheduler;
use crate::state::{ApiCache, AppState, PortalSettings};
use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = ApiConfig::load().context("Failed to load configuration")?;
    let database = connect_database(&config).await?;
    run_migrations(&database).await?;

    let mailer: Arc<dyn EmailTransport> = Arc::new(
        HttpMailer::new(
            &config.email.api_url,
            &config.email.api_key,
            &config.email.from_address,
            config.email.request_timeout(),
        )
        .context("Failed to initialize email client")?,
    );

    let server_key = config::server_key_from_env();
    if server_key.is_none() {
        warn!(
            "{} is not set; server-to-server claim writes are disabled",
            config::SERVER_KEY_ENV
        );
    }

    let cache = Arc::new(ApiCache::new(&config.cache));
    let settings = PortalSettings::new(
        server_key,
        config.auth.session_cookie_name.clone(),
        &config.email,
        config.scheduler.timezone()?,
    );
    let app_state = AppState::new(
        database.clone(),
        Arc::clone(&cache),
        Arc::clone(&mailer),
        TokenVerifier::new(&config.auth),
        settings,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            database.clone(),
            Arc::clone(&mailer),
            &config.scheduler,
            config.email.admin_recipients.clone(),
        )
        .context("Failed to initialize scheduler")?;
        Some(tokio::spawn(async move {
            if let Err(err) = scheduler.run(shutdown_rx).await {
                error!("Scheduler terminated with error: {err}");
            }
        }))
    } else {
        info!("Scheduler disabled by configuration");
        None
    };

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Portal API listening on {local_addr}");

    let router: Router = http::router(app_state);
    let server = axum::serve(listener, router.into_make_service());
    server
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .context("HTTP server exited with error")?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = scheduler_handle {
        if let Err(join_err) = handle.await {
            error!("Scheduler task join error: {join_err}");
        }
    }

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

async fn connect_database(config: &ApiConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database.url.clone());
    options
        .max_connections(config.database.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.database.min_connections {
        options.min_connections(min);
    }

    assert!(
        config.database.max_connections <= 64,
        "Connection pool oversized"
    );

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    shutdown_tx.send(true).ok();
    info!("Shutdown signal dispatched");
}
