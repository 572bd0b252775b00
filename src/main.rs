#![forbid(unsafe_code)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use tracing::{error, info};

mod bridge;
mod cache;
mod cli;
mod config;
mod db;
mod host;
mod media;
mod metrics;
mod msteams;
#[cfg(test)]
mod testing;
mod utils;
mod web;

use bridge::BridgeCore;
use bridge::activity::ActivityHandler;
use bridge::hooks::{HostPromoter, LocalHooks};
use bridge::monitor::SubscriptionMonitor;
use cli::{Cli, Commands};
use config::Config;
use host::Host;
use msteams::ClientFactory;
use web::{WebServer, WebState};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    utils::logging::init_tracing(&config.logging);
    let config = Arc::new(config);

    match cli.command() {
        Commands::CheckConfig => {
            info!("configuration is valid path={}", cli.config.display());
            Ok(())
        }
        Commands::Migrate => {
            open_database(&config).await?;
            info!("database schema is up to date");
            Ok(())
        }
        Commands::Serve => serve(config).await,
    }
}

async fn open_database(config: &Config) -> Result<Arc<db::DatabaseManager>> {
    let cipher = Arc::new(utils::TokenCipher::new(
        config.msteams.encryption_key.expose_secret(),
    ));
    let db = db::DatabaseManager::new(&config.database, cipher)
        .await
        .context("failed to open the database")?;
    db.migrate().await.context("failed to run migrations")?;
    Ok(Arc::new(db))
}

#[cfg(feature = "prometheus")]
fn install_prometheus_exporter(config: &config::MetricsConfig) -> Result<()> {
    let addr: std::net::SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .context("invalid metrics listen address")?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install the prometheus exporter")?;
    info!("prometheus exporter listening on {}", addr);
    Ok(())
}

async fn serve(config: Arc<Config>) -> Result<()> {
    info!("msteams sync starting up");

    let db = open_database(&config).await?;
    let metrics = Arc::new(crate::metrics::Metrics::new());
    #[cfg(feature = "prometheus")]
    if config.metrics.enabled {
        install_prometheus_exporter(&config.metrics)?;
    }

    let host: Arc<dyn Host> = Arc::new(host::rest::RestHost::new(
        &config.host,
        Duration::from_secs(config.msteams.request_timeout_secs),
    )?);
    let clients: Arc<dyn ClientFactory> = Arc::new(msteams::graph::GraphClientFactory::new(
        &config.msteams,
        db.user_store(),
    )?);
    let core = BridgeCore::new(config.clone(), host.clone(), clients, db, metrics);

    let activities = ActivityHandler::new(core.clone());
    activities.start();
    let monitor = SubscriptionMonitor::new(core.clone());
    monitor.start();

    let hooks = Arc::new(LocalHooks::new(
        core.clone(),
        Arc::new(HostPromoter::new(host)),
    ));
    let web_server = WebServer::new(WebState::new(core, activities.clone(), hooks));
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });
    tokio::pin!(web_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, beginning shutdown");
        },
        _ = &mut web_handle => {
            info!("web server task exited, beginning shutdown");
        },
    }

    web_handle.abort();
    monitor.stop().await;
    activities.stop().await;

    info!("msteams sync shutting down");
    Ok(())
}
