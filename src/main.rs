mod api;
mod arbitrage;
mod catalog;
mod config;
mod db;
mod error;
mod fetcher;
mod locations;
mod maintenance;
mod sync;
mod types;
mod ws;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::Latencies;
use crate::api::routes::{router, ApiState};
use crate::arbitrage::{ArbitrageCalculator, OpportunityScanner};
use crate::catalog::ItemCatalog;
use crate::config::Config;
use crate::db::OrderBookStore;
use crate::error::{AppError, Result};
use crate::fetcher::{FetchClient, RateLimitGate};
use crate::locations::LocationRegistry;
use crate::maintenance::HistoryPurger;
use crate::sync::{ApiLock, SyncContext, SyncScheduler, SyncStatusBoard};
use crate::ws::{ExpirySweeper, FeedCollector};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    info!(
        region = ?cfg.region,
        api = %cfg.api_base_url,
        feed = %cfg.feed_url,
        "Starting market mirror"
    );

    // --- Static reference data ---
    let registry = LocationRegistry::new(&cfg.disallowed_locations)
        .map_err(|unknown| AppError::Config(format!("DISALLOWED_LOCATIONS: unknown location(s) {unknown:?}")))?;
    let registry = Arc::new(registry);

    let catalog = match &cfg.item_catalog_path {
        Some(path) => ItemCatalog::load(path, cfg.trade.default_item_weight_kg).await?,
        None => {
            warn!("ITEM_CATALOG_PATH not set: sync jobs only cover items already seen on the feed, all weights default to {} kg", cfg.trade.default_item_weight_kg);
            ItemCatalog::empty(cfg.trade.default_item_weight_kg)
        }
    };
    let catalog = Arc::new(catalog);

    // --- Storage ---
    let store = OrderBookStore::open(&cfg.db_path).await?;

    // --- Shared state ---
    let health = Arc::new(HealthState::new());
    let latencies = Latencies::new();
    let lock = Arc::new(ApiLock::new());
    let sync_status = Arc::new(SyncStatusBoard::new());
    let client = FetchClient::new(cfg.retry.clone(), RateLimitGate::new(), Arc::clone(&latencies.fetch))?;
    let calculator = Arc::new(ArbitrageCalculator::new(
        Arc::clone(&registry),
        Arc::clone(&catalog),
        cfg.trade.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // --- Spawn tasks ---

    // Feed collector (hot path)
    let collector = FeedCollector::new(
        &cfg,
        store.clone(),
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&latencies.feed_write),
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(collector.run()));

    // Expired-order sweeper
    let sweeper = ExpirySweeper::new(store.clone(), cfg.expiry_sweep_interval, shutdown_rx.clone());
    tasks.push(tokio::spawn(sweeper.run()));

    // Sync jobs sharing one API lock
    let ctx = Arc::new(SyncContext::new(
        store.clone(),
        Arc::new(client),
        Arc::clone(&lock),
        Arc::clone(&sync_status),
        Arc::clone(&registry),
        Arc::clone(&catalog),
        cfg.api_base_url.clone(),
        cfg.max_url_length,
        cfg.history_retention_days,
    ));
    tasks.extend(SyncScheduler::new(&cfg, ctx).spawn(shutdown_rx.clone()));

    // History retention
    let purger = HistoryPurger::new(
        store.clone(),
        cfg.history_retention_days,
        cfg.purge_interval,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(purger.run()));

    // Periodic arbitrage scan
    let scanner = OpportunityScanner::new(
        store.clone(),
        Arc::clone(&calculator),
        cfg.scan_interval,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(scanner.run()));

    // HTTP API server
    let api_state = ApiState {
        store: store.clone(),
        registry,
        calculator,
        sync_status,
        lock,
        health,
        latencies,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {e}");
    }
    info!("Shutdown requested, stopping tasks");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally: {e}");
        }
    }
    match server.await {
        Ok(Err(e)) => error!("HTTP API error: {e}"),
        Err(e) => error!("HTTP API task ended abnormally: {e}"),
        Ok(Ok(())) => {}
    }

    store.close().await;
    info!("Shutdown complete");
    Ok(())
}
