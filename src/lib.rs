//! ipwatch -- IP traffic anomaly detection and denylisting for web services.
//!
//! Requests are logged with their client address and geolocation; a
//! periodic job scans the recent window for abusive patterns, records
//! suspicion flags, and auto-blocks critical offenders.

pub mod api;
pub mod config;
pub mod denylist;
pub mod detect;
pub mod events;
pub mod geo;
pub mod housekeeping;
pub mod scheduler;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::config::IpWatchConfig;

/// Wire storage, denylist, geolocation and the detection engine together.
pub fn build_state(config: &IpWatchConfig) -> Result<AppState> {
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    let denylist = denylist::Denylist::with_capacity(
        pool.clone(),
        Duration::from_secs(config.denylist.cache_ttl_secs),
        config.denylist.cache_capacity,
    );
    let engine =
        detect::engine::AnomalyEngine::from_pool(pool.clone(), denylist.clone(), &config.detection);
    let geo = geo::GeoLocator::from_config(&config.geolocation)
        .context("Failed to build geolocation client")?;

    Ok(AppState {
        ledger: detect::flagger::SuspicionLedger::new(pool.clone()),
        scheduler: scheduler::Scheduler::new(pool.clone()),
        denylist,
        geo: Arc::new(geo),
        engine: Arc::new(engine),
        pool,
    })
}

/// Start the ipwatch daemon: API server with request tracking, plus the scheduler.
pub async fn serve(config: IpWatchConfig) -> Result<()> {
    let state = build_state(&config)?;

    // Scheduler engine (background task)
    state
        .scheduler
        .ensure_defaults(&scheduler::profiles::defaults(&config.schedules))?;
    let runner = Arc::new(scheduler::JobRunner::new(
        state.pool.clone(),
        state.engine.clone(),
        config.retention.days,
    ));
    let scheduler_engine = state.scheduler.clone();
    let poll = Duration::from_secs(config.schedules.poll_interval_secs.max(1));
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler_engine, runner, poll).await;
    });

    // API server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "ipwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
