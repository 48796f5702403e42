//! pingwatch - scheduled connectivity monitor.
//!
//! Pings every server in the inventory on an interval, records its status
//! with the status service and opens an incident for each one that is down.

mod config;
mod db;
mod monitor;
mod probe;
mod report;
mod scheduler;
mod web;

use config::MonitorConfig;
use db::{InventorySource, Store};
use monitor::{Reconciler, RunSettings};
use probe::PingProber;
use report::ApiReporter;
use scheduler::{RunRecord, Scheduler};
use web::Server;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!(
        db_path = %cfg.db_path,
        entity_type = cfg.entity_type,
        status_api_url = cfg.status_api_url.as_deref().unwrap_or("<unset>"),
        incident_api_url = cfg.incident_api_url.as_deref().unwrap_or("<unset>"),
        probe_timeout_ms = cfg.probe_timeout.as_millis() as u64,
        run_interval_secs = cfg.run_interval.as_secs(),
        "Starting pingwatch"
    );

    // Open the inventory
    let store = Store::new(&cfg.db_path)?;
    tracing::info!(rows = store.count_entities()?, "Inventory opened");

    let reporter = Arc::new(ApiReporter::from_config(&cfg)?);
    let reconciler = Reconciler::new(
        Arc::new(InventorySource::new(store, cfg.entity_type)),
        Arc::new(PingProber::detect()),
        reporter.clone(),
        reporter,
        RunSettings::from_config(&cfg),
    );
    let scheduler = Arc::new(Scheduler::new(Arc::new(reconciler), cfg.run_interval));

    if cfg.run_once {
        return match scheduler.run_once().await {
            Some(RunRecord::Failed { error, .. }) => Err(error.into()),
            _ => Ok(()),
        };
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_tx.subscribe()));

    let server_task = if cfg.http_port != 0 {
        let server = Server::new(cfg.http_port, scheduler.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { server.start(shutdown_rx).await }))
    } else {
        tracing::info!("HTTP surface disabled");
        None
    };

    let server_done = async {
        match server_task {
            Some(task) => task.await.map_err(BoxError::from).and_then(|res| res),
            None => std::future::pending::<Result<(), BoxError>>().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutdown requested");
        }
        res = server_done => {
            res?;
        }
    }

    let _ = shutdown_tx.send(());
    scheduler_task.await?;

    Ok(())
}
