//! # fleet-collector
//!
//! Collector service for asynchronous host processing.
//!
//! The service runs one collector per enabled task kind against a shared
//! ephemeral store and datastore. Agents' check-in results are buffered by the
//! write API and applied here in batches.
//!
//! ## Modes
//!
//! - **Service Mode**: Runs every enabled collector with HTTP endpoints
//! - **CLI Mode**: One collection pass of a single kind, printing its stats
//!
//! ## Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /stats` - Per-collector state and run statistics
//! - `GET /metrics` - Prometheus exposition
//!
//! ## Usage
//!
//! ```bash
//! # Run as service, with simulated agents
//! FLEET_ASYNC_LABEL_MEMBERSHIP_ENABLED=true fleet-collector serve --simulate-hosts 500
//!
//! # One pass of the policy collector
//! fleet-collector run-once --kind policy_membership --simulate-hosts 20
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod metrics;
mod simulate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use fleet_async::{Collector, CollectorState, CollectorStats, ErrorHook, RunResult, Task};
use fleet_core::{
    AsyncConfig, Datastore, EphemeralStore, LogFormat, MemoryDatastore, MemoryEphemeralStore,
    TaskKind, init_logging,
};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Fleet async host processing collector.
#[derive(Debug, Parser)]
#[command(name = "fleet-collector")]
#[command(about = "Drains buffered host results into the durable store")]
#[command(version)]
struct Args {
    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "FLEET_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled collector with HTTP endpoints.
    Serve {
        /// HTTP port for health, stats and metrics.
        #[arg(long, env = "FLEET_COLLECTOR_PORT", default_value = "8082")]
        port: u16,

        /// Number of simulated hosts reporting results (0 disables simulation).
        #[arg(long, env = "FLEET_SIMULATE_HOSTS", default_value = "0")]
        simulate_hosts: u64,

        /// Interval between simulated check-in rounds, in milliseconds.
        #[arg(long, env = "FLEET_SIMULATE_INTERVAL_MS", default_value = "1000")]
        simulate_interval_ms: u64,
    },

    /// Run a single collection pass of one task kind.
    RunOnce {
        /// Task kind to collect (e.g. `label_membership`).
        #[arg(long)]
        kind: String,

        /// Number of simulated hosts reporting once before the pass.
        #[arg(long, default_value = "0")]
        simulate_hosts: u64,
    },
}

// ============================================================================
// Service State
// ============================================================================

/// Shared state of the HTTP endpoints.
#[derive(Clone)]
struct AppState {
    collectors: Arc<Vec<Arc<Collector>>>,
}

/// A collector's state and statistics as served by `/stats`.
#[derive(Debug, Serialize)]
struct CollectorView {
    state: CollectorState,
    #[serde(flatten)]
    stats: CollectorStats,
}

impl CollectorView {
    fn of(collector: &Collector) -> Self {
        Self {
            state: collector.state(),
            stats: collector.stats(),
        }
    }
}

/// In-memory stores shared by the write API and the collectors.
struct Stores {
    store: Arc<dyn EphemeralStore>,
    datastore: Arc<dyn Datastore>,
}

impl Stores {
    fn in_memory() -> Result<Self> {
        let datastore = MemoryDatastore::new();
        simulate::register_queries(&datastore)?;
        Ok(Self {
            store: Arc::new(MemoryEphemeralStore::new()),
            datastore: Arc::new(datastore),
        })
    }
}

fn error_hook() -> ErrorHook {
    Arc::new(|kind: TaskKind, err: &fleet_async::Error| {
        tracing::warn!(
            %kind,
            error = %err,
            transient = err.is_transient(),
            "collection failed, retrying next interval"
        );
    })
}

// ============================================================================
// HTTP Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn stats(State(state): State<AppState>) -> Json<Vec<CollectorView>> {
    Json(
        state
            .collectors
            .iter()
            .map(|collector| CollectorView::of(collector))
            .collect(),
    )
}

// ============================================================================
// Background Loops
// ============================================================================

/// Flushes check-ins buffered in process while host last-seen is synchronous.
async fn run_seen_flush_loop(task: Arc<Task>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        if let Err(err) = task.flush_hosts_last_seen(Utc::now()).await {
            tracing::warn!(error = %err, "host last-seen flush failed");
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("shutdown signal received"),
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
                shutdown.cancelled().await;
            }
        },
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

// ============================================================================
// Commands
// ============================================================================

async fn serve(port: u16, simulate_hosts: u64, simulate_interval: Duration) -> Result<()> {
    metrics::init_metrics()?;

    let config = Arc::new(AsyncConfig::from_env()?);
    let stores = Stores::in_memory()?;
    let task = Arc::new(Task::new(
        Arc::clone(&stores.store),
        Arc::clone(&stores.datastore),
        Arc::clone(&config),
    )?);
    let shutdown = CancellationToken::new();

    let mut collectors = Vec::new();
    let mut handles = Vec::new();
    for kind in TaskKind::ALL {
        if !config.task(kind).enabled {
            tracing::info!(%kind, "async processing disabled, writing through");
            continue;
        }
        let collector = Arc::new(
            Collector::new(
                kind,
                Arc::clone(&stores.store),
                Arc::clone(&stores.datastore),
                Arc::clone(&config),
            )?
            .with_error_hook(error_hook()),
        );
        handles.push(Arc::clone(&collector).spawn(shutdown.clone()));
        collectors.push(collector);
    }

    let mut background = Vec::new();
    if !config.host_last_seen.enabled {
        background.push(tokio::spawn(run_seen_flush_loop(
            Arc::clone(&task),
            config.host_last_seen.collect_interval,
            shutdown.clone(),
        )));
    }
    if simulate_hosts > 0 {
        background.push(tokio::spawn(simulate::run(
            Arc::clone(&task),
            simulate_hosts,
            simulate_interval,
            shutdown.clone(),
        )));
    }

    tracing::info!(
        port,
        collectors = collectors.len(),
        simulate_hosts,
        "Starting collector service"
    );

    let router = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(AppState {
            collectors: Arc::new(collectors),
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for handle in handles {
        handle.join().await?;
    }
    for handle in background {
        handle.await?;
    }
    if !config.host_last_seen.enabled {
        task.flush_hosts_last_seen(Utc::now()).await?;
    }

    tracing::info!("collector service stopped");
    Ok(())
}

async fn run_once(kind: &str, simulate_hosts: u64) -> Result<()> {
    let kind: TaskKind = kind.parse()?;
    let mut config = AsyncConfig::from_env()?;
    config.task_mut(kind).enabled = true;
    let config = Arc::new(config);

    let stores = Stores::in_memory()?;
    if simulate_hosts > 0 {
        let task = Task::new(
            Arc::clone(&stores.store),
            Arc::clone(&stores.datastore),
            Arc::clone(&config),
        )?;
        let now = Utc::now();
        simulate::report(&task, simulate::generate(simulate_hosts, now), now).await?;
    }

    let collector = Collector::new(kind, stores.store, stores.datastore, config)?;
    let result = collector.run_once().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&CollectorView::of(&collector))?
    );

    match result {
        RunResult::Failed { error, .. } => Err(error.into()),
        RunResult::LockDenied | RunResult::Completed(_) => Ok(()),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let format: LogFormat = args.log_format.parse()?;
    init_logging(format);

    match args.command {
        Commands::Serve {
            port,
            simulate_hosts,
            simulate_interval_ms,
        } => serve(port, simulate_hosts, Duration::from_millis(simulate_interval_ms)).await,
        Commands::RunOnce {
            ref kind,
            simulate_hosts,
        } => run_once(kind, simulate_hosts).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_run_once() {
        let args = Args::try_parse_from([
            "fleet-collector",
            "--log-format",
            "json",
            "run-once",
            "--kind",
            "label_membership",
        ])
        .expect("parse");
        assert_eq!(args.log_format, "json");
        assert!(matches!(
            args.command,
            Commands::RunOnce { ref kind, simulate_hosts: 0 } if kind == "label_membership"
        ));
    }

    #[tokio::test]
    async fn stats_lists_every_collector() {
        let stores = Stores::in_memory().expect("stores");
        let config = Arc::new(AsyncConfig::all_enabled());
        let collectors: Vec<Arc<Collector>> = TaskKind::ALL
            .into_iter()
            .map(|kind| {
                Arc::new(
                    Collector::new(
                        kind,
                        Arc::clone(&stores.store),
                        Arc::clone(&stores.datastore),
                        Arc::clone(&config),
                    )
                    .expect("collector"),
                )
            })
            .collect();
        collectors[0].run_once().await;

        let Json(views) = stats(State(AppState {
            collectors: Arc::new(collectors),
        }))
        .await;

        assert_eq!(views.len(), 4);
        assert_eq!(views[0].stats.kind, TaskKind::LabelMembership);
        assert_eq!(views[0].stats.executions, 1);
        assert!(views.iter().all(|view| view.state == CollectorState::Idle));

        let json = serde_json::to_value(&views[0]).expect("json");
        assert_eq!(json["state"], "idle");
        assert_eq!(json["kind"], "label_membership");
    }

    #[tokio::test]
    async fn run_once_collects_simulated_hosts() {
        run_once("policy_membership", 10).await.expect("run once");
    }
}
