//! perptrack - multi-venue perpetual-futures market-data tracker.
//!
//! Long-running service: one tracker task per venue, a cron-like scheduler
//! for roll-ups, materialization and analytics, and a read-only HTTP API.
//! Lifetime is managed externally; there are no exit codes of its own.

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use perptrack_backend::{
    adapters,
    aggregation::AggregationEngine,
    analytics::AnalyticsEngine,
    api::{self, AppState},
    config::{load_env, CliArgs, Config},
    materialize::Materializer,
    normalize::VENUE_IDS,
    scheduler::Scheduler,
    storage::{ReadStore, WriteStore},
    tracker::{Tracker, TrackerConfig},
};

/// Latest projection cadence (5 min).
const LATEST_PROJECTION_INTERVAL: Duration = Duration::from_secs(300);
/// Historical backfill and retention run daily.
const DAILY: Duration = Duration::from_secs(86_400);
/// Analytics cache rebuild cadence.
const ANALYTICS_INTERVAL: Duration = Duration::from_secs(3_600);

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let cli = CliArgs::parse();
    init_tracing();

    let cfg = Config::from_env(&cli);
    info!(
        write_db = %cfg.write_db_path,
        read_db = %cfg.read_db_path,
        port = cfg.api_port,
        "perptrack starting"
    );

    let write = Arc::new(WriteStore::open(&cfg.write_db_path)?);
    let read = Arc::new(ReadStore::open(&cfg.read_db_path)?);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.http_timeout_secs))
        .user_agent("perptrack/0.1")
        .build()
        .context("Failed to build HTTP client")?;

    // One tracker task per enabled venue.
    let tracker_config = TrackerConfig {
        reconnect_delay: Duration::from_millis(cfg.reconnect_delay_ms),
        max_reconnect_attempts: cfg.max_reconnect_attempts,
        snapshot_interval: Duration::from_millis(cfg.snapshot_interval_ms),
    };
    let mut trackers = HashMap::new();
    for venue in VENUE_IDS {
        if !cfg.venue_enabled(venue) {
            continue;
        }
        let Some(adapter) = adapters::build_adapter(venue, http.clone()) else {
            warn!(venue, "no adapter registered; skipping");
            continue;
        };
        let handle = Tracker::spawn(
            adapter,
            write.clone(),
            read.clone(),
            tracker_config.clone(),
        );
        trackers.insert(venue.to_string(), handle);
    }
    info!(count = trackers.len(), "venue trackers started");

    // Periodic jobs. Aggregation and retention own the WRITE store; the
    // materializer is the only WRITE -> READ bridge; analytics stays READ.
    let engine = Arc::new(AggregationEngine::new(
        write.clone(),
        cfg.raw_retention_secs,
        cfg.minute_retention_days,
        cfg.hour_retention_days,
    ));
    let materializer = Arc::new(Materializer::new(write.clone(), read.clone()));
    let analytics = Arc::new(AnalyticsEngine::new(read.clone(), cfg.stability_threshold));

    let mut scheduler = Scheduler::new();

    {
        let engine = engine.clone();
        scheduler.spawn_job(
            "minute-rollup",
            Duration::from_millis(cfg.minute_agg_interval_ms),
            move || {
                let engine = engine.clone();
                async move {
                    engine.run_minute_rollup(chrono::Utc::now().timestamp())?;
                    Ok(())
                }
            },
        );
    }
    {
        let engine = engine.clone();
        scheduler.spawn_job(
            "hour-rollup",
            Duration::from_millis(cfg.hour_agg_interval_ms),
            move || {
                let engine = engine.clone();
                async move {
                    engine.run_hour_rollup(chrono::Utc::now().timestamp())?;
                    Ok(())
                }
            },
        );
    }
    {
        let engine = engine.clone();
        scheduler.spawn_job("retention", DAILY, move || {
            let engine = engine.clone();
            async move {
                engine.run_retention(chrono::Utc::now().timestamp())?;
                Ok(())
            }
        });
    }
    {
        let materializer = materializer.clone();
        scheduler.spawn_job("latest-projection", LATEST_PROJECTION_INTERVAL, move || {
            let materializer = materializer.clone();
            async move {
                materializer.run_latest_projection(chrono::Utc::now().timestamp())?;
                Ok(())
            }
        });
    }
    {
        let materializer = materializer.clone();
        scheduler.spawn_job("historical-backfill", DAILY, move || {
            let materializer = materializer.clone();
            async move {
                materializer.run_historical_backfill(chrono::Utc::now().timestamp())?;
                Ok(())
            }
        });
    }
    {
        let analytics = analytics.clone();
        scheduler.spawn_job("analytics", ANALYTICS_INTERVAL, move || {
            let analytics = analytics.clone();
            async move { analytics.run(chrono::Utc::now().timestamp()) }
        });
    }
    {
        let write = write.clone();
        let read = read.clone();
        scheduler.spawn_job("store-maintenance", DAILY, move || {
            let write = write.clone();
            let read = read.clone();
            async move {
                write.optimize()?;
                read.optimize()?;
                Ok(())
            }
        });
    }
    info!(jobs = scheduler.job_count(), "scheduler jobs registered");

    let state = AppState {
        read,
        write,
        trackers: Arc::new(trackers),
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "perptrack_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
