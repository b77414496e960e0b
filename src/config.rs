//! Runtime configuration.
//!
//! Everything is env-var driven with sane defaults; the handful of knobs an
//! operator flips most often are also exposed as CLI flags which win over
//! the environment.

use clap::Parser;
use std::env;
use std::path::{Path, PathBuf};

/// CLI overrides for the most common deployment knobs.
#[derive(Debug, Parser)]
#[command(name = "perptrack", about = "Multi-venue perp market-data tracker")]
pub struct CliArgs {
    /// WRITE store path (overrides WRITE_DB_PATH)
    #[arg(long)]
    pub write_db: Option<String>,

    /// READ store path (overrides READ_DB_PATH)
    #[arg(long)]
    pub read_db: Option<String>,

    /// HTTP listen port (overrides API_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Comma-separated venue allow-list (overrides ENABLED_VENUES)
    #[arg(long)]
    pub venues: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub write_db_path: String,
    pub read_db_path: String,
    pub api_port: u16,
    /// Default tracker snapshot cadence, ms. Polled venues with hourly
    /// funding use four times this.
    pub snapshot_interval_ms: u64,
    pub minute_agg_interval_ms: u64,
    pub hour_agg_interval_ms: u64,
    /// Raw rows survive this long past aggregation before cleanup.
    pub raw_retention_secs: i64,
    pub minute_retention_days: i64,
    pub hour_retention_days: i64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    /// `is_stable` iff stability score reaches this.
    pub stability_threshold: i64,
    pub http_timeout_secs: u64,
    /// Empty means every registered venue runs.
    pub enabled_venues: Vec<String>,
}

impl Config {
    pub fn from_env(cli: &CliArgs) -> Self {
        let write_db_path = resolve_data_path(
            cli.write_db
                .clone()
                .or_else(|| env::var("WRITE_DB_PATH").ok()),
            "perptrack_write.db",
        );
        let read_db_path = resolve_data_path(
            cli.read_db
                .clone()
                .or_else(|| env::var("READ_DB_PATH").ok()),
            "perptrack_read.db",
        );

        let api_port = cli
            .port
            .or_else(|| env::var("API_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(3001);

        let enabled_venues: Vec<String> = cli
            .venues
            .clone()
            .or_else(|| env::var("ENABLED_VENUES").ok())
            .map(|csv| {
                csv.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            write_db_path,
            read_db_path,
            api_port,
            snapshot_interval_ms: env_u64("SNAPSHOT_INTERVAL_MS", 15_000),
            minute_agg_interval_ms: env_u64("MINUTE_AGG_INTERVAL_MS", 300_000),
            hour_agg_interval_ms: env_u64("HOUR_AGG_INTERVAL_MS", 3_600_000),
            raw_retention_secs: env_i64("RAW_RETENTION_SECS", 300),
            minute_retention_days: env_i64("MINUTE_RETENTION_DAYS", 30),
            hour_retention_days: env_i64("HOUR_RETENTION_DAYS", 365),
            reconnect_delay_ms: env_u64("RECONNECT_DELAY_MS", 5_000),
            max_reconnect_attempts: env_u64("MAX_RECONNECT_ATTEMPTS", 10) as u32,
            stability_threshold: env_i64("STABILITY_THRESHOLD", 4),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECS", 10),
            enabled_venues,
        }
    }

    pub fn venue_enabled(&self, venue: &str) -> bool {
        self.enabled_venues.is_empty() || self.enabled_venues.iter().any(|v| v == venue)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::from_env(&CliArgs {
            write_db: None,
            read_db: None,
            port: None,
            venues: None,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// Relative DB paths are anchored at the crate directory, not the caller's
/// cwd, so running from elsewhere never creates a second empty database.
pub fn resolve_data_path(value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

/// Load `.env` from the cwd chain and the crate directory.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
