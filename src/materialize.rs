//! WRITE -> READ materialization.
//!
//! Two idempotent sub-jobs: the latest projection rewrites the newest row
//! per (canonical symbol, exchange), and the historical backfill copies
//! aggregate buckets the READ store has not seen yet. There are no cross-DB
//! transactions; both jobs are safe to re-run from any point because every
//! write is an upsert keyed by the natural key and the backfill checkpoints
//! the last fully copied bucket.

use crate::models::LatestMarket;
use crate::normalize::{funding_views, normalize_symbol};
use crate::storage::{ReadStore, WriteStore};
use anyhow::Result;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Raw rows observed in this much trailing time feed the latest projection.
const LATEST_LOOKBACK_SECS: i64 = 600;

/// The backfill never reaches further back than this.
const BACKFILL_HORIZON_SECS: i64 = 30 * 86_400;

/// Per-invocation bucket budgets; whatever is left resumes next run from
/// the checkpoint.
const MINUTE_BUCKETS_PER_RUN: usize = 1_500;
const HOUR_BUCKETS_PER_RUN: usize = 120;

const MINUTE_CURSOR_KEY: &str = "backfill_minute_cursor";
const HOUR_CURSOR_KEY: &str = "backfill_hour_cursor";

pub struct Materializer {
    write: Arc<WriteStore>,
    read: Arc<ReadStore>,
}

impl Materializer {
    pub fn new(write: Arc<WriteStore>, read: Arc<ReadStore>) -> Self {
        Self { write, read }
    }

    /// Latest projection: newest raw row per (exchange, original symbol)
    /// from the trailing window, rewritten under the canonical key.
    pub fn run_latest_projection(&self, now: i64) -> Result<usize> {
        let ticks = self.write.latest_ticks_since(now - LATEST_LOOKBACK_SECS)?;
        let mut written = 0usize;

        for tick in &ticks {
            let raw_rate = match Decimal::from_str(&tick.funding_rate) {
                Ok(d) => d,
                Err(e) => {
                    warn!(
                        exchange = %tick.exchange,
                        symbol = %tick.symbol,
                        error = %e,
                        "skipping projection row with bad funding rate"
                    );
                    continue;
                }
            };
            let (raw, hourly, annual) = funding_views(&tick.exchange, raw_rate);

            let row = LatestMarket {
                symbol: normalize_symbol(&tick.symbol),
                exchange: tick.exchange.clone(),
                original_symbol: tick.symbol.clone(),
                mark_price: tick.mark_price.clone(),
                index_price: tick.index_price.clone(),
                open_interest_usd: tick.open_interest_usd.clone(),
                volume_24h: tick.volume_24h,
                funding_rate: raw.normalize().to_string(),
                funding_rate_hourly: hourly.normalize().to_string(),
                funding_rate_annual: annual,
                next_funding_time: tick.next_funding_time,
                price_change_24h: tick.price_change_24h,
                low_24h: tick.low_24h,
                high_24h: tick.high_24h,
                volatility_24h: None,
                volatility_7d: None,
                atr_14: None,
                bb_width: None,
                updated_at: now,
            };
            self.read.upsert_latest(&row)?;
            written += 1;
        }

        if written > 0 {
            info!(rows = written, "latest projection refreshed");
        }
        Ok(written)
    }

    /// Historical backfill: copy aggregate buckets newer than the READ
    /// store's frontier, whole buckets at a time, checkpointing after each.
    pub fn run_historical_backfill(&self, now: i64) -> Result<(usize, usize)> {
        let minute_rows = self.backfill_tier(false, now, MINUTE_BUCKETS_PER_RUN)?;
        let hour_rows = self.backfill_tier(true, now, HOUR_BUCKETS_PER_RUN)?;

        if minute_rows > 0 || hour_rows > 0 {
            info!(minute_rows, hour_rows, "historical backfill copied rows");
        }
        Ok((minute_rows, hour_rows))
    }

    fn backfill_tier(&self, hourly: bool, now: i64, bucket_budget: usize) -> Result<usize> {
        let cursor_key = if hourly { HOUR_CURSOR_KEY } else { MINUTE_CURSOR_KEY };

        let checkpoint = self
            .read
            .get_metadata(cursor_key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let frontier = self.read.newest_bucket(hourly)?.unwrap_or(0);
        let horizon = now - BACKFILL_HORIZON_SECS;

        let mut cursor = checkpoint.max(frontier).max(horizon);
        let mut copied = 0usize;

        let buckets = self
            .write
            .distinct_buckets_after(hourly, cursor, bucket_budget)?;

        for bucket in buckets {
            let rows = self.write.aggregates_in_bucket(hourly, bucket)?;
            copied += self.read.upsert_aggregates(hourly, &rows)?;
            cursor = bucket;
            self.read.set_metadata(cursor_key, &cursor.to_string())?;
        }

        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::fold_minute_buckets;
    use crate::models::RawTick;

    fn stores() -> (tempfile::TempDir, Arc<WriteStore>, Arc<ReadStore>) {
        let dir = tempfile::tempdir().unwrap();
        let write = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let read = Arc::new(
            ReadStore::open(dir.path().join("r.db").to_str().unwrap()).unwrap(),
        );
        (dir, write, read)
    }

    fn tick(exchange: &str, symbol: &str, created_at: i64, mark: &str, funding: &str) -> RawTick {
        let mut t = RawTick::new(exchange, symbol);
        t.mark_price = mark.to_string();
        t.funding_rate = funding.to_string();
        t.stamp(created_at * 1000);
        t
    }

    #[test]
    fn latest_projection_normalizes_and_keys_by_canonical_symbol() {
        let (_dir, write, read) = stores();
        let now = 1_700_000_000;

        write
            .insert_ticks(&[
                tick("apex", "BTCUSDT", now - 30, "50000", "0.0008"),
                tick("paradex", "BTC-USD-PERP", now - 30, "50010", "0.0008"),
                tick("hyperliquid", "hyna:BTC", now - 30, "50020", "0.0001"),
            ])
            .unwrap();

        let materializer = Materializer::new(write, read.clone());
        assert_eq!(materializer.run_latest_projection(now).unwrap(), 3);

        let rows = read.query_latest(None, Some("BTC"), 100).unwrap();
        assert_eq!(rows.len(), 3);

        let apex = rows.iter().find(|r| r.exchange == "apex").unwrap();
        assert_eq!(apex.original_symbol, "BTCUSDT");
        // apex pays 8-hourly: 0.0008 -> 0.0001/h -> 87.6 % APR.
        assert_eq!(apex.funding_rate_hourly, "0.0001");
        assert!((apex.funding_rate_annual - 87.6).abs() < 1e-9);

        let hl = rows.iter().find(|r| r.exchange == "hyperliquid").unwrap();
        // Per-hour-native venue: no rescale.
        assert_eq!(hl.funding_rate_hourly, "0.0001");
    }

    #[test]
    fn latest_projection_is_idempotent_except_updated_at() {
        let (_dir, write, read) = stores();
        let now = 1_700_000_000;

        write
            .insert_ticks(&[tick("gmx", "BTC-USD", now - 30, "50000", "0.0008")])
            .unwrap();

        let materializer = Materializer::new(write, read.clone());
        materializer.run_latest_projection(now).unwrap();
        let first = read.query_latest(None, None, 10).unwrap();

        materializer.run_latest_projection(now + 300).unwrap();
        let second = read.query_latest(None, None, 10).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        let (a, b) = (&first[0], &second[0]);
        assert_eq!(a.mark_price, b.mark_price);
        assert_eq!(a.funding_rate, b.funding_rate);
        assert_eq!(a.funding_rate_hourly, b.funding_rate_hourly);
        assert_eq!(a.symbol, b.symbol);
        assert_ne!(a.updated_at, b.updated_at);
    }

    #[test]
    fn backfill_copies_new_buckets_and_checkpoints() {
        let (_dir, write, read) = stores();
        let now = 1_700_000_000;
        let bucket0 = (now - 3_600) / 60 * 60;

        let minute_rows = fold_minute_buckets(
            &[
                tick("gmx", "BTC-USD", bucket0 + 5, "100", "0.0008"),
                tick("gmx", "BTC-USD", bucket0 + 65, "101", "0.0008"),
                tick("drift", "BTC", bucket0 + 5, "100", "0.0001"),
            ],
            now,
        );
        write.upsert_minute_aggregates(&minute_rows).unwrap();

        let materializer = Materializer::new(write.clone(), read.clone());
        let (copied, _) = materializer.run_historical_backfill(now).unwrap();
        assert_eq!(copied, 3);

        // Re-running copies nothing new.
        let (copied_again, _) = materializer.run_historical_backfill(now).unwrap();
        assert_eq!(copied_again, 0);

        let mirrored = read
            .query_aggregates(false, None, Some("BTC"), None, None, 100)
            .unwrap();
        assert_eq!(mirrored.len(), 3);
    }
}
