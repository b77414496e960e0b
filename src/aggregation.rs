//! Tiered roll-up over the WRITE store.
//!
//! Three jobs: raw ticks fold into minute buckets (then the consumed raws
//! are deleted), minute buckets fold into hour buckets, and a daily
//! retention pass trims aged aggregates. Buckets are half-open `[b, b+w)`;
//! only buckets that closed before the retention horizon are touched, so a
//! late tick can never corrupt a finished bucket.

use crate::models::{Aggregate, RawTick};
use crate::normalize::{annualize_hourly, hourly_funding_rate, normalize_symbol};
use crate::storage::WriteStore;
use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;

/// Upper bound on one-hour windows drained per minute-aggregation run; a
/// cold-start backlog catches up over several invocations instead of one
/// giant scan.
const MAX_WINDOWS_PER_RUN: usize = 20;

/// How many already-complete hours get re-folded each run so minute rows
/// that landed after the previous fold are absorbed.
const HOUR_REFOLD_LOOKBACK: i64 = 2;

const HOUR_CURSOR_KEY: &str = "hour_agg_last_bucket";

#[derive(Debug, Default, Clone)]
pub struct MinuteRollupReport {
    pub windows: usize,
    pub rows_written: usize,
    pub ticks_consumed: usize,
    pub ticks_deleted: usize,
}

#[derive(Debug, Default, Clone)]
pub struct HourRollupReport {
    pub buckets: usize,
    pub rows_written: usize,
}

pub struct AggregationEngine {
    store: Arc<WriteStore>,
    raw_retention_secs: i64,
    minute_retention_days: i64,
    hour_retention_days: i64,
}

impl AggregationEngine {
    pub fn new(
        store: Arc<WriteStore>,
        raw_retention_secs: i64,
        minute_retention_days: i64,
        hour_retention_days: i64,
    ) -> Self {
        Self {
            store,
            raw_retention_secs,
            minute_retention_days,
            hour_retention_days,
        }
    }

    /// Raw -> minute. Processes complete minute buckets older than the raw
    /// retention horizon, oldest first, at most `MAX_WINDOWS_PER_RUN` hour
    /// windows, and deletes each window's raws once its rows are upserted.
    pub fn run_minute_rollup(&self, now: i64) -> Result<MinuteRollupReport> {
        let mut report = MinuteRollupReport::default();

        // Minute-aligned frontier: every bucket strictly below it has closed
        // at least `raw_retention_secs` ago.
        let frontier = ((now - self.raw_retention_secs) / MINUTE) * MINUTE;

        let Some(oldest) = self.store.oldest_raw_created_at(frontier - 1)? else {
            return Ok(report);
        };

        let mut window_start = (oldest / HOUR) * HOUR;
        while window_start < frontier && report.windows < MAX_WINDOWS_PER_RUN {
            let window_end = (window_start + HOUR).min(frontier);

            let ticks = self.store.ticks_in_range(window_start, window_end)?;
            if !ticks.is_empty() {
                let rows = fold_minute_buckets(&ticks, now);
                report.ticks_consumed += ticks.len();
                report.rows_written += self.store.upsert_minute_aggregates(&rows)?;
            }

            report.ticks_deleted += self
                .store
                .delete_ticks_in_range(window_start, window_end)?;
            report.windows += 1;
            window_start += HOUR;
        }

        if report.rows_written > 0 {
            info!(
                windows = report.windows,
                rows = report.rows_written,
                consumed = report.ticks_consumed,
                "minute rollup complete"
            );
        }
        Ok(report)
    }

    /// Minute -> hour. Advances a metadata cursor over complete hour
    /// buckets; the trailing `HOUR_REFOLD_LOOKBACK` hours are re-folded each
    /// run because their upserts are idempotent.
    pub fn run_hour_rollup(&self, now: i64) -> Result<HourRollupReport> {
        let mut report = HourRollupReport::default();
        let complete_end = (now / HOUR) * HOUR;

        let cursor = self
            .store
            .get_metadata(HOUR_CURSOR_KEY)?
            .and_then(|v| v.parse::<i64>().ok());

        let mut start = match cursor {
            Some(c) => (c - HOUR * (HOUR_REFOLD_LOOKBACK - 1)).max(0),
            None => {
                let rows = self.store.minute_aggs_in_range(0, complete_end)?;
                match rows.first() {
                    Some(first) => (first.bucket_ts / HOUR) * HOUR,
                    None => return Ok(report),
                }
            }
        };

        while start + HOUR <= complete_end {
            let minute_rows = self.store.minute_aggs_in_range(start, start + HOUR)?;
            if !minute_rows.is_empty() {
                let rows = fold_hour_buckets(&minute_rows, now);
                report.rows_written += self.store.upsert_hour_aggregates(&rows)?;
            }
            report.buckets += 1;
            start += HOUR;
        }

        if report.buckets > 0 {
            let last_folded = complete_end - HOUR;
            self.store
                .set_metadata(HOUR_CURSOR_KEY, &last_folded.to_string())?;
        }

        if report.rows_written > 0 {
            info!(
                buckets = report.buckets,
                rows = report.rows_written,
                "hour rollup complete"
            );
        }
        Ok(report)
    }

    /// Daily retention: drop minute aggregates older than N days, hour
    /// aggregates older than M days. Runs after the roll-ups so a bucket
    /// still being aggregated is never in range.
    pub fn run_retention(&self, now: i64) -> Result<(usize, usize)> {
        let minute_cutoff = now - self.minute_retention_days * 86_400;
        let hour_cutoff = now - self.hour_retention_days * 86_400;

        let minutes = self.store.delete_minute_before(minute_cutoff)?;
        let hours = self.store.delete_hour_before(hour_cutoff)?;

        if minutes > 0 || hours > 0 {
            info!(minutes, hours, "retention pass deleted aged aggregates");
        }
        Ok((minutes, hours))
    }
}

/// Group raw ticks by (exchange, symbol, minute bucket) and fold each group.
/// Empty groups produce nothing; a zero-count row is never written.
pub fn fold_minute_buckets(ticks: &[RawTick], rollup_time: i64) -> Vec<Aggregate> {
    let mut groups: BTreeMap<(String, String, i64), Vec<&RawTick>> = BTreeMap::new();
    for tick in ticks {
        let bucket = (tick.created_at / MINUTE) * MINUTE;
        groups
            .entry((tick.exchange.clone(), tick.symbol.clone(), bucket))
            .or_default()
            .push(tick);
    }

    groups
        .into_iter()
        .filter_map(|((exchange, symbol, bucket), members)| {
            fold_minute_group(&exchange, &symbol, bucket, &members, rollup_time)
        })
        .collect()
}

fn fold_minute_group(
    exchange: &str,
    symbol: &str,
    bucket_ts: i64,
    members: &[&RawTick],
    rollup_time: i64,
) -> Option<Aggregate> {
    if members.is_empty() {
        return None;
    }
    let n = Decimal::from(members.len());

    let mut sum_mark = Decimal::ZERO;
    let mut sum_index = Decimal::ZERO;
    let mut min_price: Option<Decimal> = None;
    let mut max_price: Option<Decimal> = None;
    let mut sum_oi = Decimal::ZERO;
    let mut max_oi = Decimal::ZERO;
    let mut sum_oi_usd = Decimal::ZERO;
    let mut max_oi_usd = Decimal::ZERO;
    let mut sum_funding = Decimal::ZERO;
    let mut min_funding: Option<Decimal> = None;
    let mut max_funding: Option<Decimal> = None;
    let mut volume = 0.0;
    let mut quote_volume = 0.0;

    for tick in members {
        let mark = parse_or_zero(&tick.mark_price);
        let index = parse_or_zero(&tick.index_price);
        let oi = parse_or_zero(&tick.open_interest);
        let oi_usd = parse_or_zero(&tick.open_interest_usd);
        let funding = parse_or_zero(&tick.funding_rate);

        sum_mark += mark;
        sum_index += index;
        min_price = Some(min_price.map_or(mark, |m| m.min(mark)));
        max_price = Some(max_price.map_or(mark, |m| m.max(mark)));
        sum_oi += oi;
        max_oi = max_oi.max(oi);
        sum_oi_usd += oi_usd;
        max_oi_usd = max_oi_usd.max(oi_usd);
        sum_funding += funding;
        min_funding = Some(min_funding.map_or(funding, |m| m.min(funding)));
        max_funding = Some(max_funding.map_or(funding, |m| m.max(funding)));
        volume += tick.volume_24h;
        quote_volume += tick.quote_volume_24h;
    }

    let avg_mark = sum_mark / n;
    let avg_index = sum_index / n;
    let min_price = min_price.unwrap_or(Decimal::ZERO);
    let max_price = max_price.unwrap_or(Decimal::ZERO);
    let avg_funding = sum_funding / n;

    let price_volatility = if avg_mark.is_zero() {
        0.0
    } else {
        ((max_price - min_price) / avg_mark * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0)
    };

    let annual = annualize_hourly(hourly_funding_rate(exchange, avg_funding));

    Some(Aggregate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        bucket_ts,
        avg_mark_price: avg_mark.normalize().to_string(),
        avg_index_price: avg_index.normalize().to_string(),
        min_price: min_price.normalize().to_string(),
        max_price: max_price.normalize().to_string(),
        price_volatility,
        volume,
        quote_volume,
        avg_open_interest: (sum_oi / n).normalize().to_string(),
        max_open_interest: max_oi.normalize().to_string(),
        avg_open_interest_usd: (sum_oi_usd / n).normalize().to_string(),
        max_open_interest_usd: max_oi_usd.normalize().to_string(),
        avg_funding_rate: avg_funding.normalize().to_string(),
        min_funding_rate: min_funding.unwrap_or(Decimal::ZERO).normalize().to_string(),
        max_funding_rate: max_funding.unwrap_or(Decimal::ZERO).normalize().to_string(),
        avg_funding_rate_annual: annual,
        sample_count: members.len() as i64,
        normalized_symbol: normalize_symbol(symbol),
        created_at: rollup_time,
    })
}

/// Fold minute rows into hour buckets. Price and funding means are weighted
/// by `sample_count`; volumes sum; min/max are min/max over members.
pub fn fold_hour_buckets(minute_rows: &[Aggregate], rollup_time: i64) -> Vec<Aggregate> {
    let mut groups: BTreeMap<(String, String, i64), Vec<&Aggregate>> = BTreeMap::new();
    for row in minute_rows {
        let bucket = (row.bucket_ts / HOUR) * HOUR;
        groups
            .entry((row.exchange.clone(), row.symbol.clone(), bucket))
            .or_default()
            .push(row);
    }

    groups
        .into_iter()
        .filter_map(|((exchange, symbol, bucket), members)| {
            fold_hour_group(&exchange, &symbol, bucket, &members, rollup_time)
        })
        .collect()
}

fn fold_hour_group(
    exchange: &str,
    symbol: &str,
    bucket_ts: i64,
    members: &[&Aggregate],
    rollup_time: i64,
) -> Option<Aggregate> {
    let total_samples: i64 = members.iter().map(|m| m.sample_count.max(0)).sum();
    if total_samples <= 0 {
        return None;
    }
    let weight_total = Decimal::from(total_samples);

    let mut sum_mark = Decimal::ZERO;
    let mut sum_index = Decimal::ZERO;
    let mut sum_oi = Decimal::ZERO;
    let mut sum_oi_usd = Decimal::ZERO;
    let mut sum_funding = Decimal::ZERO;
    let mut min_price: Option<Decimal> = None;
    let mut max_price: Option<Decimal> = None;
    let mut max_oi = Decimal::ZERO;
    let mut max_oi_usd = Decimal::ZERO;
    let mut min_funding: Option<Decimal> = None;
    let mut max_funding: Option<Decimal> = None;
    let mut volume = 0.0;
    let mut quote_volume = 0.0;

    for m in members {
        let w = Decimal::from(m.sample_count.max(0));
        sum_mark += parse_or_zero(&m.avg_mark_price) * w;
        sum_index += parse_or_zero(&m.avg_index_price) * w;
        sum_oi += parse_or_zero(&m.avg_open_interest) * w;
        sum_oi_usd += parse_or_zero(&m.avg_open_interest_usd) * w;
        sum_funding += parse_or_zero(&m.avg_funding_rate) * w;

        let lo = parse_or_zero(&m.min_price);
        let hi = parse_or_zero(&m.max_price);
        min_price = Some(min_price.map_or(lo, |v| v.min(lo)));
        max_price = Some(max_price.map_or(hi, |v| v.max(hi)));

        max_oi = max_oi.max(parse_or_zero(&m.max_open_interest));
        max_oi_usd = max_oi_usd.max(parse_or_zero(&m.max_open_interest_usd));

        let f_lo = parse_or_zero(&m.min_funding_rate);
        let f_hi = parse_or_zero(&m.max_funding_rate);
        min_funding = Some(min_funding.map_or(f_lo, |v| v.min(f_lo)));
        max_funding = Some(max_funding.map_or(f_hi, |v| v.max(f_hi)));

        volume += m.volume;
        quote_volume += m.quote_volume;
    }

    let avg_mark = sum_mark / weight_total;
    let avg_index = sum_index / weight_total;
    let avg_funding = sum_funding / weight_total;
    let min_price = min_price.unwrap_or(Decimal::ZERO);
    let max_price = max_price.unwrap_or(Decimal::ZERO);

    let price_volatility = if avg_mark.is_zero() {
        0.0
    } else {
        ((max_price - min_price) / avg_mark * Decimal::from(100))
            .to_f64()
            .unwrap_or(0.0)
    };

    let annual = annualize_hourly(hourly_funding_rate(exchange, avg_funding));

    Some(Aggregate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        bucket_ts,
        avg_mark_price: avg_mark.normalize().to_string(),
        avg_index_price: avg_index.normalize().to_string(),
        min_price: min_price.normalize().to_string(),
        max_price: max_price.normalize().to_string(),
        price_volatility,
        volume,
        quote_volume,
        avg_open_interest: (sum_oi / weight_total).normalize().to_string(),
        max_open_interest: max_oi.normalize().to_string(),
        avg_open_interest_usd: (sum_oi_usd / weight_total).normalize().to_string(),
        max_open_interest_usd: max_oi_usd.normalize().to_string(),
        avg_funding_rate: avg_funding.normalize().to_string(),
        min_funding_rate: min_funding.unwrap_or(Decimal::ZERO).normalize().to_string(),
        max_funding_rate: max_funding.unwrap_or(Decimal::ZERO).normalize().to_string(),
        avg_funding_rate_annual: annual,
        sample_count: total_samples,
        normalized_symbol: normalize_symbol(symbol),
        created_at: rollup_time,
    })
}

fn parse_or_zero(s: &str) -> Decimal {
    match Decimal::from_str(s) {
        Ok(d) => d,
        Err(_) => {
            debug!("non-decimal value {:?} treated as zero", s);
            Decimal::ZERO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(exchange: &str, symbol: &str, created_at: i64, mark: &str, funding: &str) -> RawTick {
        let mut t = RawTick::new(exchange, symbol);
        t.mark_price = mark.to_string();
        t.index_price = mark.to_string();
        t.funding_rate = funding.to_string();
        t.stamp(created_at * 1000);
        t
    }

    #[test]
    fn one_minute_of_ticks_yields_one_bucket() {
        // Prices 100, 101, 99, 102 within [600, 660).
        let ticks = vec![
            tick("gmx", "BTC-USD", 600, "100", "0.0001"),
            tick("gmx", "BTC-USD", 615, "101", "0.0001"),
            tick("gmx", "BTC-USD", 630, "99", "0.0001"),
            tick("gmx", "BTC-USD", 659, "102", "0.0001"),
        ];
        let rows = fold_minute_buckets(&ticks, 1000);
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.bucket_ts, 600);
        assert_eq!(row.sample_count, 4);
        assert_eq!(row.avg_mark_price, "100.5");
        assert_eq!(row.min_price, "99");
        assert_eq!(row.max_price, "102");
        assert!((row.price_volatility - 2.9851).abs() < 1e-3);
        assert_eq!(row.normalized_symbol, "BTC");
    }

    #[test]
    fn bucket_boundary_is_half_open() {
        let ticks = vec![
            tick("gmx", "BTC-USD", 659, "100", "0"),
            tick("gmx", "BTC-USD", 660, "101", "0"),
        ];
        let rows = fold_minute_buckets(&ticks, 1000);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bucket_ts, 600);
        assert_eq!(rows[1].bucket_ts, 660);
        assert_eq!(rows[0].sample_count, 1);
        assert_eq!(rows[1].sample_count, 1);
    }

    #[test]
    fn min_avg_max_ordering_holds() {
        let ticks = vec![
            tick("apex", "ETHUSDT", 0, "2990.5", "0.00012"),
            tick("apex", "ETHUSDT", 10, "3010.25", "0.00008"),
            tick("apex", "ETHUSDT", 20, "3000", "0.0001"),
        ];
        let rows = fold_minute_buckets(&ticks, 100);
        let row = &rows[0];
        let min: f64 = row.min_price.parse().unwrap();
        let avg: f64 = row.avg_mark_price.parse().unwrap();
        let max: f64 = row.max_price.parse().unwrap();
        assert!(min <= avg && avg <= max);
        assert_eq!(row.min_funding_rate, "0.00008");
        assert_eq!(row.max_funding_rate, "0.00012");
        assert_eq!(row.avg_funding_rate, "0.0001");
    }

    #[test]
    fn annualization_uses_venue_interval_at_rollup() {
        // gmx pays every 8 h: 0.0008 raw -> 0.0001 hourly -> 87.6 % APR.
        let ticks = vec![tick("gmx", "BTC-USD", 0, "50000", "0.0008")];
        let rows = fold_minute_buckets(&ticks, 100);
        assert!((rows[0].avg_funding_rate_annual - 87.6).abs() < 1e-9);

        // hyperliquid already reports per-hour.
        let ticks = vec![tick("hyperliquid", "BTC", 0, "50000", "0.0001")];
        let rows = fold_minute_buckets(&ticks, 100);
        assert!((rows[0].avg_funding_rate_annual - 87.6).abs() < 1e-9);
    }

    #[test]
    fn hour_fold_weights_by_sample_count() {
        let minute_rows = fold_minute_buckets(
            &[
                // Bucket 0: 3 samples at 100.
                tick("gmx", "BTC-USD", 0, "100", "0.0008"),
                tick("gmx", "BTC-USD", 20, "100", "0.0008"),
                tick("gmx", "BTC-USD", 40, "100", "0.0008"),
                // Bucket 60: 1 sample at 104.
                tick("gmx", "BTC-USD", 60, "104", "0.0008"),
            ],
            200,
        );
        assert_eq!(minute_rows.len(), 2);

        let hour_rows = fold_hour_buckets(&minute_rows, 200);
        assert_eq!(hour_rows.len(), 1);
        let row = &hour_rows[0];
        // Weighted mean: (100*3 + 104*1) / 4 = 101.
        assert_eq!(row.avg_mark_price, "101");
        assert_eq!(row.sample_count, 4);
        assert_eq!(row.min_price, "100");
        assert_eq!(row.max_price, "104");
    }

    #[test]
    fn engine_consumes_and_deletes_raws() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let engine = AggregationEngine::new(store.clone(), 300, 30, 365);

        let base = 1_700_000_000 / 60 * 60;
        store
            .insert_ticks(&[
                tick("gmx", "BTC-USD", base, "100", "0.0008"),
                tick("gmx", "BTC-USD", base + 10, "101", "0.0008"),
                tick("gmx", "BTC-USD", base + 30, "99", "0.0008"),
                tick("gmx", "BTC-USD", base + 50, "102", "0.0008"),
            ])
            .unwrap();

        // Run with "now" far enough that the bucket has closed past the
        // retention horizon.
        let report = engine.run_minute_rollup(base + 400).unwrap();
        assert_eq!(report.rows_written, 1);
        assert_eq!(report.ticks_consumed, 4);
        assert_eq!(report.ticks_deleted, 4);
        assert_eq!(store.raw_count().unwrap(), 0);

        let rows = store.minute_aggs_in_range(base, base + 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 4);
        assert_eq!(rows[0].avg_mark_price, "100.5");
    }

    #[test]
    fn engine_skips_open_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let engine = AggregationEngine::new(store.clone(), 300, 30, 365);

        let now = 1_700_000_000;
        store
            .insert_ticks(&[tick("gmx", "BTC-USD", now - 30, "100", "0")])
            .unwrap();

        let report = engine.run_minute_rollup(now).unwrap();
        assert_eq!(report.rows_written, 0);
        assert_eq!(store.raw_count().unwrap(), 1);
    }

    #[test]
    fn hour_rollup_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let engine = AggregationEngine::new(store.clone(), 300, 30, 365);

        let hour0 = 1_700_000_000 / 3600 * 3600;
        let minute_rows = fold_minute_buckets(
            &[
                tick("gmx", "BTC-USD", hour0 + 60, "100", "0.0008"),
                tick("gmx", "BTC-USD", hour0 + 120, "102", "0.0008"),
            ],
            hour0 + 200,
        );
        store.upsert_minute_aggregates(&minute_rows).unwrap();

        let report = engine.run_hour_rollup(hour0 + 2 * 3600).unwrap();
        assert!(report.rows_written >= 1);

        let hour_rows = store
            .aggregates_after(true, 0, 100)
            .unwrap();
        assert_eq!(hour_rows.len(), 1);
        assert_eq!(hour_rows[0].bucket_ts, hour0);
        assert_eq!(hour_rows[0].sample_count, 2);
    }

    #[test]
    fn retention_trims_by_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            WriteStore::open(dir.path().join("w.db").to_str().unwrap()).unwrap(),
        );
        let engine = AggregationEngine::new(store.clone(), 300, 30, 365);

        let now = 1_700_000_000;
        let old_minute = fold_minute_buckets(
            &[tick("gmx", "BTC-USD", now - 40 * 86_400, "100", "0")],
            now,
        );
        let fresh_minute = fold_minute_buckets(
            &[tick("gmx", "BTC-USD", now - 86_400, "100", "0")],
            now,
        );
        store.upsert_minute_aggregates(&old_minute).unwrap();
        store.upsert_minute_aggregates(&fresh_minute).unwrap();

        let (minutes, hours) = engine.run_retention(now).unwrap();
        assert_eq!(minutes, 1);
        assert_eq!(hours, 0);
    }
}
