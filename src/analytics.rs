//! Analytics cache builder.
//!
//! Hourly, in order: funding-rate moving averages per (canonical symbol,
//! exchange, window), then cross-venue arbitrage pairs derived from those
//! averages, then volatility metrics stitched onto the latest projection.
//! Everything reads and writes the READ store only.

use crate::models::{ArbitrageOpportunity, FundingMa, MaWindow};
use crate::storage::ReadStore;
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

const HOUR: i64 = 3_600;

/// Minimum hourly bars before a volatility figure is published.
const MIN_VOL_SAMPLES: usize = 2;
const ATR_PERIOD: usize = 14;
const BB_PERIOD: usize = 20;

pub struct AnalyticsEngine {
    read: Arc<ReadStore>,
    stability_threshold: i64,
}

impl AnalyticsEngine {
    pub fn new(read: Arc<ReadStore>, stability_threshold: i64) -> Self {
        Self {
            read,
            stability_threshold,
        }
    }

    /// The hourly cache rebuild: MAs first, the arbitrage pass consumes
    /// them, volatility last.
    pub fn run(&self, now: i64) -> Result<()> {
        let mas = self.run_funding_mas(now)?;
        let opportunities = self.run_arbitrage(now)?;
        let volatility_rows = self.run_volatility(now)?;
        info!(mas, opportunities, volatility_rows, "analytics cache rebuilt");
        Ok(())
    }

    /// Mean raw and annualized funding per (symbol, exchange, window) over
    /// hour aggregates in `[now - window, now]`. Empty windows write nothing.
    pub fn run_funding_mas(&self, now: i64) -> Result<usize> {
        let since = now - MaWindow::D30.hours() * HOUR;
        let rows = self.read.hour_aggs_since(since)?;

        let mut groups: BTreeMap<(String, String), Vec<(i64, Decimal, f64)>> = BTreeMap::new();
        for row in &rows {
            let rate = match Decimal::from_str(&row.avg_funding_rate) {
                Ok(d) => d,
                Err(_) => continue,
            };
            groups
                .entry((row.normalized_symbol.clone(), row.exchange.clone()))
                .or_default()
                .push((row.bucket_ts, rate, row.avg_funding_rate_annual));
        }

        let mut written = 0usize;
        for ((symbol, exchange), samples) in groups {
            for window in MaWindow::ALL {
                let floor = now - window.hours() * HOUR;
                let in_window: Vec<&(i64, Decimal, f64)> =
                    samples.iter().filter(|(ts, _, _)| *ts >= floor).collect();
                if in_window.is_empty() {
                    continue;
                }

                let n = Decimal::from(in_window.len());
                let sum_rate: Decimal = in_window.iter().map(|(_, r, _)| *r).sum();
                let sum_annual: f64 = in_window.iter().map(|(_, _, a)| *a).sum();
                let avg_rate = sum_rate / n;

                self.read.upsert_funding_ma(&FundingMa {
                    symbol: symbol.clone(),
                    exchange: exchange.clone(),
                    timeframe: window.as_str().to_string(),
                    avg_funding_rate: avg_rate.normalize().to_string(),
                    avg_funding_annual: sum_annual / in_window.len() as f64,
                    sample_count: in_window.len() as i64,
                    calculated_at: now,
                })?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Pairwise funding spreads from the MA cache. For every (symbol,
    /// window) with at least two venues, every unordered venue pair becomes
    /// one row: long = lower mean rate, short = higher; ties go to the
    /// lexicographically smaller exchange.
    pub fn run_arbitrage(&self, now: i64) -> Result<usize> {
        let mas = self.read.query_funding_ma(None, None, None)?;

        // (symbol, timeframe) -> venue rows sorted by exchange id.
        let mut grouped: BTreeMap<(String, String), Vec<MaLeg>> = BTreeMap::new();
        for ma in &mas {
            let rate = match Decimal::from_str(&ma.avg_funding_rate) {
                Ok(d) => d,
                Err(_) => continue,
            };
            grouped
                .entry((ma.symbol.clone(), ma.timeframe.clone()))
                .or_default()
                .push(MaLeg {
                    exchange: ma.exchange.clone(),
                    rate,
                    annual: ma.avg_funding_annual,
                });
        }
        for legs in grouped.values_mut() {
            legs.sort_by(|a, b| a.exchange.cmp(&b.exchange));
        }

        let mut written = 0usize;
        let symbols: Vec<String> = grouped
            .keys()
            .map(|(s, _)| s.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        for symbol in symbols {
            for window in MaWindow::ALL {
                let key = (symbol.clone(), window.as_str().to_string());
                let Some(legs) = grouped.get(&key) else {
                    continue;
                };
                if legs.len() < 2 {
                    continue;
                }

                for i in 0..legs.len() {
                    for j in (i + 1)..legs.len() {
                        let (a, b) = (&legs[i], &legs[j]);

                        // Sorted by exchange, so on equal rates `a` (the
                        // lexicographically smaller id) takes the long leg.
                        let (long, short) = if b.rate < a.rate { (b, a) } else { (a, b) };

                        let spread = (a.rate - b.rate).abs();
                        let spread_apr = (a.annual - b.annual).abs();

                        let stability_score = self.stability_score(
                            &grouped,
                            &symbol,
                            &a.exchange,
                            &b.exchange,
                            long.exchange == a.exchange,
                        );

                        self.read.upsert_arbitrage(&ArbitrageOpportunity {
                            symbol: symbol.clone(),
                            long_exchange: long.exchange.clone(),
                            short_exchange: short.exchange.clone(),
                            timeframe: window.as_str().to_string(),
                            long_rate: long.rate.normalize().to_string(),
                            short_rate: short.rate.normalize().to_string(),
                            long_apr: long.annual,
                            short_apr: short.annual,
                            spread: spread.normalize().to_string(),
                            spread_apr,
                            stability_score,
                            is_stable: stability_score >= self.stability_threshold,
                            calculated_at: now,
                        })?;
                        written += 1;
                    }
                }
            }
        }
        Ok(written)
    }

    /// Count the windows whose long/short direction for (a, b) matches the
    /// current window's direction. Windows where either leg has no MA row
    /// do not count.
    fn stability_score(
        &self,
        grouped: &BTreeMap<(String, String), Vec<MaLeg>>,
        symbol: &str,
        exchange_a: &str,
        exchange_b: &str,
        current_a_is_long: bool,
    ) -> i64 {
        let mut score = 0i64;
        for window in MaWindow::ALL {
            let key = (symbol.to_string(), window.as_str().to_string());
            let Some(legs) = grouped.get(&key) else {
                continue;
            };
            let Some(a) = legs.iter().find(|l| l.exchange == exchange_a) else {
                continue;
            };
            let Some(b) = legs.iter().find(|l| l.exchange == exchange_b) else {
                continue;
            };

            // Equal rates resolve the same way the pairing does: the
            // lexicographically smaller exchange (a) is long.
            let a_is_long = a.rate <= b.rate;
            if a_is_long == current_a_is_long {
                score += 1;
            }
        }
        score
    }

    /// Realized volatility, ATR and Bollinger width per (symbol, exchange)
    /// from hourly bars, written onto the latest projection.
    pub fn run_volatility(&self, now: i64) -> Result<usize> {
        let since = now - MaWindow::D7.hours() * HOUR;
        let rows = self.read.hour_aggs_since(since)?;

        let mut groups: BTreeMap<(String, String), Vec<Bar>> = BTreeMap::new();
        for row in &rows {
            let (Ok(close), Ok(low), Ok(high)) = (
                row.avg_mark_price.parse::<f64>(),
                row.min_price.parse::<f64>(),
                row.max_price.parse::<f64>(),
            ) else {
                continue;
            };
            groups
                .entry((row.normalized_symbol.clone(), row.exchange.clone()))
                .or_default()
                .push(Bar {
                    bucket_ts: row.bucket_ts,
                    close,
                    low,
                    high,
                });
        }

        let mut updated = 0usize;
        for ((symbol, exchange), mut bars) in groups {
            bars.sort_by_key(|b| b.bucket_ts);

            let day_floor = now - 24 * HOUR;
            let day_closes: Vec<f64> = bars
                .iter()
                .filter(|b| b.bucket_ts >= day_floor)
                .map(|b| b.close)
                .collect();
            let week_closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

            let volatility_24h = realized_volatility_pct(&day_closes);
            let volatility_7d = realized_volatility_pct(&week_closes);
            let atr_14 = average_true_range(&bars, ATR_PERIOD);
            let bb_width = bollinger_width(&week_closes, BB_PERIOD);

            if volatility_24h.is_none()
                && volatility_7d.is_none()
                && atr_14.is_none()
                && bb_width.is_none()
            {
                continue;
            }

            self.read.update_volatility(
                &symbol,
                &exchange,
                volatility_24h,
                volatility_7d,
                atr_14,
                bb_width,
            )?;
            updated += 1;
        }
        Ok(updated)
    }
}

#[derive(Debug, Clone)]
struct MaLeg {
    exchange: String,
    rate: Decimal,
    annual: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    bucket_ts: i64,
    close: f64,
    low: f64,
    high: f64,
}

/// Population standard deviation of closes over their mean, in percent.
fn realized_volatility_pct(closes: &[f64]) -> Option<f64> {
    if closes.len() < MIN_VOL_SAMPLES {
        return None;
    }
    let n = closes.len() as f64;
    let mean = closes.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return None;
    }
    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt() / mean * 100.0)
}

/// Mean true range over the last `period` bars; needs period + 1 bars so
/// every TR has a previous close.
fn average_true_range(bars: &[Bar], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }
    let window = &bars[bars.len() - (period + 1)..];
    let mut trs = Vec::with_capacity(period);
    for pair in window.windows(2) {
        let prev_close = pair[0].close;
        let bar = pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        trs.push(tr);
    }
    Some(trs.iter().sum::<f64>() / trs.len() as f64)
}

/// Bollinger band width `(upper - lower) / middle` with 2-sigma bands over
/// the last `period` closes.
fn bollinger_width(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    if mean == 0.0 {
        return None;
    }
    let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    let sigma = variance.sqrt();
    Some(4.0 * sigma / mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::fold_minute_buckets;
    use crate::models::RawTick;
    use crate::storage::ReadStore;

    fn read_store() -> (tempfile::TempDir, Arc<ReadStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ReadStore::open(dir.path().join("r.db").to_str().unwrap()).unwrap(),
        );
        (dir, store)
    }

    fn hour_row(exchange: &str, symbol: &str, bucket_ts: i64, funding: &str) -> crate::models::Aggregate {
        let mut tick = RawTick::new(exchange, symbol);
        tick.mark_price = "100".to_string();
        tick.index_price = "100".to_string();
        tick.funding_rate = funding.to_string();
        tick.stamp(bucket_ts * 1000);
        let mut agg = fold_minute_buckets(&[tick], bucket_ts)[0].clone();
        agg.bucket_ts = bucket_ts;
        agg
    }

    #[test]
    fn funding_ma_written_per_window_with_samples() {
        let (_dir, read) = read_store();
        let now = 1_700_000_000i64;
        let hour = (now / 3600) * 3600;

        // Two hour rows inside 24 h, one older row inside 3 d only.
        read.upsert_aggregates(
            true,
            &[
                hour_row("gmx", "BTC-USD", hour - 3600, "0.0008"),
                hour_row("gmx", "BTC-USD", hour - 2 * 3600, "0.0004"),
                hour_row("gmx", "BTC-USD", hour - 48 * 3600, "0.0002"),
            ],
        )
        .unwrap();

        let engine = AnalyticsEngine::new(read.clone(), 4);
        let written = engine.run_funding_mas(now).unwrap();
        // All five windows have at least one sample.
        assert_eq!(written, 5);

        let day = read
            .query_funding_ma(Some("gmx"), Some("BTC"), Some("24h"))
            .unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].sample_count, 2);
        assert_eq!(day[0].avg_funding_rate, "0.0006");

        let three_day = read
            .query_funding_ma(Some("gmx"), Some("BTC"), Some("3d"))
            .unwrap();
        assert_eq!(three_day[0].sample_count, 3);
    }

    #[test]
    fn arbitrage_direction_and_spread() {
        let (_dir, read) = read_store();
        let now = 1_700_000_000i64;

        for (exchange, rate, annual) in [("apex", "0.00005", 43.8), ("gmx", "0.0002", 175.2)] {
            read.upsert_funding_ma(&FundingMa {
                symbol: "BTC".into(),
                exchange: exchange.into(),
                timeframe: "24h".into(),
                avg_funding_rate: rate.into(),
                avg_funding_annual: annual,
                sample_count: 24,
                calculated_at: now,
            })
            .unwrap();
        }

        let engine = AnalyticsEngine::new(read.clone(), 4);
        let written = engine.run_arbitrage(now).unwrap();
        assert_eq!(written, 1);

        let rows = read
            .query_arbitrage(&crate::storage::read_store::ArbitrageFilter {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        let opp = &rows[0];
        assert_eq!(opp.long_exchange, "apex");
        assert_eq!(opp.short_exchange, "gmx");
        assert_eq!(opp.spread, "0.00015");
        assert!(opp.long_rate.parse::<f64>().unwrap() <= opp.short_rate.parse::<f64>().unwrap());
    }

    #[test]
    fn stability_counts_matching_windows() {
        let (_dir, read) = read_store();
        let now = 1_700_000_000i64;

        // A long (lower) in 24h, 3d, 7d; flipped in 14d and 30d.
        let rates = [
            ("24h", "0.00005", "0.0002"),
            ("3d", "0.00004", "0.0003"),
            ("7d", "0.00006", "0.0002"),
            ("14d", "0.0003", "0.0001"),
            ("30d", "0.0004", "0.0001"),
        ];
        for (tf, a_rate, b_rate) in rates {
            for (exchange, rate) in [("apex", a_rate), ("gmx", b_rate)] {
                read.upsert_funding_ma(&FundingMa {
                    symbol: "BTC".into(),
                    exchange: exchange.into(),
                    timeframe: tf.into(),
                    avg_funding_rate: rate.into(),
                    avg_funding_annual: 0.0,
                    sample_count: 1,
                    calculated_at: now,
                })
                .unwrap();
            }
        }

        let engine = AnalyticsEngine::new(read.clone(), 4);
        engine.run_arbitrage(now).unwrap();

        let rows = read
            .query_arbitrage(&crate::storage::read_store::ArbitrageFilter {
                timeframes: Some(vec!["24h".into()]),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stability_score, 3);
        assert!(!rows[0].is_stable);

        // The 14d row sees the flipped direction as current, which also
        // matches 30d: score 2 there.
        let flipped = read
            .query_arbitrage(&crate::storage::read_store::ArbitrageFilter {
                timeframes: Some(vec!["14d".into()]),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(flipped[0].long_exchange, "gmx");
        assert_eq!(flipped[0].stability_score, 2);
    }

    #[test]
    fn fewer_than_two_venues_writes_nothing() {
        let (_dir, read) = read_store();
        read.upsert_funding_ma(&FundingMa {
            symbol: "BTC".into(),
            exchange: "apex".into(),
            timeframe: "24h".into(),
            avg_funding_rate: "0.0001".into(),
            avg_funding_annual: 87.6,
            sample_count: 24,
            calculated_at: 0,
        })
        .unwrap();

        let engine = AnalyticsEngine::new(read.clone(), 4);
        assert_eq!(engine.run_arbitrage(0).unwrap(), 0);
    }

    #[test]
    fn volatility_helpers() {
        assert_eq!(realized_volatility_pct(&[100.0]), None);
        let v = realized_volatility_pct(&[99.0, 101.0]).unwrap();
        assert!((v - 1.0).abs() < 1e-9);

        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 2) as f64).collect();
        assert!(bollinger_width(&closes, 20).is_some());
        assert_eq!(bollinger_width(&closes[..10], 20), None);

        let bars: Vec<Bar> = (0..15)
            .map(|i| Bar {
                bucket_ts: i as i64 * 3600,
                close: 100.0,
                low: 99.0,
                high: 101.0,
            })
            .collect();
        let atr = average_true_range(&bars, 14).unwrap();
        assert!((atr - 2.0).abs() < 1e-9);
    }
}
