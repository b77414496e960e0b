//! End-to-end pipeline tests over temporary SQLite stores: raw ticks in,
//! minute and hour roll-ups, WRITE -> READ materialization, analytics
//! caches, and the read-side queries the API handlers sit on.

use perptrack_backend::aggregation::{fold_minute_buckets, AggregationEngine};
use perptrack_backend::analytics::AnalyticsEngine;
use perptrack_backend::materialize::Materializer;
use perptrack_backend::models::{FundingMa, MaWindow, RawTick};
use perptrack_backend::normalize::normalize_symbol;
use perptrack_backend::storage::{ArbitrageFilter, ReadStore, WriteStore};
use std::sync::Arc;

fn stores() -> (tempfile::TempDir, Arc<WriteStore>, Arc<ReadStore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let write = Arc::new(
        WriteStore::open(dir.path().join("write.db").to_str().unwrap()).expect("write store"),
    );
    let read = Arc::new(
        ReadStore::open(dir.path().join("read.db").to_str().unwrap()).expect("read store"),
    );
    (dir, write, read)
}

fn tick(exchange: &str, symbol: &str, created_at: i64, mark: &str, funding: &str) -> RawTick {
    let mut t = RawTick::new(exchange, symbol);
    t.mark_price = mark.to_string();
    t.index_price = mark.to_string();
    t.funding_rate = funding.to_string();
    t.stamp(created_at * 1000);
    t
}

#[test]
fn created_at_is_truncated_recorded_at() {
    let t = tick("gmx", "BTC-USD", 1_700_000_000, "100", "0");
    assert_eq!(t.created_at, t.recorded_at / 1000);
}

#[test]
fn minute_aggregation_end_to_end() {
    let (_dir, write, _read) = stores();
    let engine = AggregationEngine::new(write.clone(), 300, 30, 365);

    let base = 1_700_000_040; // minute-aligned
    write
        .insert_ticks(&[
            tick("gmx", "BTC-USD", base, "100", "0.0008"),
            tick("gmx", "BTC-USD", base + 15, "101", "0.0008"),
            tick("gmx", "BTC-USD", base + 30, "99", "0.0008"),
            tick("gmx", "BTC-USD", base + 45, "102", "0.0008"),
        ])
        .unwrap();

    let before = write.raw_count().unwrap();
    let report = engine.run_minute_rollup(base + 600).unwrap();

    // Exactly one bucket with sample_count = N.
    assert_eq!(report.rows_written, 1);
    let rows = write.minute_aggs_in_range(base, base + 60).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.sample_count, 4);
    assert_eq!(row.avg_mark_price, "100.5");
    assert_eq!(row.min_price, "99");
    assert_eq!(row.max_price, "102");
    assert!((row.price_volatility - 2.9851).abs() < 1e-3);

    let min: f64 = row.min_price.parse().unwrap();
    let avg: f64 = row.avg_mark_price.parse().unwrap();
    let max: f64 = row.max_price.parse().unwrap();
    assert!(row.sample_count >= 1);
    assert!(min <= avg && avg <= max);

    // Retention: the cleanup deleted exactly the consumed rows.
    let after = write.raw_count().unwrap();
    assert_eq!(before - after, report.ticks_consumed as i64);
    assert_eq!(after, 0);
}

#[test]
fn funding_views_annualize_consistently() {
    let (_dir, write, read) = stores();
    let now = 1_700_000_000;

    // 8 h venue: raw 0.0008 -> hourly 0.0001 -> 87.6 % APR.
    write
        .insert_ticks(&[tick("gmx", "BTC-USD", now - 60, "50000", "0.0008")])
        .unwrap();
    Materializer::new(write.clone(), read.clone())
        .run_latest_projection(now)
        .unwrap();

    let rows = read.query_latest(Some("gmx"), Some("BTC"), 10).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.funding_rate, "0.0008");
    assert_eq!(row.funding_rate_hourly, "0.0001");
    assert!((row.funding_rate_annual - 87.6).abs() < 1e-9);

    // The invariant: annual == hourly * 24 * 365 * 100.
    let hourly: f64 = row.funding_rate_hourly.parse().unwrap();
    let expected = hourly * 24.0 * 365.0 * 100.0;
    assert!(((row.funding_rate_annual - expected) / expected).abs() < 1e-9);
}

#[test]
fn canonicalization_merges_venues() {
    let (_dir, write, read) = stores();
    let now = 1_700_000_000;

    write
        .insert_ticks(&[
            tick("apex", "BTCUSDT", now - 30, "50000", "0.0008"),
            tick("paradex", "BTC-USD-PERP", now - 30, "50010", "0.0008"),
            tick("hyperliquid", "hyna:BTC", now - 30, "50020", "0.0001"),
            tick("drift", "ETH", now - 30, "3000", "0.0001"),
        ])
        .unwrap();

    Materializer::new(write, read.clone())
        .run_latest_projection(now)
        .unwrap();

    // /api/compare?symbol=BTC returns exactly three rows.
    let rows = read.query_latest(None, Some("BTC"), 100).unwrap();
    assert_eq!(rows.len(), 3);
    let exchanges: Vec<&str> = rows.iter().map(|r| r.exchange.as_str()).collect();
    assert!(exchanges.contains(&"apex"));
    assert!(exchanges.contains(&"paradex"));
    assert!(exchanges.contains(&"hyperliquid"));

    // Original spellings survive alongside the canonical key.
    let hl = rows.iter().find(|r| r.exchange == "hyperliquid").unwrap();
    assert_eq!(hl.original_symbol, "hyna:BTC");
    assert_eq!(hl.symbol, "BTC");

    let mappings = read.token_mappings().unwrap();
    assert_eq!(mappings.len(), 4);
}

#[test]
fn full_pipeline_to_analytics_caches() {
    let (_dir, write, read) = stores();
    let hour0 = 1_700_000_000 / 3600 * 3600 - 48 * 3600;

    // Two venues, one symbol, 30 hours of raw data folded to minute rows
    // directly (the hour tier consumes minute rows regardless of origin).
    let mut minute_rows = Vec::new();
    for h in 0..30 {
        let ts = hour0 + h * 3600;
        minute_rows.extend(fold_minute_buckets(
            &[
                tick("apex", "BTCUSDT", ts + 60, "50000", "0.0004"),
                tick("gmx", "BTC-USD", ts + 60, "50010", "0.0016"),
            ],
            ts + 120,
        ));
    }
    write.upsert_minute_aggregates(&minute_rows).unwrap();

    let engine = AggregationEngine::new(write.clone(), 300, 30, 365);
    let now = hour0 + 31 * 3600;
    let report = engine.run_hour_rollup(now).unwrap();
    assert!(report.rows_written >= 60, "hour rows: {}", report.rows_written);

    // Mirror hour rows to the READ store.
    let materializer = Materializer::new(write.clone(), read.clone());
    let (_, hour_copied) = materializer.run_historical_backfill(now).unwrap();
    assert!(hour_copied >= 60);

    // Analytics: MAs for both venues, arbitrage pairs with apex long.
    let analytics = AnalyticsEngine::new(read.clone(), 4);
    analytics.run(now).unwrap();

    let mas = read
        .query_funding_ma(None, Some("BTC"), Some("24h"))
        .unwrap();
    assert_eq!(mas.len(), 2);
    for ma in &mas {
        assert!(ma.sample_count > 0);
        assert!((ma.calculated_at - now).abs() <= 2 * 3600);
    }

    let opportunities = read
        .query_arbitrage(&ArbitrageFilter {
            limit: 100,
            descending: true,
            ..Default::default()
        })
        .unwrap();
    assert!(!opportunities.is_empty());
    for opp in &opportunities {
        let long: f64 = opp.long_rate.parse().unwrap();
        let short: f64 = opp.short_rate.parse().unwrap();
        let spread: f64 = opp.spread.parse().unwrap();
        assert!(long <= short);
        assert!(spread >= 0.0);
        assert!((0..=5).contains(&opp.stability_score));
        assert_eq!(opp.is_stable, opp.stability_score >= 4);
        assert_eq!(opp.long_exchange, "apex");
        assert_eq!(opp.short_exchange, "gmx");
    }

    // Same direction across every populated window: fully stable.
    let day = opportunities.iter().find(|o| o.timeframe == "24h").unwrap();
    assert_eq!(day.stability_score, 5);
    assert!(day.is_stable);
}

#[test]
fn arbitrage_direction_and_partial_stability() {
    let (_dir, _write, read) = stores();
    let now = 1_700_000_000i64;

    // 24h MAs: A=0.00005, B=0.00020 -> long A, spread 0.00015. Direction
    // holds in 3d and 7d, flips in 14d and 30d -> score 3, not stable.
    let rates = [
        ("24h", "0.00005", "0.0002"),
        ("3d", "0.00005", "0.0002"),
        ("7d", "0.00005", "0.0002"),
        ("14d", "0.0002", "0.00005"),
        ("30d", "0.0002", "0.00005"),
    ];
    for (timeframe, a, b) in rates {
        for (exchange, rate) in [("aevo", a), ("vertex", b)] {
            read.upsert_funding_ma(&FundingMa {
                symbol: "SOL".into(),
                exchange: exchange.into(),
                timeframe: timeframe.into(),
                avg_funding_rate: rate.into(),
                avg_funding_annual: rate.parse::<f64>().unwrap() * 8_760.0 * 100.0,
                sample_count: 10,
                calculated_at: now,
            })
            .unwrap();
        }
    }

    AnalyticsEngine::new(read.clone(), 4).run_arbitrage(now).unwrap();

    let rows = read
        .query_arbitrage(&ArbitrageFilter {
            timeframes: Some(vec!["24h".into()]),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rows.len(), 1);
    let opp = &rows[0];
    assert_eq!(opp.long_exchange, "aevo");
    assert_eq!(opp.short_exchange, "vertex");
    assert_eq!(opp.spread, "0.00015");
    assert_eq!(opp.stability_score, 3);
    assert!(!opp.is_stable);

    // onlyStable excludes everything below the threshold.
    let stable = read
        .query_arbitrage(&ArbitrageFilter {
            only_stable: true,
            limit: 100,
            ..Default::default()
        })
        .unwrap();
    assert!(stable.iter().all(|o| o.stability_score >= 4));
    assert!(!stable.iter().any(|o| o.symbol == "SOL" && o.timeframe == "24h"));
}

#[test]
fn latest_materialization_is_idempotent() {
    let (_dir, write, read) = stores();
    let now = 1_700_000_000;

    write
        .insert_ticks(&[
            tick("apex", "ETHUSDT", now - 45, "3000.5", "0.00024"),
            tick("rabbitx", "ETH-USD", now - 45, "3000.7", "0.00003"),
        ])
        .unwrap();

    let materializer = Materializer::new(write, read.clone());
    materializer.run_latest_projection(now).unwrap();
    let first = read.query_latest(None, Some("ETH"), 10).unwrap();

    // No new raw ticks: a second run must only move updated_at.
    materializer.run_latest_projection(now + 300).unwrap();
    let second = read.query_latest(None, Some("ETH"), 10).unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.exchange, b.exchange);
        assert_eq!(a.original_symbol, b.original_symbol);
        assert_eq!(a.mark_price, b.mark_price);
        assert_eq!(a.funding_rate, b.funding_rate);
        assert_eq!(a.funding_rate_hourly, b.funding_rate_hourly);
        assert_eq!(a.funding_rate_annual, b.funding_rate_annual);
        assert_eq!(a.volume_24h, b.volume_24h);
        assert_ne!(a.updated_at, b.updated_at);
    }
}

#[test]
fn symbol_normalization_is_idempotent_over_venue_forms() {
    for original in [
        "BTCUSDT",
        "BTC-USD-PERP",
        "hyna:BTC",
        "vntl:SPACEX",
        "1000PEPEUSDT",
        "kBONK",
        "SOL",
    ] {
        let once = normalize_symbol(original);
        assert_eq!(normalize_symbol(&once), once);
    }
    assert_eq!(normalize_symbol("BTCUSDT"), normalize_symbol("BTC-USD-PERP"));
    assert_eq!(normalize_symbol("BTCUSDT"), normalize_symbol("hyna:BTC"));
}

#[test]
fn ma_window_hours_are_stable() {
    let hours: Vec<i64> = MaWindow::ALL.iter().map(|w| w.hours()).collect();
    assert_eq!(hours, vec![24, 72, 168, 336, 720]);
}
