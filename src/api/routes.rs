//! Handlers for the query surface. Read-only: nothing here writes to
//! either store; tracker start/stop only sends commands to the runtime.

use super::{fail, ok, ok_with_meta, ApiResult, AppState};
use crate::models::{Aggregate, ArbitrageOpportunity, FundingMa, LatestMarket, MaWindow, RawTick, TrackerStatusRow};
use crate::normalize::normalize_symbol;
use crate::storage::{ArbitrageFilter, ArbitrageSort};
use crate::tracker::TrackerDebug;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1_000;

/// Raw rows are only served while they still exist on the WRITE side; any
/// older range falls through to the minute tier.
const RAW_WINDOW_SECS: i64 = 600;

fn page_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

fn csv_list(raw: &Option<String>) -> Option<Vec<String>> {
    let list: Vec<String> = raw
        .as_deref()?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        fail::<serde_json::Value>("route not found"),
    )
}

// ---------------------------------------------------------------
// Latest / markets
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub limit: Option<usize>,
}

pub async fn get_latest(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> ApiResult<Vec<LatestMarket>> {
    let symbol = params.symbol.as_deref().map(normalize_symbol);
    let rows = state.read.query_latest(
        params.exchange.as_deref(),
        symbol.as_deref(),
        MAX_PAGE,
    )?;

    let meta = json!({ "count": rows.len(), "timestamp": Utc::now().to_rfc3339() });
    Ok(ok_with_meta(rows, meta))
}

pub async fn get_markets(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> ApiResult<Vec<LatestMarket>> {
    let symbol = params.symbol.as_deref().map(normalize_symbol);
    let limit = page_limit(params.limit);
    let rows = state
        .read
        .query_latest(params.exchange.as_deref(), symbol.as_deref(), limit)?;

    let meta = json!({ "count": rows.len(), "limit": limit });
    Ok(ok_with_meta(rows, meta))
}

// ---------------------------------------------------------------
// History
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    /// Milliseconds.
    pub from: Option<i64>,
    /// Milliseconds.
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

/// Raw or minute rows depending on how far back the range reaches.
pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsQuery>,
) -> ApiResult<serde_json::Value> {
    let now = Utc::now().timestamp();
    let to_s = params.to.map(|ms| ms / 1000).unwrap_or(now);
    let from_s = params.from.map(|ms| ms / 1000).unwrap_or(now - 3_600);
    let limit = page_limit(params.limit);

    if from_s >= now - RAW_WINDOW_SECS {
        let rows: Vec<RawTick> = state.write.query_ticks(
            params.exchange.as_deref(),
            params.symbol.as_deref(),
            from_s,
            to_s,
            limit,
        )?;
        let meta = json!({ "count": rows.len(), "source": "raw" });
        return Ok(ok_with_meta(serde_json::to_value(rows)?, meta));
    }

    let symbol = params.symbol.as_deref().map(normalize_symbol);
    let rows: Vec<Aggregate> = state.read.query_aggregates(
        false,
        params.exchange.as_deref(),
        symbol.as_deref(),
        Some(from_s),
        Some(to_s),
        limit,
    )?;
    let meta = json!({ "count": rows.len(), "source": "1m" });
    Ok(ok_with_meta(serde_json::to_value(rows)?, meta))
}

#[derive(Debug, Deserialize)]
pub struct NormalizedDataQuery {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn get_normalized_data(
    State(state): State<AppState>,
    Query(params): Query<NormalizedDataQuery>,
) -> ApiResult<serde_json::Value> {
    let interval = params.interval.as_deref().unwrap_or("1m");
    let limit = page_limit(params.limit);
    let from_s = params.from.map(|ms| ms / 1000);
    let to_s = params.to.map(|ms| ms / 1000);

    match interval {
        "15s" => {
            let now = Utc::now().timestamp();
            let rows: Vec<RawTick> = state.write.query_ticks(
                params.exchange.as_deref(),
                params.symbol.as_deref(),
                from_s.unwrap_or(now - RAW_WINDOW_SECS),
                to_s.unwrap_or(now),
                limit,
            )?;
            let meta = json!({ "count": rows.len(), "interval": "15s" });
            Ok(ok_with_meta(serde_json::to_value(rows)?, meta))
        }
        "1m" | "1h" => {
            let symbol = params.symbol.as_deref().map(normalize_symbol);
            let rows: Vec<Aggregate> = state.read.query_aggregates(
                interval == "1h",
                params.exchange.as_deref(),
                symbol.as_deref(),
                from_s,
                to_s,
                limit,
            )?;
            let meta = json!({ "count": rows.len(), "interval": interval });
            Ok(ok_with_meta(serde_json::to_value(rows)?, meta))
        }
        other => Ok(fail(format!(
            "unsupported interval {:?}; expected 15s, 1m or 1h",
            other
        ))),
    }
}

// ---------------------------------------------------------------
// Tokens / compare
// ---------------------------------------------------------------

pub async fn get_tokens(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let mappings = state.read.token_mappings()?;

    let mut grouped: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for (symbol, exchange, original) in mappings {
        grouped.entry(symbol).or_default().push(json!({
            "exchange": exchange,
            "original_symbol": original,
        }));
    }

    let tokens: Vec<serde_json::Value> = grouped
        .into_iter()
        .map(|(symbol, markets)| json!({ "symbol": symbol, "markets": markets }))
        .collect();

    let meta = json!({ "count": tokens.len() });
    Ok(ok_with_meta(serde_json::to_value(tokens)?, meta))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub symbol: Option<String>,
    pub token: Option<String>,
}

/// One row per venue for a canonical symbol, plus cross-venue aggregates.
pub async fn get_compare(
    State(state): State<AppState>,
    Query(params): Query<CompareQuery>,
) -> ApiResult<serde_json::Value> {
    let Some(raw_symbol) = params.symbol.or(params.token) else {
        return Ok(fail("symbol parameter is required"));
    };
    let symbol = normalize_symbol(&raw_symbol);

    let rows = state.read.query_latest(None, Some(&symbol), MAX_PAGE)?;
    if rows.is_empty() {
        return Ok(fail(format!("symbol {} not found", symbol)));
    }

    let best = rows
        .iter()
        .max_by(|a, b| a.funding_rate_annual.total_cmp(&b.funding_rate_annual));
    let worst = rows
        .iter()
        .min_by(|a, b| a.funding_rate_annual.total_cmp(&b.funding_rate_annual));

    let aggregates = json!({
        "venues": rows.len(),
        "best_funding_apr": best.map(|r| json!({ "exchange": r.exchange, "annual": r.funding_rate_annual })),
        "worst_funding_apr": worst.map(|r| json!({ "exchange": r.exchange, "annual": r.funding_rate_annual })),
        "max_spread_apr": match (best, worst) {
            (Some(b), Some(w)) => Some(b.funding_rate_annual - w.funding_rate_annual),
            _ => None,
        },
    });

    Ok(ok(json!({
        "symbol": symbol,
        "markets": rows,
        "aggregates": aggregates,
    })))
}

// ---------------------------------------------------------------
// Funding MAs
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FundingMaQuery {
    pub exchange: Option<String>,
    pub symbol: Option<String>,
    /// Window length in hours (24, 72, 168, 336, 720).
    pub period: Option<i64>,
}

pub async fn get_funding_ma(
    State(state): State<AppState>,
    Query(params): Query<FundingMaQuery>,
) -> ApiResult<serde_json::Value> {
    let (Some(exchange), Some(raw_symbol)) = (params.exchange, params.symbol) else {
        return Ok(fail("exchange and symbol parameters are required"));
    };
    let symbol = normalize_symbol(&raw_symbol);

    let period = params.period.unwrap_or(24);
    let Some(window) = MaWindow::ALL.iter().find(|w| w.hours() == period) else {
        return Ok(fail(format!(
            "unsupported period {}h; expected one of 24, 72, 168, 336, 720",
            period
        )));
    };

    let rows = state
        .read
        .query_funding_ma(Some(&exchange), Some(&symbol), Some(window.as_str()))?;
    match rows.into_iter().next() {
        Some(ma) => Ok(ok(serde_json::to_value(ma)?)),
        None => Ok(fail(format!(
            "no moving average for {} on {}",
            symbol, exchange
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct FundingMaBulkQuery {
    pub exchanges: Option<String>,
    pub symbols: Option<String>,
    pub timeframes: Option<String>,
}

/// Bulk MA lookup grouped by symbol, with the matching arbitrage rows.
pub async fn get_funding_ma_bulk(
    State(state): State<AppState>,
    Query(params): Query<FundingMaBulkQuery>,
) -> ApiResult<serde_json::Value> {
    let exchanges = csv_list(&params.exchanges);
    let symbols = csv_list(&params.symbols).map(|list| {
        list.iter()
            .map(|s| normalize_symbol(s))
            .collect::<Vec<String>>()
    });
    let timeframes = csv_list(&params.timeframes);

    let mut mas: Vec<FundingMa> = state.read.query_funding_ma(None, None, None)?;
    if let Some(exchanges) = &exchanges {
        mas.retain(|m| exchanges.iter().any(|e| e == &m.exchange));
    }
    if let Some(symbols) = &symbols {
        mas.retain(|m| symbols.iter().any(|s| s == &m.symbol));
    }
    if let Some(timeframes) = &timeframes {
        mas.retain(|m| timeframes.iter().any(|t| t == &m.timeframe));
    }

    let mut grouped: BTreeMap<String, Vec<FundingMa>> = BTreeMap::new();
    for ma in mas {
        grouped.entry(ma.symbol.clone()).or_default().push(ma);
    }

    let arbitrage: Vec<ArbitrageOpportunity> = state.read.query_arbitrage(&ArbitrageFilter {
        symbols,
        exchanges,
        timeframes,
        descending: true,
        limit: 0,
        ..Default::default()
    })?;

    let meta = json!({ "symbols": grouped.len(), "arbitrage_count": arbitrage.len() });
    Ok(ok_with_meta(
        json!({ "moving_averages": grouped, "arbitrage": arbitrage }),
        meta,
    ))
}

// ---------------------------------------------------------------
// Arbitrage
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ArbitrageQuery {
    pub symbols: Option<String>,
    pub exchanges: Option<String>,
    pub timeframes: Option<String>,
    #[serde(rename = "minSpread")]
    pub min_spread: Option<f64>,
    #[serde(rename = "minSpreadAPR")]
    pub min_spread_apr: Option<f64>,
    #[serde(rename = "onlyStable")]
    pub only_stable: Option<bool>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
}

pub async fn get_arbitrage(
    State(state): State<AppState>,
    Query(params): Query<ArbitrageQuery>,
) -> ApiResult<Vec<ArbitrageOpportunity>> {
    let sort_by = match params.sort_by.as_deref() {
        None | Some("spreadAPR") | Some("spread_apr") => ArbitrageSort::SpreadApr,
        Some("spread") => ArbitrageSort::Spread,
        Some("stability") => ArbitrageSort::Stability,
        Some(other) => {
            return Ok(fail(format!(
                "unsupported sortBy {:?}; expected spread, spreadAPR or stability",
                other
            )))
        }
    };
    let descending = !matches!(params.order.as_deref(), Some("asc"));

    let filter = ArbitrageFilter {
        symbols: csv_list(&params.symbols)
            .map(|list| list.iter().map(|s| normalize_symbol(s)).collect()),
        exchanges: csv_list(&params.exchanges),
        timeframes: csv_list(&params.timeframes),
        min_spread: params.min_spread,
        min_spread_apr: params.min_spread_apr,
        only_stable: params.only_stable.unwrap_or(false),
        sort_by,
        descending,
        limit: page_limit(params.limit),
    };

    let rows = state.read.query_arbitrage(&filter)?;

    let spread_aprs: Vec<f64> = rows.iter().map(|r| r.spread_apr).collect();
    let stats = if spread_aprs.is_empty() {
        json!({ "count": 0 })
    } else {
        let min = spread_aprs.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = spread_aprs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = spread_aprs.iter().sum::<f64>() / spread_aprs.len() as f64;
        json!({
            "count": rows.len(),
            "spread_apr_min": min,
            "spread_apr_max": max,
            "spread_apr_avg": avg,
        })
    };

    Ok(ok_with_meta(rows, json!({ "stats": stats })))
}

// ---------------------------------------------------------------
// Tracker status & control
// ---------------------------------------------------------------

pub async fn get_tracker_status(
    State(state): State<AppState>,
) -> ApiResult<Vec<TrackerStatusRow>> {
    let rows = state.read.all_tracker_status()?;
    let meta = json!({ "count": rows.len() });
    Ok(ok_with_meta(rows, meta))
}

pub async fn get_tracker_detail(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> ApiResult<TrackerStatusRow> {
    match state.trackers.get(&exchange) {
        Some(handle) => Ok(ok(handle.status_row(Utc::now().timestamp()))),
        None => Ok(fail(format!("unknown exchange {}", exchange))),
    }
}

pub async fn get_tracker_debug(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> ApiResult<TrackerDebug> {
    match state.trackers.get(&exchange) {
        Some(handle) => Ok(ok(handle.debug_snapshot())),
        None => Ok(fail(format!("unknown exchange {}", exchange))),
    }
}

pub async fn post_tracker_start(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.trackers.get(&exchange) {
        Some(handle) => {
            let accepted = handle.start().await;
            Ok(ok(json!({ "exchange": exchange, "accepted": accepted })))
        }
        None => Ok(fail(format!("unknown exchange {}", exchange))),
    }
}

pub async fn post_tracker_stop(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.trackers.get(&exchange) {
        Some(handle) => {
            let accepted = handle.stop().await;
            Ok(ok(json!({ "exchange": exchange, "accepted": accepted })))
        }
        None => Ok(fail(format!("unknown exchange {}", exchange))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_limit_defaults_and_caps() {
        assert_eq!(page_limit(None), 100);
        assert_eq!(page_limit(Some(10)), 10);
        assert_eq!(page_limit(Some(50_000)), 1_000);
        assert_eq!(page_limit(Some(0)), 1);
    }

    #[test]
    fn csv_list_trims_and_drops_empties() {
        assert_eq!(
            csv_list(&Some("gmx, drift ,".to_string())),
            Some(vec!["gmx".to_string(), "drift".to_string()])
        );
        assert_eq!(csv_list(&Some(" ".to_string())), None);
        assert_eq!(csv_list(&None), None);
    }

    #[test]
    fn envelope_serialization_shape() {
        let success = ok(vec![1, 2, 3]);
        let body = serde_json::to_value(&success.0).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], json!([1, 2, 3]));
        assert!(body.get("error").is_none());

        let failure = fail::<Vec<i64>>("missing parameter");
        let body = serde_json::to_value(&failure.0).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "missing parameter");
        assert!(body.get("data").is_none());
    }
}
