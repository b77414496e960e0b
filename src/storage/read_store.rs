//! READ store: the query-surface projection.
//!
//! Fed exclusively by the materialization and analytics jobs; the HTTP
//! layer only ever reads it. Every write here is an idempotent upsert keyed
//! by the natural key, so a crashed job is safe to re-run.

use crate::models::{
    Aggregate, ArbitrageOpportunity, FundingMa, LatestMarket, TrackerStatusRow,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

use super::write_store::row_to_aggregate;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS normalized_tokens (
    symbol TEXT NOT NULL,
    exchange TEXT NOT NULL,
    original_symbol TEXT NOT NULL,
    mark_price TEXT NOT NULL DEFAULT '0',
    index_price TEXT NOT NULL DEFAULT '0',
    open_interest_usd TEXT NOT NULL DEFAULT '0',
    volume_24h REAL NOT NULL DEFAULT 0,
    funding_rate TEXT NOT NULL DEFAULT '0',
    funding_rate_hourly TEXT NOT NULL DEFAULT '0',
    funding_rate_annual REAL NOT NULL DEFAULT 0,
    next_funding_time INTEGER,
    price_change_24h REAL NOT NULL DEFAULT 0,
    low_24h REAL NOT NULL DEFAULT 0,
    high_24h REAL NOT NULL DEFAULT 0,
    volatility_24h REAL,
    volatility_7d REAL,
    atr_14 REAL,
    bb_width REAL,
    updated_at INTEGER NOT NULL,
    UNIQUE(symbol, exchange)
);

CREATE INDEX IF NOT EXISTS idx_normalized_tokens_exchange
    ON normalized_tokens(exchange);

CREATE TABLE IF NOT EXISTS market_stats_1m (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    bucket_ts INTEGER NOT NULL,
    avg_mark_price TEXT NOT NULL DEFAULT '0',
    avg_index_price TEXT NOT NULL DEFAULT '0',
    min_price TEXT NOT NULL DEFAULT '0',
    max_price TEXT NOT NULL DEFAULT '0',
    price_volatility REAL NOT NULL DEFAULT 0,
    volume REAL NOT NULL DEFAULT 0,
    quote_volume REAL NOT NULL DEFAULT 0,
    avg_open_interest TEXT NOT NULL DEFAULT '0',
    max_open_interest TEXT NOT NULL DEFAULT '0',
    avg_open_interest_usd TEXT NOT NULL DEFAULT '0',
    max_open_interest_usd TEXT NOT NULL DEFAULT '0',
    avg_funding_rate TEXT NOT NULL DEFAULT '0',
    min_funding_rate TEXT NOT NULL DEFAULT '0',
    max_funding_rate TEXT NOT NULL DEFAULT '0',
    avg_funding_rate_annual REAL NOT NULL DEFAULT 0,
    sample_count INTEGER NOT NULL,
    normalized_symbol TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(exchange, symbol, bucket_ts)
);

CREATE INDEX IF NOT EXISTS idx_read_1m_norm_bucket
    ON market_stats_1m(normalized_symbol, bucket_ts);

CREATE TABLE IF NOT EXISTS market_history (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    bucket_ts INTEGER NOT NULL,
    avg_mark_price TEXT NOT NULL DEFAULT '0',
    avg_index_price TEXT NOT NULL DEFAULT '0',
    min_price TEXT NOT NULL DEFAULT '0',
    max_price TEXT NOT NULL DEFAULT '0',
    price_volatility REAL NOT NULL DEFAULT 0,
    volume REAL NOT NULL DEFAULT 0,
    quote_volume REAL NOT NULL DEFAULT 0,
    avg_open_interest TEXT NOT NULL DEFAULT '0',
    max_open_interest TEXT NOT NULL DEFAULT '0',
    avg_open_interest_usd TEXT NOT NULL DEFAULT '0',
    max_open_interest_usd TEXT NOT NULL DEFAULT '0',
    avg_funding_rate TEXT NOT NULL DEFAULT '0',
    min_funding_rate TEXT NOT NULL DEFAULT '0',
    max_funding_rate TEXT NOT NULL DEFAULT '0',
    avg_funding_rate_annual REAL NOT NULL DEFAULT 0,
    sample_count INTEGER NOT NULL,
    normalized_symbol TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(exchange, symbol, bucket_ts)
);

CREATE INDEX IF NOT EXISTS idx_read_history_norm_bucket
    ON market_history(normalized_symbol, bucket_ts);

CREATE TABLE IF NOT EXISTS funding_ma_cache (
    symbol TEXT NOT NULL,
    exchange TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    avg_funding_rate TEXT NOT NULL DEFAULT '0',
    avg_funding_annual REAL NOT NULL DEFAULT 0,
    sample_count INTEGER NOT NULL,
    calculated_at INTEGER NOT NULL,
    UNIQUE(symbol, exchange, timeframe)
);

CREATE TABLE IF NOT EXISTS arbitrage_cache (
    symbol TEXT NOT NULL,
    long_exchange TEXT NOT NULL,
    short_exchange TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    long_rate TEXT NOT NULL DEFAULT '0',
    short_rate TEXT NOT NULL DEFAULT '0',
    long_apr REAL NOT NULL DEFAULT 0,
    short_apr REAL NOT NULL DEFAULT 0,
    spread TEXT NOT NULL DEFAULT '0',
    spread_apr REAL NOT NULL DEFAULT 0,
    stability_score INTEGER NOT NULL DEFAULT 0,
    is_stable INTEGER NOT NULL DEFAULT 0,
    calculated_at INTEGER NOT NULL,
    UNIQUE(symbol, long_exchange, short_exchange, timeframe)
);

CREATE INDEX IF NOT EXISTS idx_arbitrage_spread_apr
    ON arbitrage_cache(spread_apr DESC);

CREATE TABLE IF NOT EXISTS tracker_status (
    exchange TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    last_message_at INTEGER,
    last_error TEXT,
    reconnect_count INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

const AGG_COLUMNS: &str = "exchange, symbol, bucket_ts, avg_mark_price, avg_index_price, \
     min_price, max_price, price_volatility, volume, quote_volume, \
     avg_open_interest, max_open_interest, avg_open_interest_usd, max_open_interest_usd, \
     avg_funding_rate, min_funding_rate, max_funding_rate, avg_funding_rate_annual, \
     sample_count, normalized_symbol, created_at";

const LATEST_COLUMNS: &str = "symbol, exchange, original_symbol, mark_price, index_price, \
     open_interest_usd, volume_24h, funding_rate, funding_rate_hourly, funding_rate_annual, \
     next_funding_time, price_change_24h, low_24h, high_24h, \
     volatility_24h, volatility_7d, atr_14, bb_width, updated_at";

/// Filters accepted by the arbitrage-cache query.
#[derive(Debug, Default, Clone)]
pub struct ArbitrageFilter {
    pub symbols: Option<Vec<String>>,
    pub exchanges: Option<Vec<String>>,
    pub timeframes: Option<Vec<String>>,
    pub min_spread: Option<f64>,
    pub min_spread_apr: Option<f64>,
    pub only_stable: bool,
    pub sort_by: ArbitrageSort,
    pub descending: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrageSort {
    SpreadApr,
    Spread,
    Stability,
}

impl Default for ArbitrageSort {
    fn default() -> Self {
        ArbitrageSort::SpreadApr
    }
}

pub struct ReadStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReadStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open read store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize read store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active on read store, journal_mode = {}", journal_mode);
        }

        let tokens: i64 = conn
            .query_row("SELECT COUNT(*) FROM normalized_tokens", [], |row| row.get(0))
            .unwrap_or(0);
        info!("Read store initialized at {} ({} token rows)", db_path, tokens);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------
    // Latest projection
    // ---------------------------------------------------------------

    /// Upsert the latest-market projection. Volatility columns are owned by
    /// the analytics job and survive this write untouched.
    pub fn upsert_latest(&self, m: &LatestMarket) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO normalized_tokens \
             (symbol, exchange, original_symbol, mark_price, index_price, open_interest_usd, \
              volume_24h, funding_rate, funding_rate_hourly, funding_rate_annual, \
              next_funding_time, price_change_24h, low_24h, high_24h, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
             ON CONFLICT(symbol, exchange) DO UPDATE SET \
                original_symbol = excluded.original_symbol, \
                mark_price = excluded.mark_price, \
                index_price = excluded.index_price, \
                open_interest_usd = excluded.open_interest_usd, \
                volume_24h = excluded.volume_24h, \
                funding_rate = excluded.funding_rate, \
                funding_rate_hourly = excluded.funding_rate_hourly, \
                funding_rate_annual = excluded.funding_rate_annual, \
                next_funding_time = excluded.next_funding_time, \
                price_change_24h = excluded.price_change_24h, \
                low_24h = excluded.low_24h, \
                high_24h = excluded.high_24h, \
                updated_at = excluded.updated_at",
            params![
                m.symbol,
                m.exchange,
                m.original_symbol,
                m.mark_price,
                m.index_price,
                m.open_interest_usd,
                m.volume_24h,
                m.funding_rate,
                m.funding_rate_hourly,
                m.funding_rate_annual,
                m.next_funding_time,
                m.price_change_24h,
                m.low_24h,
                m.high_24h,
                m.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn update_volatility(
        &self,
        symbol: &str,
        exchange: &str,
        volatility_24h: Option<f64>,
        volatility_7d: Option<f64>,
        atr_14: Option<f64>,
        bb_width: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE normalized_tokens SET \
                volatility_24h = ?3, volatility_7d = ?4, atr_14 = ?5, bb_width = ?6 \
             WHERE symbol = ?1 AND exchange = ?2",
            params![symbol, exchange, volatility_24h, volatility_7d, atr_14, bb_width],
        )?;
        Ok(())
    }

    pub fn query_latest(
        &self,
        exchange: Option<&str>,
        symbol: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LatestMarket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM normalized_tokens \
             WHERE (?1 IS NULL OR exchange = ?1) \
               AND (?2 IS NULL OR symbol = ?2) \
             ORDER BY symbol, exchange \
             LIMIT ?3",
            LATEST_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![exchange, symbol, limit as i64], row_to_latest)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Distinct canonical symbols with their per-exchange original mapping.
    pub fn token_mappings(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, exchange, original_symbol FROM normalized_tokens \
             ORDER BY symbol, exchange",
        )?;

        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Aggregate mirrors
    // ---------------------------------------------------------------

    pub fn upsert_aggregates(&self, hourly: bool, rows: &[Aggregate]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = if hourly { "market_history" } else { "market_stats_1m" };

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let upsert = || -> Result<usize> {
            let mut stmt = conn.prepare_cached(&format!(
                "INSERT OR REPLACE INTO {} ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                table, AGG_COLUMNS
            ))?;

            for a in rows {
                stmt.execute(params![
                    a.exchange,
                    a.symbol,
                    a.bucket_ts,
                    a.avg_mark_price,
                    a.avg_index_price,
                    a.min_price,
                    a.max_price,
                    a.price_volatility,
                    a.volume,
                    a.quote_volume,
                    a.avg_open_interest,
                    a.max_open_interest,
                    a.avg_open_interest_usd,
                    a.max_open_interest_usd,
                    a.avg_funding_rate,
                    a.min_funding_rate,
                    a.max_funding_rate,
                    a.avg_funding_rate_annual,
                    a.sample_count,
                    a.normalized_symbol,
                    a.created_at,
                ])?;
            }
            Ok(rows.len())
        };

        match upsert() {
            Ok(n) => {
                conn.execute("COMMIT", [])?;
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Newest copied bucket; the backfill checkpoint floor.
    pub fn newest_bucket(&self, hourly: bool) -> Result<Option<i64>> {
        let table = if hourly { "market_history" } else { "market_stats_1m" };
        let conn = self.conn.lock();
        let ts: Option<i64> = conn.query_row(
            &format!("SELECT MAX(bucket_ts) FROM {}", table),
            [],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    /// History query for the API. `symbol` matches the canonical form first
    /// and falls back to the venue's original spelling.
    pub fn query_aggregates(
        &self,
        hourly: bool,
        exchange: Option<&str>,
        symbol: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Aggregate>> {
        let table = if hourly { "market_history" } else { "market_stats_1m" };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM {} \
             WHERE (?1 IS NULL OR exchange = ?1) \
               AND (?2 IS NULL OR normalized_symbol = ?2 OR symbol = ?2) \
               AND (?3 IS NULL OR bucket_ts >= ?3) \
               AND (?4 IS NULL OR bucket_ts <= ?4) \
             ORDER BY bucket_ts DESC, exchange, symbol \
             LIMIT ?5",
            AGG_COLUMNS, table
        ))?;

        let rows = stmt
            .query_map(
                params![exchange, symbol, from, to, limit as i64],
                row_to_aggregate,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Hour rows with `bucket_ts >= since`, the analytics working set.
    pub fn hour_aggs_since(&self, since: i64) -> Result<Vec<Aggregate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM market_history \
             WHERE bucket_ts >= ?1 \
             ORDER BY normalized_symbol, exchange, bucket_ts",
            AGG_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![since], row_to_aggregate)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Funding MA cache
    // ---------------------------------------------------------------

    pub fn upsert_funding_ma(&self, ma: &FundingMa) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO funding_ma_cache \
             (symbol, exchange, timeframe, avg_funding_rate, avg_funding_annual, sample_count, calculated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(symbol, exchange, timeframe) DO UPDATE SET \
                avg_funding_rate = excluded.avg_funding_rate, \
                avg_funding_annual = excluded.avg_funding_annual, \
                sample_count = excluded.sample_count, \
                calculated_at = excluded.calculated_at",
            params![
                ma.symbol,
                ma.exchange,
                ma.timeframe,
                ma.avg_funding_rate,
                ma.avg_funding_annual,
                ma.sample_count,
                ma.calculated_at,
            ],
        )?;
        Ok(())
    }

    pub fn query_funding_ma(
        &self,
        exchange: Option<&str>,
        symbol: Option<&str>,
        timeframe: Option<&str>,
    ) -> Result<Vec<FundingMa>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, exchange, timeframe, avg_funding_rate, avg_funding_annual, \
                    sample_count, calculated_at \
             FROM funding_ma_cache \
             WHERE (?1 IS NULL OR exchange = ?1) \
               AND (?2 IS NULL OR symbol = ?2) \
               AND (?3 IS NULL OR timeframe = ?3) \
             ORDER BY symbol, exchange, timeframe",
        )?;

        let rows = stmt
            .query_map(params![exchange, symbol, timeframe], row_to_funding_ma)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Arbitrage cache
    // ---------------------------------------------------------------

    pub fn upsert_arbitrage(&self, opp: &ArbitrageOpportunity) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO arbitrage_cache \
             (symbol, long_exchange, short_exchange, timeframe, long_rate, short_rate, \
              long_apr, short_apr, spread, spread_apr, stability_score, is_stable, calculated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(symbol, long_exchange, short_exchange, timeframe) DO UPDATE SET \
                long_rate = excluded.long_rate, \
                short_rate = excluded.short_rate, \
                long_apr = excluded.long_apr, \
                short_apr = excluded.short_apr, \
                spread = excluded.spread, \
                spread_apr = excluded.spread_apr, \
                stability_score = excluded.stability_score, \
                is_stable = excluded.is_stable, \
                calculated_at = excluded.calculated_at",
            params![
                opp.symbol,
                opp.long_exchange,
                opp.short_exchange,
                opp.timeframe,
                opp.long_rate,
                opp.short_rate,
                opp.long_apr,
                opp.short_apr,
                opp.spread,
                opp.spread_apr,
                opp.stability_score,
                opp.is_stable as i64,
                opp.calculated_at,
            ],
        )?;
        Ok(())
    }

    pub fn query_arbitrage(&self, filter: &ArbitrageFilter) -> Result<Vec<ArbitrageOpportunity>> {
        let order_col = match filter.sort_by {
            ArbitrageSort::SpreadApr => "spread_apr",
            ArbitrageSort::Spread => "CAST(spread AS REAL)",
            ArbitrageSort::Stability => "stability_score",
        };
        let direction = if filter.descending { "DESC" } else { "ASC" };

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT symbol, long_exchange, short_exchange, timeframe, long_rate, short_rate, \
                    long_apr, short_apr, spread, spread_apr, stability_score, is_stable, calculated_at \
             FROM arbitrage_cache \
             WHERE (?1 IS NULL OR CAST(spread AS REAL) >= ?1) \
               AND (?2 IS NULL OR spread_apr >= ?2) \
               AND (?3 = 0 OR is_stable = 1) \
             ORDER BY {} {}, symbol, long_exchange, short_exchange, timeframe",
            order_col, direction
        ))?;

        let only_stable: i64 = if filter.only_stable { 1 } else { 0 };
        let mut rows: Vec<ArbitrageOpportunity> = stmt
            .query_map(
                params![filter.min_spread, filter.min_spread_apr, only_stable],
                row_to_arbitrage,
            )?
            .filter_map(|r| r.ok())
            .collect();

        // CSV list filters are small; apply them in memory before the limit.
        if let Some(symbols) = &filter.symbols {
            rows.retain(|r| symbols.iter().any(|s| s == &r.symbol));
        }
        if let Some(exchanges) = &filter.exchanges {
            rows.retain(|r| {
                exchanges.iter().any(|e| e == &r.long_exchange)
                    || exchanges.iter().any(|e| e == &r.short_exchange)
            });
        }
        if let Some(timeframes) = &filter.timeframes {
            rows.retain(|r| timeframes.iter().any(|t| t == &r.timeframe));
        }

        if filter.limit > 0 {
            rows.truncate(filter.limit);
        }
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Tracker status
    // ---------------------------------------------------------------

    pub fn upsert_tracker_status(&self, row: &TrackerStatusRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tracker_status \
             (exchange, state, last_message_at, last_error, reconnect_count, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(exchange) DO UPDATE SET \
                state = excluded.state, \
                last_message_at = excluded.last_message_at, \
                last_error = excluded.last_error, \
                reconnect_count = excluded.reconnect_count, \
                updated_at = excluded.updated_at",
            params![
                row.exchange,
                row.state,
                row.last_message_at,
                row.last_error,
                row.reconnect_count,
                row.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn all_tracker_status(&self) -> Result<Vec<TrackerStatusRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT exchange, state, last_message_at, last_error, reconnect_count, updated_at \
             FROM tracker_status ORDER BY exchange",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(TrackerStatusRow {
                    exchange: row.get(0)?,
                    state: row.get(1)?,
                    last_message_at: row.get(2)?,
                    last_error: row.get(3)?,
                    reconnect_count: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ---------------------------------------------------------------
    // Metadata / maintenance
    // ---------------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1 LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .ok();
        Ok(value.filter(|v| !v.trim().is_empty()))
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        Ok(())
    }
}

fn row_to_latest(row: &rusqlite::Row) -> rusqlite::Result<LatestMarket> {
    Ok(LatestMarket {
        symbol: row.get(0)?,
        exchange: row.get(1)?,
        original_symbol: row.get(2)?,
        mark_price: row.get(3)?,
        index_price: row.get(4)?,
        open_interest_usd: row.get(5)?,
        volume_24h: row.get(6)?,
        funding_rate: row.get(7)?,
        funding_rate_hourly: row.get(8)?,
        funding_rate_annual: row.get(9)?,
        next_funding_time: row.get(10)?,
        price_change_24h: row.get(11)?,
        low_24h: row.get(12)?,
        high_24h: row.get(13)?,
        volatility_24h: row.get(14)?,
        volatility_7d: row.get(15)?,
        atr_14: row.get(16)?,
        bb_width: row.get(17)?,
        updated_at: row.get(18)?,
    })
}

fn row_to_funding_ma(row: &rusqlite::Row) -> rusqlite::Result<FundingMa> {
    Ok(FundingMa {
        symbol: row.get(0)?,
        exchange: row.get(1)?,
        timeframe: row.get(2)?,
        avg_funding_rate: row.get(3)?,
        avg_funding_annual: row.get(4)?,
        sample_count: row.get(5)?,
        calculated_at: row.get(6)?,
    })
}

fn row_to_arbitrage(row: &rusqlite::Row) -> rusqlite::Result<ArbitrageOpportunity> {
    let is_stable: i64 = row.get(11)?;
    Ok(ArbitrageOpportunity {
        symbol: row.get(0)?,
        long_exchange: row.get(1)?,
        short_exchange: row.get(2)?,
        timeframe: row.get(3)?,
        long_rate: row.get(4)?,
        short_rate: row.get(5)?,
        long_apr: row.get(6)?,
        short_apr: row.get(7)?,
        spread: row.get(8)?,
        spread_apr: row.get(9)?,
        stability_score: row.get(10)?,
        is_stable: is_stable != 0,
        calculated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackerState;

    fn temp_store() -> (tempfile::TempDir, ReadStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("read.db");
        let store = ReadStore::open(path.to_str().unwrap()).expect("open read store");
        (dir, store)
    }

    fn latest(symbol: &str, exchange: &str) -> LatestMarket {
        LatestMarket {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            original_symbol: format!("{}USDT", symbol),
            mark_price: "50000".into(),
            index_price: "50001".into(),
            open_interest_usd: "1000000".into(),
            volume_24h: 5_000_000.0,
            funding_rate: "0.0001".into(),
            funding_rate_hourly: "0.0001".into(),
            funding_rate_annual: 87.6,
            next_funding_time: Some(1_700_000_000_000),
            price_change_24h: 1.5,
            low_24h: 49_000.0,
            high_24h: 51_000.0,
            volatility_24h: None,
            volatility_7d: None,
            atr_14: None,
            bb_width: None,
            updated_at: 1_700_000_000,
        }
    }

    #[test]
    fn latest_upsert_preserves_volatility() {
        let (_dir, store) = temp_store();
        let m = latest("BTC", "apex");
        store.upsert_latest(&m).unwrap();
        store
            .update_volatility("BTC", "apex", Some(2.5), Some(4.0), Some(120.0), Some(0.04))
            .unwrap();

        // A refresh cycle re-upserts the projection; the analytics columns
        // must survive.
        store.upsert_latest(&m).unwrap();

        let rows = store.query_latest(Some("apex"), Some("BTC"), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].volatility_24h, Some(2.5));
        assert_eq!(rows[0].atr_14, Some(120.0));
    }

    #[test]
    fn latest_query_filters() {
        let (_dir, store) = temp_store();
        store.upsert_latest(&latest("BTC", "apex")).unwrap();
        store.upsert_latest(&latest("BTC", "gmx")).unwrap();
        store.upsert_latest(&latest("ETH", "apex")).unwrap();

        assert_eq!(store.query_latest(None, None, 100).unwrap().len(), 3);
        assert_eq!(store.query_latest(Some("apex"), None, 100).unwrap().len(), 2);
        assert_eq!(store.query_latest(None, Some("BTC"), 100).unwrap().len(), 2);
        assert_eq!(
            store.query_latest(Some("gmx"), Some("BTC"), 100).unwrap().len(),
            1
        );
    }

    #[test]
    fn funding_ma_replaces_on_upsert() {
        let (_dir, store) = temp_store();
        let mut ma = FundingMa {
            symbol: "BTC".into(),
            exchange: "gmx".into(),
            timeframe: "24h".into(),
            avg_funding_rate: "0.0001".into(),
            avg_funding_annual: 87.6,
            sample_count: 24,
            calculated_at: 1_700_000_000,
        };
        store.upsert_funding_ma(&ma).unwrap();
        ma.sample_count = 25;
        store.upsert_funding_ma(&ma).unwrap();

        let rows = store.query_funding_ma(Some("gmx"), Some("BTC"), Some("24h")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sample_count, 25);
    }

    #[test]
    fn arbitrage_filters_and_sort() {
        let (_dir, store) = temp_store();
        let base = ArbitrageOpportunity {
            symbol: "BTC".into(),
            long_exchange: "apex".into(),
            short_exchange: "gmx".into(),
            timeframe: "24h".into(),
            long_rate: "0.00005".into(),
            short_rate: "0.00020".into(),
            long_apr: 43.8,
            short_apr: 175.2,
            spread: "0.00015".into(),
            spread_apr: 131.4,
            stability_score: 5,
            is_stable: true,
            calculated_at: 1_700_000_000,
        };
        store.upsert_arbitrage(&base).unwrap();
        store
            .upsert_arbitrage(&ArbitrageOpportunity {
                symbol: "ETH".into(),
                spread: "0.00002".into(),
                spread_apr: 17.5,
                stability_score: 2,
                is_stable: false,
                ..base.clone()
            })
            .unwrap();

        let all = store.query_arbitrage(&ArbitrageFilter {
            limit: 100,
            descending: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].symbol, "BTC");

        let stable_only = store
            .query_arbitrage(&ArbitrageFilter {
                only_stable: true,
                limit: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stable_only.len(), 1);
        assert!(stable_only[0].stability_score >= 4);

        let min_spread = store
            .query_arbitrage(&ArbitrageFilter {
                min_spread: Some(0.0001),
                limit: 100,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(min_spread.len(), 1);
        assert_eq!(min_spread[0].symbol, "BTC");
    }

    #[test]
    fn tracker_status_upserts_by_exchange() {
        let (_dir, store) = temp_store();
        let mut row = TrackerStatusRow {
            exchange: "drift".into(),
            state: TrackerState::Running.as_str().into(),
            last_message_at: Some(1_700_000_000_000),
            last_error: None,
            reconnect_count: 0,
            updated_at: 1_700_000_000,
        };
        store.upsert_tracker_status(&row).unwrap();
        row.state = TrackerState::Disconnected.as_str().into();
        row.reconnect_count = 3;
        store.upsert_tracker_status(&row).unwrap();

        let rows = store.all_tracker_status().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "disconnected");
        assert_eq!(rows[0].reconnect_count, 3);
    }
}
