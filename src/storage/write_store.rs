//! WRITE store: append-only raw ticks plus the minute and hour roll-up
//! tables the aggregation engine maintains.
//!
//! Optimizations follow the same recipe as the read side:
//! - WAL mode for concurrent reads during tracker batches
//! - prepared statement caching
//! - batch inserts inside a single IMMEDIATE transaction

use crate::models::{Aggregate, RawTick};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS market_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    market_id TEXT NOT NULL,
    mark_price TEXT NOT NULL DEFAULT '0',
    index_price TEXT NOT NULL DEFAULT '0',
    last_price TEXT NOT NULL DEFAULT '0',
    open_interest TEXT NOT NULL DEFAULT '0',
    open_interest_usd TEXT NOT NULL DEFAULT '0',
    funding_rate TEXT NOT NULL DEFAULT '0',
    next_funding_time INTEGER,
    volume_24h REAL NOT NULL DEFAULT 0,
    quote_volume_24h REAL NOT NULL DEFAULT 0,
    low_24h REAL NOT NULL DEFAULT 0,
    high_24h REAL NOT NULL DEFAULT 0,
    price_change_24h REAL NOT NULL DEFAULT 0,
    recorded_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_market_stats_exchange_symbol_created
    ON market_stats(exchange, symbol, created_at);

CREATE INDEX IF NOT EXISTS idx_market_stats_created
    ON market_stats(created_at);

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

CREATE INDEX IF NOT EXISTS idx_market_stats_1m_bucket
    ON market_stats_1m(bucket_ts);

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

CREATE INDEX IF NOT EXISTS idx_market_history_bucket
    ON market_history(bucket_ts);

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

pub struct WriteStore {
    conn: Arc<Mutex<Connection>>,
}

impl WriteStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open write store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize write store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active on write store, journal_mode = {}", journal_mode);
        }

        let raw_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM market_stats", [], |row| row.get(0))
            .unwrap_or(0);
        info!("Write store initialized at {} ({} raw rows pending)", db_path, raw_rows);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ---------------------------------------------------------------
    // Raw ticks
    // ---------------------------------------------------------------

    /// Insert one snapshot batch in a single transaction. Rows arrive
    /// pre-validated; the batch either lands whole or not at all.
    pub fn insert_ticks(&self, ticks: &[RawTick]) -> Result<usize> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let insert = || -> Result<usize> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO market_stats \
                 (exchange, symbol, market_id, mark_price, index_price, last_price, \
                  open_interest, open_interest_usd, funding_rate, next_funding_time, \
                  volume_24h, quote_volume_24h, low_24h, high_24h, price_change_24h, \
                  recorded_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            )?;

            for t in ticks {
                stmt.execute(params![
                    t.exchange,
                    t.symbol,
                    t.market_id,
                    t.mark_price,
                    t.index_price,
                    t.last_price,
                    t.open_interest,
                    t.open_interest_usd,
                    t.funding_rate,
                    t.next_funding_time,
                    t.volume_24h,
                    t.quote_volume_24h,
                    t.low_24h,
                    t.high_24h,
                    t.price_change_24h,
                    t.recorded_at,
                    t.created_at,
                ])?;
            }
            Ok(ticks.len())
        };

        match insert() {
            Ok(n) => {
                conn.execute("COMMIT", [])?;
                debug!("inserted {} raw ticks", n);
                Ok(n)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Oldest raw `created_at` at or below `cutoff`, i.e. the start of the
    /// unaggregated backlog.
    pub fn oldest_raw_created_at(&self, cutoff: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn.query_row(
            "SELECT MIN(created_at) FROM market_stats WHERE created_at <= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    /// Raw ticks with `created_at` in the half-open range `[from, to)`,
    /// ordered so the aggregator sees each (exchange, symbol) run together.
    pub fn ticks_in_range(&self, from: i64, to: i64) -> Result<Vec<RawTick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM market_stats \
             WHERE created_at >= ?1 AND created_at < ?2 \
             ORDER BY exchange, symbol, created_at",
            TICK_COLUMNS
        ))?;

        let ticks = stmt
            .query_map(params![from, to], row_to_tick)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ticks)
    }

    /// Raw-tick query backing `/api/stats` for short ranges.
    pub fn query_ticks(
        &self,
        exchange: Option<&str>,
        symbol: Option<&str>,
        from: i64,
        to: i64,
        limit: usize,
    ) -> Result<Vec<RawTick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM market_stats \
             WHERE created_at >= ?1 AND created_at <= ?2 \
               AND (?3 IS NULL OR exchange = ?3) \
               AND (?4 IS NULL OR symbol = ?4) \
             ORDER BY created_at DESC \
             LIMIT ?5",
            TICK_COLUMNS
        ))?;

        let ticks = stmt
            .query_map(params![from, to, exchange, symbol, limit as i64], row_to_tick)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ticks)
    }

    /// Newest raw row per (exchange, symbol) observed since `since`; the
    /// input of the latest-projection materialization.
    pub fn latest_ticks_since(&self, since: i64) -> Result<Vec<RawTick>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM market_stats \
             WHERE id IN ( \
                 SELECT MAX(id) FROM market_stats \
                 WHERE created_at >= ?1 \
                 GROUP BY exchange, symbol \
             ) \
             ORDER BY exchange, symbol",
            TICK_COLUMNS
        ))?;

        let ticks = stmt
            .query_map(params![since], row_to_tick)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ticks)
    }

    /// Delete raw rows with `created_at` in `[from, to)` after they have
    /// been folded into the minute tier.
    pub fn delete_ticks_in_range(&self, from: i64, to: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM market_stats WHERE created_at >= ?1 AND created_at < ?2",
            params![from, to],
        )?;
        Ok(deleted)
    }

    pub fn raw_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM market_stats", [], |row| row.get(0))?;
        Ok(n)
    }

    // ---------------------------------------------------------------
    // Aggregates
    // ---------------------------------------------------------------

    pub fn upsert_minute_aggregates(&self, rows: &[Aggregate]) -> Result<usize> {
        self.upsert_aggregates("market_stats_1m", rows)
    }

    pub fn upsert_hour_aggregates(&self, rows: &[Aggregate]) -> Result<usize> {
        self.upsert_aggregates("market_history", rows)
    }

    fn upsert_aggregates(&self, table: &str, rows: &[Aggregate]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

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

    /// Minute rows whose bucket lies in `[from, to)`, the hour roll-up input.
    pub fn minute_aggs_in_range(&self, from: i64, to: i64) -> Result<Vec<Aggregate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM market_stats_1m \
             WHERE bucket_ts >= ?1 AND bucket_ts < ?2 \
             ORDER BY exchange, symbol, bucket_ts",
            AGG_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![from, to], row_to_aggregate)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Page of aggregates strictly newer than `after_bucket`, oldest first.
    /// Drives the WRITE -> READ historical backfill.
    pub fn aggregates_after(
        &self,
        hourly: bool,
        after_bucket: i64,
        limit: usize,
    ) -> Result<Vec<Aggregate>> {
        let table = if hourly { "market_history" } else { "market_stats_1m" };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM {} \
             WHERE bucket_ts > ?1 \
             ORDER BY bucket_ts, exchange, symbol \
             LIMIT ?2",
            AGG_COLUMNS, table
        ))?;

        let rows = stmt
            .query_map(params![after_bucket, limit as i64], row_to_aggregate)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Distinct bucket timestamps strictly newer than `after_bucket`,
    /// ascending. The backfill checkpoints whole buckets so a page split
    /// can never lose part of one.
    pub fn distinct_buckets_after(
        &self,
        hourly: bool,
        after_bucket: i64,
        limit: usize,
    ) -> Result<Vec<i64>> {
        let table = if hourly { "market_history" } else { "market_stats_1m" };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT DISTINCT bucket_ts FROM {} \
             WHERE bucket_ts > ?1 \
             ORDER BY bucket_ts \
             LIMIT ?2",
            table
        ))?;

        let buckets = stmt
            .query_map(params![after_bucket, limit as i64], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(buckets)
    }

    /// Every aggregate row of one bucket.
    pub fn aggregates_in_bucket(&self, hourly: bool, bucket: i64) -> Result<Vec<Aggregate>> {
        let table = if hourly { "market_history" } else { "market_stats_1m" };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM {} WHERE bucket_ts = ?1 ORDER BY exchange, symbol",
            AGG_COLUMNS, table
        ))?;

        let rows = stmt
            .query_map(params![bucket], row_to_aggregate)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_minute_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM market_stats_1m WHERE bucket_ts < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn delete_hour_before(&self, cutoff: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM market_history WHERE bucket_ts < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
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

    /// Run periodically (daily); keeps the WAL bounded on long uptimes.
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        Ok(())
    }
}

const TICK_COLUMNS: &str = "exchange, symbol, market_id, mark_price, index_price, last_price, \
     open_interest, open_interest_usd, funding_rate, next_funding_time, \
     volume_24h, quote_volume_24h, low_24h, high_24h, price_change_24h, \
     recorded_at, created_at";

fn row_to_tick(row: &rusqlite::Row) -> rusqlite::Result<RawTick> {
    Ok(RawTick {
        exchange: row.get(0)?,
        symbol: row.get(1)?,
        market_id: row.get(2)?,
        mark_price: row.get(3)?,
        index_price: row.get(4)?,
        last_price: row.get(5)?,
        open_interest: row.get(6)?,
        open_interest_usd: row.get(7)?,
        funding_rate: row.get(8)?,
        next_funding_time: row.get(9)?,
        volume_24h: row.get(10)?,
        quote_volume_24h: row.get(11)?,
        low_24h: row.get(12)?,
        high_24h: row.get(13)?,
        price_change_24h: row.get(14)?,
        recorded_at: row.get(15)?,
        created_at: row.get(16)?,
    })
}

pub(crate) fn row_to_aggregate(row: &rusqlite::Row) -> rusqlite::Result<Aggregate> {
    Ok(Aggregate {
        exchange: row.get(0)?,
        symbol: row.get(1)?,
        bucket_ts: row.get(2)?,
        avg_mark_price: row.get(3)?,
        avg_index_price: row.get(4)?,
        min_price: row.get(5)?,
        max_price: row.get(6)?,
        price_volatility: row.get(7)?,
        volume: row.get(8)?,
        quote_volume: row.get(9)?,
        avg_open_interest: row.get(10)?,
        max_open_interest: row.get(11)?,
        avg_open_interest_usd: row.get(12)?,
        max_open_interest_usd: row.get(13)?,
        avg_funding_rate: row.get(14)?,
        min_funding_rate: row.get(15)?,
        max_funding_rate: row.get(16)?,
        avg_funding_rate_annual: row.get(17)?,
        sample_count: row.get(18)?,
        normalized_symbol: row.get(19)?,
        created_at: row.get(20)?,
    })
}
