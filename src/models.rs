//! Core data model shared by the ingestion pipeline, both stores and the API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// One observation for one (exchange, original symbol).
///
/// Prices, open interest and funding rates are kept as decimal strings end to
/// end; they only become `Decimal` inside aggregation arithmetic. The 24 h
/// statistics are plain floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTick {
    pub exchange: String,
    /// Symbol exactly as the venue reports it (e.g. `BTC-USD-PERP`, `kPEPE`).
    pub symbol: String,
    /// Venue market identifier, opaque to the pipeline.
    pub market_id: String,
    pub mark_price: String,
    pub index_price: String,
    pub last_price: String,
    /// Open interest in base units.
    pub open_interest: String,
    pub open_interest_usd: String,
    /// Funding rate exactly as reported; the payout interval is venue-defined.
    pub funding_rate: String,
    /// Next funding event, milliseconds, when the venue exposes it.
    pub next_funding_time: Option<i64>,
    pub volume_24h: f64,
    pub quote_volume_24h: f64,
    pub low_24h: f64,
    pub high_24h: f64,
    pub price_change_24h: f64,
    /// Producer clock, milliseconds.
    pub recorded_at: i64,
    /// `recorded_at / 1000`, the ordering key.
    pub created_at: i64,
}

impl RawTick {
    /// Empty tick for a venue symbol; numeric strings default to `"0"` so a
    /// single writer path covers venues that omit fields.
    pub fn new(exchange: &str, symbol: &str) -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        Self {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            market_id: symbol.to_string(),
            mark_price: "0".to_string(),
            index_price: "0".to_string(),
            last_price: "0".to_string(),
            open_interest: "0".to_string(),
            open_interest_usd: "0".to_string(),
            funding_rate: "0".to_string(),
            next_funding_time: None,
            volume_24h: 0.0,
            quote_volume_24h: 0.0,
            low_24h: 0.0,
            high_24h: 0.0,
            price_change_24h: 0.0,
            recorded_at: now_ms,
            created_at: now_ms / 1000,
        }
    }

    /// Stamp producer timestamps. `created_at` is always the truncated form
    /// of `recorded_at` so bucket math never sees a mismatched pair.
    pub fn stamp(&mut self, recorded_at_ms: i64) {
        self.recorded_at = recorded_at_ms;
        self.created_at = recorded_at_ms / 1000;
    }

    /// Every decimal-string field must parse; a tick that fails here is
    /// rejected before it reaches the WRITE store.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("mark_price", &self.mark_price),
            ("index_price", &self.index_price),
            ("last_price", &self.last_price),
            ("open_interest", &self.open_interest),
            ("open_interest_usd", &self.open_interest_usd),
            ("funding_rate", &self.funding_rate),
        ] {
            if Decimal::from_str(value).is_err() {
                return Err(format!("{} is not a decimal: {:?}", name, value));
            }
        }
        Ok(())
    }
}

/// One roll-up row per (exchange, original symbol, bucket). The same shape
/// serves the minute and the hour tier; only the bucket width differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub exchange: String,
    pub symbol: String,
    /// Bucket start, seconds. Buckets are half-open `[b, b+width)`.
    pub bucket_ts: i64,
    pub avg_mark_price: String,
    pub avg_index_price: String,
    pub min_price: String,
    pub max_price: String,
    /// `(max - min) / avg * 100`.
    pub price_volatility: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub avg_open_interest: String,
    pub max_open_interest: String,
    pub avg_open_interest_usd: String,
    pub max_open_interest_usd: String,
    pub avg_funding_rate: String,
    pub min_funding_rate: String,
    pub max_funding_rate: String,
    /// Annualized percent, computed with the venue interval at roll-up time.
    pub avg_funding_rate_annual: f64,
    pub sample_count: i64,
    pub normalized_symbol: String,
    pub created_at: i64,
}

/// Read projection: newest state per (canonical symbol, exchange).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestMarket {
    /// Canonical base-asset symbol, the cross-venue merge key.
    pub symbol: String,
    pub exchange: String,
    pub original_symbol: String,
    pub mark_price: String,
    pub index_price: String,
    pub open_interest_usd: String,
    pub volume_24h: f64,
    pub funding_rate: String,
    pub funding_rate_hourly: String,
    /// Percent per year.
    pub funding_rate_annual: f64,
    pub next_funding_time: Option<i64>,
    pub price_change_24h: f64,
    pub low_24h: f64,
    pub high_24h: f64,
    pub volatility_24h: Option<f64>,
    pub volatility_7d: Option<f64>,
    pub atr_14: Option<f64>,
    pub bb_width: Option<f64>,
    pub updated_at: i64,
}

/// Funding-rate moving average over one look-back window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingMa {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: String,
    pub avg_funding_rate: String,
    pub avg_funding_annual: f64,
    pub sample_count: i64,
    pub calculated_at: i64,
}

/// Cross-venue funding spread for one (symbol, pair, window).
///
/// The long leg always carries the lower average rate; ties resolve to the
/// lexicographically smaller exchange id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub symbol: String,
    pub long_exchange: String,
    pub short_exchange: String,
    pub timeframe: String,
    pub long_rate: String,
    pub short_rate: String,
    pub long_apr: f64,
    pub short_apr: f64,
    pub spread: String,
    pub spread_apr: f64,
    pub stability_score: i64,
    pub is_stable: bool,
    pub calculated_at: i64,
}

/// Look-back windows used by the analytics cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaWindow {
    H24,
    D3,
    D7,
    D14,
    D30,
}

impl MaWindow {
    pub const ALL: [MaWindow; 5] = [
        MaWindow::H24,
        MaWindow::D3,
        MaWindow::D7,
        MaWindow::D14,
        MaWindow::D30,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MaWindow::H24 => "24h",
            MaWindow::D3 => "3d",
            MaWindow::D7 => "7d",
            MaWindow::D14 => "14d",
            MaWindow::D30 => "30d",
        }
    }

    pub fn hours(&self) -> i64 {
        match self {
            MaWindow::H24 => 24,
            MaWindow::D3 => 72,
            MaWindow::D7 => 168,
            MaWindow::D14 => 336,
            MaWindow::D30 => 720,
        }
    }

    pub fn parse(s: &str) -> Option<MaWindow> {
        match s {
            "24h" | "1d" => Some(MaWindow::H24),
            "3d" => Some(MaWindow::D3),
            "7d" => Some(MaWindow::D7),
            "14d" => Some(MaWindow::D14),
            "30d" => Some(MaWindow::D30),
            _ => None,
        }
    }
}

/// Tracker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Initialized,
    Running,
    Error,
    Stopped,
    Failed,
    Disconnected,
}

impl TrackerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerState::Initialized => "initialized",
            TrackerState::Running => "running",
            TrackerState::Error => "error",
            TrackerState::Stopped => "stopped",
            TrackerState::Failed => "failed",
            TrackerState::Disconnected => "disconnected",
        }
    }
}

/// Persisted tracker status, one row per exchange in the READ store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStatusRow {
    pub exchange: String,
    pub state: String,
    pub last_message_at: Option<i64>,
    pub last_error: Option<String>,
    pub reconnect_count: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_truncates_created_at() {
        let mut tick = RawTick::new("hyperliquid", "BTC");
        tick.stamp(16_999);
        assert_eq!(tick.recorded_at, 16_999);
        assert_eq!(tick.created_at, 16);
    }

    #[test]
    fn validate_rejects_non_decimal_fields() {
        let mut tick = RawTick::new("hyperliquid", "BTC");
        assert!(tick.validate().is_ok());
        tick.mark_price = "not-a-number".to_string();
        assert!(tick.validate().is_err());
    }

    #[test]
    fn ma_window_round_trip() {
        for w in MaWindow::ALL {
            assert_eq!(MaWindow::parse(w.as_str()), Some(w));
        }
        assert_eq!(MaWindow::parse("24h"), Some(MaWindow::H24));
        assert_eq!(MaWindow::parse("6h"), None);
    }
}
