//! Bluefin REST adapter.

use super::{
    AdapterKind, InstrumentCache, TickSink, VenueAdapter, MAX_CONSECUTIVE_POLL_FAILURES,
};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, warn};

const API_BASE: &str = "https://dapi.api.sui-prod.bluefin.io";
const VENUE: &str = "bluefin";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct BluefinAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl BluefinAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            instruments: InstrumentCache::new(),
        }
    }

    async fn active_symbols(&self) -> Result<Vec<String>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(cached) = self.instruments.get(now_ms) {
            return Ok(cached.items.clone());
        }

        let info: ExchangeInfo = self
            .http
            .get(format!("{}/exchangeInfo", API_BASE))
            .send()
            .await
            .context("GET bluefin exchangeInfo")?
            .json()
            .await
            .context("parse bluefin exchangeInfo")?;

        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "ACTIVE")
            .map(|s| s.symbol)
            .collect();
        self.instruments.store(symbols.clone(), now_ms);
        Ok(symbols)
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let active: HashSet<String> = self.active_symbols().await?.into_iter().collect();

        let rows: Vec<MarketData> = self
            .http
            .get(format!("{}/marketData", API_BASE))
            .send()
            .await
            .context("GET bluefin marketData")?
            .json()
            .await
            .context("parse bluefin marketData")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut emitted = 0usize;

        for row in rows {
            if !active.contains(&row.symbol) {
                continue;
            }
            let Ok(mark) = Decimal::from_str(&row.mark_price) else {
                continue;
            };
            let oi = Decimal::from_str(&row.open_interest).unwrap_or(Decimal::ZERO);

            let mut tick = RawTick::new(VENUE, &row.symbol);
            tick.mark_price = row.mark_price.clone();
            tick.index_price = if row.index_price.is_empty() {
                row.mark_price.clone()
            } else {
                row.index_price.clone()
            };
            tick.last_price = if row.last_price.is_empty() {
                row.mark_price.clone()
            } else {
                row.last_price.clone()
            };
            tick.funding_rate = if row.funding_rate.is_empty() {
                "0".into()
            } else {
                row.funding_rate.clone()
            };
            tick.open_interest = oi.normalize().to_string();
            tick.open_interest_usd = (oi * mark).normalize().to_string();
            tick.next_funding_time = row.next_funding_time;
            tick.volume_24h = row.volume_24h.parse().unwrap_or(0.0);
            tick.quote_volume_24h = row.quote_volume_24h.parse().unwrap_or(0.0);
            tick.high_24h = row.high_24h.parse().unwrap_or(0.0);
            tick.low_24h = row.low_24h.parse().unwrap_or(0.0);
            tick.price_change_24h = row.price_change_percent_24h.parse().unwrap_or(0.0);
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    symbol: String,
    #[serde(default, rename = "markPrice")]
    mark_price: String,
    #[serde(default, rename = "indexPrice")]
    index_price: String,
    #[serde(default, rename = "lastPrice")]
    last_price: String,
    #[serde(default, rename = "fundingRate")]
    funding_rate: String,
    #[serde(default, rename = "nextFundingTime")]
    next_funding_time: Option<i64>,
    #[serde(default, rename = "openInterest")]
    open_interest: String,
    #[serde(default, rename = "_24hrVolume")]
    volume_24h: String,
    #[serde(default, rename = "_24hrQuoteVolume")]
    quote_volume_24h: String,
    #[serde(default, rename = "_24hrHigh")]
    high_24h: String,
    #[serde(default, rename = "_24hrLow")]
    low_24h: String,
    #[serde(default, rename = "_24hrPriceChangePercent")]
    price_change_percent_24h: String,
}

#[async_trait]
impl VenueAdapter for BluefinAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Pull {
            poll_interval: POLL_INTERVAL,
        }
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures = 0u32;

        loop {
            ticker.tick().await;
            match self.poll_once(&sink).await {
                Ok(count) => {
                    consecutive_failures = 0;
                    debug!(markets = count, "bluefin poll complete");
                }
                Err(e) => {
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("bluefin poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "bluefin poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("bluefin poll failures exceeded threshold"));
                    }
                }
            }
        }
    }
}
