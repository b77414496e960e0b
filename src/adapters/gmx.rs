//! GMX REST adapter.
//!
//! Two endpoints: `/markets` lists listed markets (cached for an hour) and
//! `/tickers` carries the per-market stats polled every cycle. Timeouts are
//! skipped polls; hard failures accumulate until the tracker restarts the
//! loop through its reconnect policy.

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

const API_BASE: &str = "https://arbitrum-api.gmxinfra.io";
const VENUE: &str = "gmx";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct GmxAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl GmxAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            instruments: InstrumentCache::new(),
        }
    }

    async fn listed_symbols(&self) -> Result<Vec<String>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(cached) = self.instruments.get(now_ms) {
            return Ok(cached.items.clone());
        }

        let resp: MarketsResponse = self
            .http
            .get(format!("{}/markets", API_BASE))
            .send()
            .await
            .context("GET gmx markets")?
            .json()
            .await
            .context("parse gmx markets response")?;

        let symbols: Vec<String> = resp
            .markets
            .into_iter()
            .filter(|m| m.is_listed)
            .map(|m| m.symbol)
            .collect();

        debug!(count = symbols.len(), "gmx instrument list refreshed");
        self.instruments.store(symbols.clone(), now_ms);
        Ok(symbols)
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let listed: HashSet<String> = self.listed_symbols().await?.into_iter().collect();

        let tickers: Vec<Ticker> = self
            .http
            .get(format!("{}/tickers", API_BASE))
            .send()
            .await
            .context("GET gmx tickers")?
            .json()
            .await
            .context("parse gmx tickers response")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut emitted = 0usize;

        for ticker in tickers {
            if !listed.contains(&ticker.symbol) {
                continue;
            }
            let Ok(mark) = Decimal::from_str(&ticker.mark_price) else {
                continue;
            };
            let oi_usd_dec = Decimal::from_str(&ticker.open_interest_usd).unwrap_or(Decimal::ZERO);
            let oi_base = if mark.is_zero() {
                Decimal::ZERO
            } else {
                oi_usd_dec / mark
            };

            let mut tick = RawTick::new(VENUE, &ticker.symbol);
            tick.market_id = ticker.market_token.clone();
            tick.mark_price = ticker.mark_price.clone();
            tick.index_price = if ticker.index_price.is_empty() {
                ticker.mark_price.clone()
            } else {
                ticker.index_price.clone()
            };
            tick.last_price = ticker.mark_price.clone();
            tick.funding_rate = if ticker.funding_rate.is_empty() {
                "0".into()
            } else {
                ticker.funding_rate.clone()
            };
            tick.open_interest = oi_base.normalize().to_string();
            tick.open_interest_usd = oi_usd_dec.normalize().to_string();
            tick.quote_volume_24h = ticker.volume_24h_usd;
            tick.high_24h = ticker.high_24h;
            tick.low_24h = ticker.low_24h;
            tick.price_change_24h = ticker.price_change_24h;
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    symbol: String,
    #[serde(default)]
    is_listed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    #[serde(default)]
    market_token: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    open_interest_usd: String,
    #[serde(default)]
    volume_24h_usd: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
    #[serde(default)]
    price_change_24h: f64,
}

#[async_trait]
impl VenueAdapter for GmxAdapter {
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
                    debug!(markets = count, "gmx poll complete");
                }
                Err(e) => {
                    // A per-call timeout is a skipped poll, not a failure.
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("gmx poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "gmx poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("gmx poll failures exceeded threshold"));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_payload_parses() {
        let json = r#"[
            { "symbol": "BTC-USD", "marketToken": "0x47c031236e19d024b42f8AE6780E44A573170703",
              "markPrice": "50000.2", "indexPrice": "50000.0", "fundingRate": "0.00072",
              "openInterestUsd": "250000000", "volume24hUsd": 410000000.0,
              "high24h": 51000.0, "low24h": 48750.0, "priceChange24h": 1.9 }
        ]"#;
        let tickers: Vec<Ticker> = serde_json::from_str(json).unwrap();
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers[0].symbol, "BTC-USD");
        assert_eq!(tickers[0].open_interest_usd, "250000000");
    }

    #[test]
    fn unlisted_markets_are_dropped() {
        let json = r#"{ "markets": [
            { "symbol": "BTC-USD", "isListed": true },
            { "symbol": "OLD-USD", "isListed": false }
        ]}"#;
        let resp: MarketsResponse = serde_json::from_str(json).unwrap();
        let listed: Vec<&Market> = resp.markets.iter().filter(|m| m.is_listed).collect();
        assert_eq!(listed.len(), 1);
    }
}
