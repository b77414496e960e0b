//! ApeX REST adapter. Cheap tokens list with a `1000` multiplier prefix
//! (`1000PEPEUSDT`); canonicalization strips it downstream.

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

const API_BASE: &str = "https://pro.apex.exchange/api/v1";
const VENUE: &str = "apex";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct ApexAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl ApexAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            instruments: InstrumentCache::new(),
        }
    }

    async fn tradable_symbols(&self) -> Result<Vec<String>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Some(cached) = self.instruments.get(now_ms) {
            return Ok(cached.items.clone());
        }

        let resp: SymbolsResponse = self
            .http
            .get(format!("{}/symbols", API_BASE))
            .send()
            .await
            .context("GET apex symbols")?
            .json()
            .await
            .context("parse apex symbols")?;

        let symbols: Vec<String> = resp
            .data
            .perpetual_contract
            .into_iter()
            .filter(|c| c.enable_trade)
            .map(|c| c.symbol)
            .collect();
        self.instruments.store(symbols.clone(), now_ms);
        Ok(symbols)
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let tradable: HashSet<String> = self.tradable_symbols().await?.into_iter().collect();

        let resp: TickerResponse = self
            .http
            .get(format!("{}/ticker", API_BASE))
            .query(&[("symbol", "all")])
            .send()
            .await
            .context("GET apex tickers")?
            .json()
            .await
            .context("parse apex tickers")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut emitted = 0usize;

        for ticker in resp.data {
            if !tradable.contains(&ticker.symbol) {
                continue;
            }
            let Ok(mark) = Decimal::from_str(&ticker.mark_price) else {
                continue;
            };
            let oi = Decimal::from_str(&ticker.open_interest).unwrap_or(Decimal::ZERO);

            let mut tick = RawTick::new(VENUE, &ticker.symbol);
            tick.mark_price = ticker.mark_price.clone();
            tick.index_price = if ticker.index_price.is_empty() {
                ticker.mark_price.clone()
            } else {
                ticker.index_price.clone()
            };
            tick.last_price = if ticker.last_price.is_empty() {
                ticker.mark_price.clone()
            } else {
                ticker.last_price.clone()
            };
            tick.funding_rate = if ticker.funding_rate.is_empty() {
                "0".into()
            } else {
                ticker.funding_rate.clone()
            };
            tick.open_interest = oi.normalize().to_string();
            tick.open_interest_usd = (oi * mark).normalize().to_string();
            tick.next_funding_time = ticker
                .next_funding_time
                .as_deref()
                .and_then(|s| s.parse().ok());
            tick.volume_24h = ticker.volume_24h.parse().unwrap_or(0.0);
            tick.quote_volume_24h = ticker.turnover_24h.parse().unwrap_or(0.0);
            tick.high_24h = ticker.high_price_24h.parse().unwrap_or(0.0);
            tick.low_24h = ticker.low_price_24h.parse().unwrap_or(0.0);
            // price24hPcnt is a ratio; store percent like every other venue.
            tick.price_change_24h = ticker.price_24h_pcnt.parse::<f64>().unwrap_or(0.0) * 100.0;
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    data: SymbolsData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolsData {
    #[serde(default)]
    perpetual_contract: Vec<ContractConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractConfig {
    symbol: String,
    #[serde(default)]
    enable_trade: bool,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    data: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    symbol: String,
    #[serde(default)]
    last_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: Option<String>,
    #[serde(default)]
    volume_24h: String,
    #[serde(default)]
    turnover_24h: String,
    #[serde(default)]
    high_price_24h: String,
    #[serde(default)]
    low_price_24h: String,
    #[serde(default)]
    price_24h_pcnt: String,
}

#[async_trait]
impl VenueAdapter for ApexAdapter {
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
                    debug!(markets = count, "apex poll complete");
                }
                Err(e) => {
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("apex poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "apex poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("apex poll failures exceeded threshold"));
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
        let json = r#"{ "data": [
            { "symbol": "1000PEPEUSDT", "lastPrice": "0.0125", "markPrice": "0.01251",
              "indexPrice": "0.01250", "openInterest": "8200000",
              "fundingRate": "0.0003", "nextFundingTime": "1700003600000",
              "volume24h": "51000000", "turnover24h": "640000",
              "highPrice24h": "0.0131", "lowPrice24h": "0.0119",
              "price24hPcnt": "0.021" }
        ]}"#;
        let resp: TickerResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.data[0].symbol, "1000PEPEUSDT");
        assert_eq!(resp.data[0].price_24h_pcnt, "0.021");
    }

    #[test]
    fn symbols_filter_by_enable_trade() {
        let json = r#"{ "data": { "perpetualContract": [
            { "symbol": "BTCUSDT", "enableTrade": true },
            { "symbol": "DELISTEDUSDT", "enableTrade": false }
        ]}}"#;
        let resp: SymbolsResponse = serde_json::from_str(json).unwrap();
        let tradable: Vec<_> = resp
            .data
            .perpetual_contract
            .iter()
            .filter(|c| c.enable_trade)
            .collect();
        assert_eq!(tradable.len(), 1);
    }
}
