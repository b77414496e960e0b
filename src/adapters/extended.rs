//! Extended REST adapter. A single `/info/markets` call carries the
//! instrument flags and nested per-market stats; funding pays every 4 h.

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

const API_BASE: &str = "https://api.extended.exchange/api/v1";
const VENUE: &str = "extended";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct ExtendedAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl ExtendedAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            instruments: InstrumentCache::new(),
        }
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let resp: MarketsResponse = self
            .http
            .get(format!("{}/info/markets", API_BASE))
            .send()
            .await
            .context("GET extended markets")?
            .json()
            .await
            .context("parse extended markets")?;

        if resp.status != "OK" {
            anyhow::bail!("extended markets returned status {}", resp.status);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let active: HashSet<String> = match self.instruments.get(now_ms) {
            Some(cached) => cached.items.iter().cloned().collect(),
            None => {
                let names: Vec<String> = resp
                    .data
                    .iter()
                    .filter(|m| m.active)
                    .map(|m| m.name.clone())
                    .collect();
                self.instruments.store(names.clone(), now_ms);
                names.into_iter().collect()
            }
        };

        let mut emitted = 0usize;
        for market in resp.data {
            if !market.active || !active.contains(&market.name) {
                continue;
            }
            let stats = market.market_stats;
            let Ok(mark) = Decimal::from_str(&stats.mark_price) else {
                continue;
            };
            let oi = Decimal::from_str(&stats.open_interest).unwrap_or(Decimal::ZERO);

            let mut tick = RawTick::new(VENUE, &market.name);
            tick.mark_price = stats.mark_price.clone();
            tick.index_price = if stats.index_price.is_empty() {
                stats.mark_price.clone()
            } else {
                stats.index_price.clone()
            };
            tick.last_price = if stats.last_price.is_empty() {
                stats.mark_price.clone()
            } else {
                stats.last_price.clone()
            };
            tick.funding_rate = if stats.funding_rate.is_empty() {
                "0".into()
            } else {
                stats.funding_rate.clone()
            };
            tick.open_interest = oi.normalize().to_string();
            tick.open_interest_usd = (oi * mark).normalize().to_string();
            tick.next_funding_time = stats.next_funding_time;
            tick.volume_24h = stats.daily_volume_base.parse().unwrap_or(0.0);
            tick.quote_volume_24h = stats.daily_volume.parse().unwrap_or(0.0);
            tick.high_24h = stats.daily_high;
            tick.low_24h = stats.daily_low;
            tick.price_change_24h = stats.daily_price_change_percentage;
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: Vec<Market>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    name: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    market_stats: MarketStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketStats {
    #[serde(default)]
    last_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: Option<i64>,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    daily_volume: String,
    #[serde(default)]
    daily_volume_base: String,
    #[serde(default)]
    daily_high: f64,
    #[serde(default)]
    daily_low: f64,
    #[serde(default)]
    daily_price_change_percentage: f64,
}

#[async_trait]
impl VenueAdapter for ExtendedAdapter {
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
                    debug!(markets = count, "extended poll complete");
                }
                Err(e) => {
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("extended poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "extended poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("extended poll failures exceeded threshold"));
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
    fn nested_market_stats_parse() {
        let json = r#"{ "status": "OK", "data": [
            { "name": "BTC-USD", "active": true, "marketStats": {
                "lastPrice": "50000.0", "markPrice": "50000.6", "indexPrice": "50000.2",
                "fundingRate": "0.00031", "nextFundingTime": 1700014400000,
                "openInterest": "210.4", "dailyVolume": "160000000",
                "dailyVolumeBase": "3200", "dailyHigh": 51200.0, "dailyLow": 48600.0,
                "dailyPriceChangePercentage": -0.6 } },
            { "name": "DELISTED-USD", "active": false, "marketStats": {} }
        ]}"#;
        let resp: MarketsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.status, "OK");
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].market_stats.funding_rate, "0.00031");
        assert!(!resp.data[1].active);
    }
}
