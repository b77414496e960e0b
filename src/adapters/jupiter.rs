//! Jupiter perps REST adapter. A handful of markets, polled every 15 s;
//! funding is already hourly.

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

const API_BASE: &str = "https://perps-api.jup.ag/v1";
const VENUE: &str = "jupiter";
const POLL_INTERVAL: Duration = Duration::from_secs(15);

pub struct JupiterAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl JupiterAdapter {
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

        let instruments: Vec<Instrument> = self
            .http
            .get(format!("{}/instruments", API_BASE))
            .send()
            .await
            .context("GET jupiter instruments")?
            .json()
            .await
            .context("parse jupiter instruments")?;

        let symbols: Vec<String> = instruments
            .into_iter()
            .filter(|i| i.active)
            .map(|i| i.symbol)
            .collect();
        self.instruments.store(symbols.clone(), now_ms);
        Ok(symbols)
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let active: HashSet<String> = self.active_symbols().await?.into_iter().collect();

        let stats: Vec<MarketStats> = self
            .http
            .get(format!("{}/market-stats", API_BASE))
            .send()
            .await
            .context("GET jupiter market stats")?
            .json()
            .await
            .context("parse jupiter market stats")?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut emitted = 0usize;

        for stat in stats {
            if !active.contains(&stat.symbol) {
                continue;
            }
            let Ok(mark) = Decimal::from_str(&stat.mark_price) else {
                continue;
            };
            let oi = Decimal::from_str(&stat.open_interest).unwrap_or(Decimal::ZERO);

            let mut tick = RawTick::new(VENUE, &stat.symbol);
            tick.mark_price = stat.mark_price.clone();
            tick.index_price = if stat.index_price.is_empty() {
                stat.mark_price.clone()
            } else {
                stat.index_price.clone()
            };
            tick.last_price = stat.mark_price.clone();
            tick.funding_rate = if stat.funding_rate_hourly.is_empty() {
                "0".into()
            } else {
                stat.funding_rate_hourly.clone()
            };
            tick.open_interest = oi.normalize().to_string();
            tick.open_interest_usd = (oi * mark).normalize().to_string();
            tick.volume_24h = stat.volume_24h;
            tick.high_24h = stat.high_24h;
            tick.low_24h = stat.low_24h;
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct Instrument {
    symbol: String,
    #[serde(default)]
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketStats {
    symbol: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    funding_rate_hourly: String,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
}

#[async_trait]
impl VenueAdapter for JupiterAdapter {
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
                    debug!(markets = count, "jupiter poll complete");
                }
                Err(e) => {
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("jupiter poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "jupiter poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("jupiter poll failures exceeded threshold"));
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
    fn stats_payload_parses() {
        let json = r#"[
            { "symbol": "SOL", "markPrice": "150.12", "indexPrice": "150.10",
              "fundingRateHourly": "0.0000125", "openInterest": "820000",
              "volume24h": 95000000.0, "high24h": 155.0, "low24h": 147.0 }
        ]"#;
        let stats: Vec<MarketStats> = serde_json::from_str(json).unwrap();
        assert_eq!(stats[0].symbol, "SOL");
        assert_eq!(stats[0].funding_rate_hourly, "0.0000125");
    }
}
