//! Aevo REST adapter. One `/markets` call carries both the instrument list
//! and the per-market stats; the active-name cache still honors the hourly
//! refresh contract so a delisting cannot linger for a whole day.

use super::{
    oi_usd, AdapterKind, InstrumentCache, TickSink, VenueAdapter, MAX_CONSECUTIVE_POLL_FAILURES,
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

const API_BASE: &str = "https://api.aevo.xyz";
const VENUE: &str = "aevo";
const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct AevoAdapter {
    http: reqwest::Client,
    instruments: InstrumentCache<String>,
}

impl AevoAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            instruments: InstrumentCache::new(),
        }
    }

    async fn poll_once(&self, sink: &TickSink) -> Result<usize> {
        let markets: Vec<Market> = self
            .http
            .get(format!("{}/markets", API_BASE))
            .query(&[("instrument_type", "PERPETUAL")])
            .send()
            .await
            .context("GET aevo markets")?
            .json()
            .await
            .context("parse aevo markets")?;

        let now_ms = chrono::Utc::now().timestamp_millis();

        // Refresh the cached active set at most hourly; between refreshes the
        // cached list is authoritative even if a single poll disagrees.
        let active: HashSet<String> = match self.instruments.get(now_ms) {
            Some(cached) => cached.items.iter().cloned().collect(),
            None => {
                let names: Vec<String> = markets
                    .iter()
                    .filter(|m| m.is_active)
                    .map(|m| m.instrument_name.clone())
                    .collect();
                self.instruments.store(names.clone(), now_ms);
                names.into_iter().collect()
            }
        };

        let mut emitted = 0usize;
        for market in markets {
            if !market.is_active || !active.contains(&market.instrument_name) {
                continue;
            }
            let Ok(mark) = Decimal::from_str(&market.mark_price) else {
                continue;
            };
            let oi = Decimal::from_str(&market.open_interest).unwrap_or(Decimal::ZERO);

            let mut tick = RawTick::new(VENUE, &market.instrument_name);
            tick.mark_price = market.mark_price.clone();
            tick.index_price = if market.index_price.is_empty() {
                market.mark_price.clone()
            } else {
                market.index_price.clone()
            };
            tick.last_price = market.mark_price.clone();
            tick.funding_rate = if market.funding_rate.is_empty() {
                "0".into()
            } else {
                market.funding_rate.clone()
            };
            tick.open_interest = oi.normalize().to_string();
            tick.open_interest_usd = oi_usd(oi, mark);
            tick.next_funding_time = market.next_funding_ts;
            tick.quote_volume_24h = market.daily_volume.parse().unwrap_or(0.0);
            tick.volume_24h = market.daily_volume_contracts.parse().unwrap_or(0.0);
            tick.high_24h = market.daily_high;
            tick.low_24h = market.daily_low;
            tick.price_change_24h = market.daily_change;
            tick.stamp(now_ms);

            sink.emit(tick);
            emitted += 1;
        }
        Ok(emitted)
    }
}

#[derive(Debug, Deserialize)]
struct Market {
    instrument_name: String,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_ts: Option<i64>,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    daily_volume: String,
    #[serde(default)]
    daily_volume_contracts: String,
    #[serde(default)]
    daily_high: f64,
    #[serde(default)]
    daily_low: f64,
    #[serde(default)]
    daily_change: f64,
}

#[async_trait]
impl VenueAdapter for AevoAdapter {
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
                    debug!(markets = count, "aevo poll complete");
                }
                Err(e) => {
                    if e.downcast_ref::<reqwest::Error>()
                        .map(|re| re.is_timeout())
                        .unwrap_or(false)
                    {
                        debug!("aevo poll timed out; skipping cycle");
                        continue;
                    }
                    consecutive_failures += 1;
                    warn!(error = %e, failures = consecutive_failures, "aevo poll failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_POLL_FAILURES {
                        return Err(e.context("aevo poll failures exceeded threshold"));
                    }
                }
            }
        }
    }
}
