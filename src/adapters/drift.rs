//! Drift DLOB WebSocket adapter.
//!
//! One `perp_markets` subscription covers every perp market; the server
//! streams full per-market stats plus periodic heartbeats. Funding is the
//! per-hour rate.

use super::{oi_usd, AdapterKind, TickSink, VenueAdapter, SUBSCRIPTION_IDLE_TIMEOUT};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

const WS_URL: &str = "wss://dlob.drift.trade/ws";
const VENUE: &str = "drift";

pub struct DriftAdapter;

impl DriftAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DriftAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    channel: String,
    #[serde(default)]
    data: Vec<PerpMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerpMarket {
    symbol: String,
    market_index: u32,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    oracle_price: String,
    #[serde(default)]
    last_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    base_volume24h: f64,
    #[serde(default)]
    quote_volume24h: f64,
    #[serde(default)]
    high24h: f64,
    #[serde(default)]
    low24h: f64,
}

#[async_trait]
impl VenueAdapter for DriftAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async drift ws")?;
        info!(status = %resp.status(), "drift ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({ "type": "subscribe", "channel": "perp_markets" });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send perp_markets subscription")?;

        let mut idle_check = interval(Duration::from_secs(10));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = idle_check.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("drift ws idle for {:?}", last_seen.elapsed());
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(());
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            last_seen = Instant::now();
                            handle_text(&text, &sink);
                        }
                        Ok(Message::Ping(payload)) => {
                            last_seen = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "drift ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("drift ws error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

fn handle_text(text: &str, sink: &TickSink) -> usize {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    if frame.channel != "perp_markets" {
        return 0;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut emitted = 0usize;

    for market in frame.data {
        if let Some(status) = &market.status {
            if status != "active" {
                continue;
            }
        }
        let Ok(mark) = Decimal::from_str(&market.mark_price) else {
            continue;
        };
        let oi = Decimal::from_str(&market.open_interest).unwrap_or(Decimal::ZERO);

        let mut tick = RawTick::new(VENUE, &market.symbol);
        tick.market_id = market.market_index.to_string();
        tick.mark_price = market.mark_price.clone();
        tick.index_price = if market.oracle_price.is_empty() {
            market.mark_price.clone()
        } else {
            market.oracle_price.clone()
        };
        tick.last_price = if market.last_price.is_empty() {
            market.mark_price.clone()
        } else {
            market.last_price.clone()
        };
        tick.funding_rate = if market.funding_rate.is_empty() {
            "0".into()
        } else {
            market.funding_rate.clone()
        };
        tick.open_interest = oi.normalize().to_string();
        tick.open_interest_usd = oi_usd(oi, mark);
        tick.volume_24h = market.base_volume24h;
        tick.quote_volume_24h = market.quote_volume24h;
        tick.high_24h = market.high24h;
        tick.low_24h = market.low24h;
        tick.stamp(now_ms);

        sink.emit(tick);
        emitted += 1;
    }
    emitted
}
