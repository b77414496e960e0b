//! dYdX v4 indexer WebSocket adapter (`v4_markets` channel).
//!
//! The initial `subscribed` frame is a full market snapshot; later
//! `channel_data` frames are sparse per-market deltas. Deltas without an
//! oracle price carry nothing the tick schema needs and are skipped; the
//! next full-price delta supersedes them anyway.

use super::{oi_usd, AdapterKind, TickSink, VenueAdapter, SUBSCRIPTION_IDLE_TIMEOUT};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

const WS_URL: &str = "wss://indexer.dydx.trade/v4/ws";
const VENUE: &str = "dydx";

pub struct DydxAdapter;

impl DydxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DydxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    contents: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MarketSnapshot {
    markets: HashMap<String, Market>,
}

#[derive(Debug, Deserialize)]
struct MarketDelta {
    #[serde(default)]
    trading: HashMap<String, Market>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    oracle_price: Option<String>,
    #[serde(default)]
    next_funding_rate: Option<String>,
    #[serde(default)]
    open_interest: Option<String>,
    #[serde(default)]
    volume24_h: Option<String>,
    #[serde(default)]
    price_change24_h: Option<String>,
}

#[async_trait]
impl VenueAdapter for DydxAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async dydx ws")?;
        info!(status = %resp.status(), "dydx ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({ "type": "subscribe", "channel": "v4_markets" });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send v4_markets subscription")?;

        // The indexer pings on its own schedule; we only watch for silence.
        let mut idle_check = interval(Duration::from_secs(10));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = idle_check.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("dydx ws idle for {:?}", last_seen.elapsed());
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
                            debug!(?frame, "dydx ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("dydx ws error: {e}"));
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
    if frame.channel != "v4_markets" {
        return 0;
    }

    let markets: HashMap<String, Market> = match frame.kind.as_str() {
        "subscribed" => match serde_json::from_value::<MarketSnapshot>(frame.contents) {
            Ok(s) => s.markets,
            Err(_) => return 0,
        },
        "channel_data" => match serde_json::from_value::<MarketDelta>(frame.contents) {
            Ok(d) => d.trading,
            Err(_) => return 0,
        },
        _ => return 0,
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut emitted = 0usize;

    for (ticker, market) in markets {
        if let Some(status) = &market.status {
            if status != "ACTIVE" {
                continue;
            }
        }
        let Some(oracle) = market.oracle_price.clone().filter(|p| !p.is_empty()) else {
            continue;
        };
        let Ok(price) = Decimal::from_str(&oracle) else {
            continue;
        };

        let oi = market
            .open_interest
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO);

        let mut tick = RawTick::new(VENUE, &ticker);
        tick.mark_price = oracle.clone();
        tick.index_price = oracle.clone();
        tick.last_price = oracle;
        tick.funding_rate = market.next_funding_rate.clone().unwrap_or_else(|| "0".into());
        tick.open_interest = oi.normalize().to_string();
        tick.open_interest_usd = oi_usd(oi, price);
        tick.quote_volume_24h = market
            .volume24_h
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        tick.price_change_24h = market
            .price_change24_h
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        tick.stamp(now_ms);

        sink.emit(tick);
        emitted += 1;
    }
    emitted
}
