//! RabbitX WebSocket adapter (`markets` channel).

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

const WS_URL: &str = "wss://api.prod.rabbitx.io/ws";
const VENUE: &str = "rabbitx";

pub struct RabbitxAdapter;

impl RabbitxAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RabbitxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Vec<MarketRow>,
}

#[derive(Debug, Deserialize)]
struct MarketRow {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    market_price: String,
    #[serde(default)]
    index_price: String,
    #[serde(default)]
    last_trade_price: String,
    #[serde(default)]
    instant_funding_rate: String,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    market_volume_24h: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
    #[serde(default)]
    next_funding_time: Option<i64>,
}

#[async_trait]
impl VenueAdapter for RabbitxAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async rabbitx ws")?;
        info!(status = %resp.status(), "rabbitx ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({ "op": "subscribe", "channel": "markets" });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send markets subscription")?;

        let mut idle_check = interval(Duration::from_secs(10));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = idle_check.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("rabbitx ws idle for {:?}", last_seen.elapsed());
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
                            debug!(?frame, "rabbitx ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("rabbitx ws error: {e}"));
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
    if frame.channel != "markets" {
        return 0;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut emitted = 0usize;

    for row in frame.data {
        if let Some(status) = &row.status {
            if status != "active" {
                continue;
            }
        }
        let Ok(mark) = Decimal::from_str(&row.market_price) else {
            continue;
        };
        let oi = Decimal::from_str(&row.open_interest).unwrap_or(Decimal::ZERO);

        let mut tick = RawTick::new(VENUE, &row.id);
        tick.mark_price = row.market_price.clone();
        tick.index_price = if row.index_price.is_empty() {
            row.market_price.clone()
        } else {
            row.index_price.clone()
        };
        tick.last_price = if row.last_trade_price.is_empty() {
            row.market_price.clone()
        } else {
            row.last_trade_price.clone()
        };
        tick.funding_rate = if row.instant_funding_rate.is_empty() {
            "0".into()
        } else {
            row.instant_funding_rate.clone()
        };
        tick.open_interest = oi.normalize().to_string();
        tick.open_interest_usd = oi_usd(oi, mark);
        tick.quote_volume_24h = row.market_volume_24h;
        tick.high_24h = row.high_24h;
        tick.low_24h = row.low_24h;
        tick.next_funding_time = row.next_funding_time;
        tick.stamp(now_ms);

        sink.emit(tick);
        emitted += 1;
    }
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markets_frame_emits_active_rows() {
        let sink = TickSink::new();
        let frame = r#"{
            "channel": "markets",
            "data": [
                { "id": "BTC-USD", "status": "active",
                  "market_price": "50000", "index_price": "50002",
                  "last_trade_price": "49999", "instant_funding_rate": "0.0000095",
                  "open_interest": "310.5", "market_volume_24h": 98000000.0,
                  "high_24h": 51000.0, "low_24h": 48800.0,
                  "next_funding_time": 1700003600000 },
                { "id": "SUSPENDED-USD", "status": "paused", "market_price": "1" }
            ]
        }"#;

        assert_eq!(handle_text(frame, &sink), 1);
        let ticks = sink.drain();
        assert_eq!(ticks[0].symbol, "BTC-USD");
        assert_eq!(ticks[0].funding_rate, "0.0000095");
        assert_eq!(ticks[0].open_interest_usd, "15525000");
    }
}
