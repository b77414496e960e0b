//! Vertex gateway WebSocket adapter. All prices and rates arrive as x18
//! fixed-point strings; funding pays every 4 hours.

use super::{from_x18, oi_usd, AdapterKind, TickSink, VenueAdapter, KEEPALIVE_INTERVAL, SUBSCRIPTION_IDLE_TIMEOUT};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

const WS_URL: &str = "wss://gateway.prod.vertexprotocol.com/v1/subscribe";
const VENUE: &str = "vertex";

pub struct VertexAdapter;

impl VertexAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VertexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
struct Product {
    product_id: u32,
    symbol: String,
    #[serde(default)]
    mark_price_x18: String,
    #[serde(default)]
    index_price_x18: String,
    #[serde(default)]
    last_price_x18: String,
    #[serde(default)]
    funding_rate_x18: String,
    #[serde(default)]
    open_interest_x18: String,
    #[serde(default)]
    volume_24h_x18: String,
    #[serde(default)]
    quote_volume_24h_x18: String,
}

#[async_trait]
impl VenueAdapter for VertexAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async vertex ws")?;
        info!(status = %resp.status(), "vertex ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "method": "subscribe",
            "stream": { "type": "market_snapshot", "product_type": "perp" },
            "id": 1,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send market_snapshot subscription")?;

        let mut ping = interval(KEEPALIVE_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("vertex ws idle for {:?}", last_seen.elapsed());
                    }
                    let _ = write
                        .send(Message::Text(r#"{"method":"ping","id":0}"#.to_string()))
                        .await;
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
                            debug!(?frame, "vertex ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("vertex ws error: {e}"));
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
    if frame.kind != "market_snapshot" {
        return 0;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut emitted = 0usize;

    for product in frame.products {
        let mark = from_x18(&product.mark_price_x18);
        let Ok(mark_dec) = Decimal::from_str(&mark) else {
            continue;
        };
        if mark_dec.is_zero() {
            continue;
        }
        let oi = Decimal::from_str(&from_x18(&product.open_interest_x18))
            .unwrap_or(Decimal::ZERO);

        let mut tick = RawTick::new(VENUE, &product.symbol);
        tick.market_id = product.product_id.to_string();
        tick.mark_price = mark;
        tick.index_price = from_x18(&product.index_price_x18);
        tick.last_price = from_x18(&product.last_price_x18);
        tick.funding_rate = from_x18(&product.funding_rate_x18);
        tick.open_interest = oi.normalize().to_string();
        tick.open_interest_usd = oi_usd(oi, mark_dec);
        tick.volume_24h = from_x18(&product.volume_24h_x18).parse().unwrap_or(0.0);
        tick.quote_volume_24h = from_x18(&product.quote_volume_24h_x18)
            .parse()
            .unwrap_or(0.0);
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
    fn x18_snapshot_is_rescaled() {
        let sink = TickSink::new();
        let frame = r#"{
            "type": "market_snapshot",
            "products": [
                { "product_id": 2, "symbol": "BTC-USD",
                  "mark_price_x18": "50000000000000000000000",
                  "index_price_x18": "50010000000000000000000",
                  "last_price_x18": "49995000000000000000000",
                  "funding_rate_x18": "400000000000000",
                  "open_interest_x18": "1500000000000000000000",
                  "volume_24h_x18": "2000000000000000000000",
                  "quote_volume_24h_x18": "100000000000000000000000000" },
                { "product_id": 0, "symbol": "USDC", "mark_price_x18": "0" }
            ]
        }"#;

        assert_eq!(handle_text(frame, &sink), 1);
        let ticks = sink.drain();
        assert_eq!(ticks[0].symbol, "BTC-USD");
        assert_eq!(ticks[0].mark_price, "50000");
        assert_eq!(ticks[0].funding_rate, "0.0004");
        assert_eq!(ticks[0].open_interest, "1500");
        assert_eq!(ticks[0].open_interest_usd, "75000000");
        assert_eq!(ticks[0].volume_24h, 2000.0);
    }
}
