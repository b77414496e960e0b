//! Orderly WebSocket adapter (`tickers` topic). The server drives the
//! keepalive with `{"event":"ping"}` frames that must be answered in kind.

use super::{AdapterKind, TickSink, VenueAdapter, SUBSCRIPTION_IDLE_TIMEOUT};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};

const WS_URL: &str = "wss://ws-evm.orderly.org/ws/stream/market";
const VENUE: &str = "orderly";

pub struct OrderlyAdapter;

impl OrderlyAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OrderlyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    data: Vec<Ticker>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    symbol: String,
    #[serde(default)]
    mark_price: f64,
    #[serde(default)]
    index_price: f64,
    #[serde(default)]
    last_price: f64,
    #[serde(default)]
    open_interest: f64,
    #[serde(default)]
    funding_rate: f64,
    #[serde(default)]
    next_funding_time: Option<i64>,
    #[serde(default)]
    volume_24h: f64,
    #[serde(default)]
    amount_24h: f64,
    #[serde(default)]
    high_24h: f64,
    #[serde(default)]
    low_24h: f64,
}

#[async_trait]
impl VenueAdapter for OrderlyAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async orderly ws")?;
        info!(status = %resp.status(), "orderly ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({ "id": "perptrack-tickers", "event": "subscribe", "topic": "tickers" });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send tickers subscription")?;

        let mut idle_check = interval(Duration::from_secs(10));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = idle_check.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("orderly ws idle for {:?}", last_seen.elapsed());
                    }
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(());
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            last_seen = Instant::now();
                            if is_server_ping(&text) {
                                let _ = write
                                    .send(Message::Text(r#"{"event":"pong"}"#.to_string()))
                                    .await;
                                continue;
                            }
                            handle_text(&text, &sink);
                        }
                        Ok(Message::Ping(payload)) => {
                            last_seen = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "orderly ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("orderly ws error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

fn is_server_ping(text: &str) -> bool {
    serde_json::from_str::<WsFrame>(text)
        .map(|f| f.event.as_deref() == Some("ping"))
        .unwrap_or(false)
}

fn handle_text(text: &str, sink: &TickSink) -> usize {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return 0,
    };
    if frame.topic.as_deref() != Some("tickers") {
        return 0;
    }

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut emitted = 0usize;

    for ticker in frame.data {
        if ticker.mark_price <= 0.0 {
            continue;
        }

        let mut tick = RawTick::new(VENUE, &ticker.symbol);
        tick.mark_price = format_price(ticker.mark_price);
        tick.index_price = format_price(ticker.index_price);
        tick.last_price = format_price(ticker.last_price);
        tick.funding_rate = format_price(ticker.funding_rate);
        tick.open_interest = format_price(ticker.open_interest);
        tick.open_interest_usd = format_price(ticker.open_interest * ticker.mark_price);
        tick.next_funding_time = ticker.next_funding_time;
        tick.volume_24h = ticker.volume_24h;
        tick.quote_volume_24h = ticker.amount_24h;
        tick.high_24h = ticker.high_24h;
        tick.low_24h = ticker.low_24h;
        tick.stamp(now_ms);

        sink.emit(tick);
        emitted += 1;
    }
    emitted
}

fn format_price(v: f64) -> String {
    // Orderly sends JSON numbers; render without scientific notation so the
    // decimal-string invariant holds downstream.
    let s = format!("{:.12}", v);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickers_frame_emits() {
        let sink = TickSink::new();
        let frame = r#"{
            "topic": "tickers",
            "ts": 1700000000000,
            "data": [
                { "symbol": "BTCUSDT", "mark_price": 50000.5, "index_price": 50001.0,
                  "last_price": 50000.0, "open_interest": 120.5, "funding_rate": 0.000012,
                  "next_funding_time": 1700003600000,
                  "volume_24h": 4100.0, "amount_24h": 205000000.0,
                  "high_24h": 51000.0, "low_24h": 49000.0 },
                { "symbol": "DEADUSDT", "mark_price": 0.0 }
            ]
        }"#;

        assert_eq!(handle_text(frame, &sink), 1);
        let ticks = sink.drain();
        assert_eq!(ticks[0].symbol, "BTCUSDT");
        assert_eq!(ticks[0].mark_price, "50000.5");
        assert_eq!(ticks[0].funding_rate, "0.000012");
        assert_eq!(ticks[0].next_funding_time, Some(1_700_003_600_000));
    }

    #[test]
    fn server_ping_is_detected() {
        assert!(is_server_ping(r#"{"event":"ping","ts":1700000000000}"#));
        assert!(!is_server_ping(r#"{"topic":"tickers","data":[]}"#));
    }

    #[test]
    fn price_formatting_avoids_scientific_notation() {
        assert_eq!(format_price(0.000012), "0.000012");
        assert_eq!(format_price(50000.5), "50000.5");
        assert_eq!(format_price(0.0), "0");
    }
}
