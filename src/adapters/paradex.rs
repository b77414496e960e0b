//! Paradex WebSocket adapter. JSON-RPC framing with a `markets_summary`
//! channel that streams one message per market.

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

const WS_URL: &str = "wss://ws.api.prod.paradex.trade/v1";
const VENUE: &str = "paradex";

pub struct ParadexAdapter;

impl ParadexAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ParadexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<RpcParams>,
}

#[derive(Debug, Deserialize)]
struct RpcParams {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    data: Option<MarketSummary>,
}

#[derive(Debug, Deserialize)]
struct MarketSummary {
    symbol: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    underlying_price: String,
    #[serde(default)]
    last_traded_price: String,
    #[serde(default)]
    open_interest: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: Option<i64>,
    #[serde(default)]
    volume_24h: String,
    #[serde(default)]
    price_change_rate_24h: String,
}

#[async_trait]
impl VenueAdapter for ParadexAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async paradex ws")?;
        info!(status = %resp.status(), "paradex ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "params": { "channel": "markets_summary" },
            "id": 1,
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send markets_summary subscription")?;

        let mut idle_check = interval(Duration::from_secs(10));
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = idle_check.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("paradex ws idle for {:?}", last_seen.elapsed());
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
                            debug!(?frame, "paradex ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("paradex ws error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

fn handle_text(text: &str, sink: &TickSink) -> bool {
    let frame: RpcFrame = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return false,
    };
    if frame.method.as_deref() != Some("subscription") {
        return false;
    }
    let Some(params) = frame.params else {
        return false;
    };
    if params.channel != "markets_summary" {
        return false;
    }
    let Some(summary) = params.data else {
        return false;
    };

    // Options trade on the same venue; only perpetuals carry the -PERP tail.
    if !summary.symbol.ends_with("-PERP") {
        return false;
    }
    let Ok(mark) = Decimal::from_str(&summary.mark_price) else {
        return false;
    };
    let oi = Decimal::from_str(&summary.open_interest).unwrap_or(Decimal::ZERO);

    let mut tick = RawTick::new(VENUE, &summary.symbol);
    tick.mark_price = summary.mark_price.clone();
    tick.index_price = if summary.underlying_price.is_empty() {
        summary.mark_price.clone()
    } else {
        summary.underlying_price.clone()
    };
    tick.last_price = if summary.last_traded_price.is_empty() {
        summary.mark_price.clone()
    } else {
        summary.last_traded_price.clone()
    };
    tick.funding_rate = if summary.funding_rate.is_empty() {
        "0".into()
    } else {
        summary.funding_rate.clone()
    };
    tick.open_interest = oi.normalize().to_string();
    tick.open_interest_usd = oi_usd(oi, mark);
    tick.next_funding_time = summary.next_funding_time;
    tick.quote_volume_24h = summary.volume_24h.parse().unwrap_or(0.0);
    tick.price_change_24h = summary.price_change_rate_24h.parse().unwrap_or(0.0);
    tick.stamp(chrono::Utc::now().timestamp_millis());

    sink.emit(tick);
    true
}
