//! Hyperliquid WebSocket adapter.
//!
//! Subscribes to the `webData2` channel, which carries the full perp
//! universe (builder-deployed markets included, e.g. `hyna:BONK`) together
//! with per-asset contexts in one frame. Funding here is already the
//! per-hour rate.

use super::{oi_usd, AdapterKind, TickSink, VenueAdapter, KEEPALIVE_INTERVAL, SUBSCRIPTION_IDLE_TIMEOUT};
use crate::models::RawTick;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Instant;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const VENUE: &str = "hyperliquid";

pub struct HyperliquidAdapter;

impl HyperliquidAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HyperliquidAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WebData2 {
    meta: Meta,
    #[serde(rename = "assetCtxs")]
    asset_ctxs: Vec<AssetCtx>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    universe: Vec<UniverseEntry>,
}

#[derive(Debug, Deserialize)]
struct UniverseEntry {
    name: String,
    #[serde(default, rename = "isDelisted")]
    is_delisted: bool,
}

#[derive(Debug, Deserialize)]
struct AssetCtx {
    #[serde(default, rename = "markPx")]
    mark_px: String,
    #[serde(default, rename = "oraclePx")]
    oracle_px: String,
    #[serde(default, rename = "midPx")]
    mid_px: Option<String>,
    #[serde(default)]
    funding: String,
    #[serde(default, rename = "openInterest")]
    open_interest: String,
    #[serde(default, rename = "dayNtlVlm")]
    day_ntl_vlm: String,
    #[serde(default, rename = "dayBaseVlm")]
    day_base_vlm: String,
    #[serde(default, rename = "prevDayPx")]
    prev_day_px: String,
}

#[async_trait]
impl VenueAdapter for HyperliquidAdapter {
    fn venue(&self) -> &'static str {
        VENUE
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Subscription
    }

    async fn run(&self, sink: TickSink) -> Result<()> {
        let (ws_stream, resp) = connect_async(WS_URL)
            .await
            .context("connect_async hyperliquid ws")?;
        info!(status = %resp.status(), "hyperliquid ws connected");

        let (mut write, mut read) = ws_stream.split();

        let sub = serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "webData2", "user": "0x0000000000000000000000000000000000000000" },
        });
        write
            .send(Message::Text(sub.to_string()))
            .await
            .context("send webData2 subscription")?;

        let mut ping = interval(KEEPALIVE_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_seen.elapsed() >= SUBSCRIPTION_IDLE_TIMEOUT {
                        anyhow::bail!("hyperliquid ws idle for {:?}", last_seen.elapsed());
                    }
                    let _ = write
                        .send(Message::Text(r#"{"method":"ping"}"#.to_string()))
                        .await;
                }
                ws_msg = read.next() => {
                    let Some(ws_msg) = ws_msg else {
                        return Ok(());
                    };
                    match ws_msg {
                        Ok(Message::Text(text)) => {
                            last_seen = Instant::now();
                            let count = handle_text(&text, &sink);
                            if count > 0 {
                                debug!(markets = count, "hyperliquid webData2 frame");
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            last_seen = Instant::now();
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "hyperliquid ws close");
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(anyhow::anyhow!("hyperliquid ws error: {e}"));
                        }
                    }
                }
            }
        }
    }
}

fn handle_text(text: &str, sink: &TickSink) -> usize {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return 0,
    };

    match envelope.channel.as_str() {
        "pong" => {
            sink.touch(chrono::Utc::now().timestamp_millis());
            0
        }
        "webData2" => match serde_json::from_value::<WebData2>(envelope.data) {
            Ok(data) => {
                let ticks = to_ticks(&data);
                let n = ticks.len();
                for tick in ticks {
                    sink.emit(tick);
                }
                n
            }
            Err(e) => {
                warn!(error = %e, "failed to parse webData2 payload");
                0
            }
        },
        _ => 0,
    }
}

/// Pair the universe with its contexts positionally, the way the venue
/// delivers them. Delisted entries and contexts without a mark are skipped.
fn to_ticks(data: &WebData2) -> Vec<RawTick> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut out = Vec::with_capacity(data.asset_ctxs.len());

    for (entry, ctx) in data.meta.universe.iter().zip(data.asset_ctxs.iter()) {
        if entry.is_delisted || ctx.mark_px.is_empty() {
            continue;
        }

        let mark = match Decimal::from_str(&ctx.mark_px) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let oi = Decimal::from_str(&ctx.open_interest).unwrap_or(Decimal::ZERO);

        let mut tick = RawTick::new(VENUE, &entry.name);
        tick.mark_price = ctx.mark_px.clone();
        tick.index_price = if ctx.oracle_px.is_empty() {
            ctx.mark_px.clone()
        } else {
            ctx.oracle_px.clone()
        };
        tick.last_price = ctx
            .mid_px
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ctx.mark_px.clone());
        tick.open_interest = ctx.open_interest.clone();
        tick.open_interest_usd = oi_usd(oi, mark);
        tick.funding_rate = if ctx.funding.is_empty() {
            "0".to_string()
        } else {
            ctx.funding.clone()
        };
        tick.quote_volume_24h = ctx.day_ntl_vlm.parse().unwrap_or(0.0);
        tick.volume_24h = ctx.day_base_vlm.parse().unwrap_or(0.0);

        if let Ok(prev) = Decimal::from_str(&ctx.prev_day_px) {
            if !prev.is_zero() {
                tick.price_change_24h = ((mark - prev) / prev * Decimal::from(100))
                    .to_f64()
                    .unwrap_or(0.0);
            }
        }

        tick.stamp(now_ms);
        out.push(tick);
    }
    out
}
