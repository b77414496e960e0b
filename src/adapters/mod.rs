//! Venue adapters.
//!
//! One module per exchange. Subscription adapters hold a WebSocket open and
//! push every market update into the tracker's buffer; pull adapters poll a
//! REST endpoint on a fixed interval. Both speak the same contract to the
//! tracker runtime: `run(sink)` until the connection dies, emitting
//! normalized `RawTick`s through the sink.

pub mod aevo;
pub mod apex;
pub mod bluefin;
pub mod drift;
pub mod dydx;
pub mod extended;
pub mod gmx;
pub mod hyperliquid;
pub mod jupiter;
pub mod orderly;
pub mod paradex;
pub mod rabbitx;
pub mod vertex;

use crate::models::RawTick;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Consecutive poll failures a pull adapter tolerates before it reports the
/// connection as down and lets the tracker run its reconnect policy.
pub const MAX_CONSECUTIVE_POLL_FAILURES: u32 = 5;

/// Idle threshold after which a subscription adapter treats the socket as
/// dead and returns for reconnect.
pub const SUBSCRIPTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Application-level keepalive cadence where a venue requires it.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Instrument lists are refreshed at most this often.
pub const INSTRUMENT_REFRESH: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Server pushes updates over a WebSocket.
    Subscription,
    /// Adapter polls REST on a fixed interval.
    Pull { poll_interval: Duration },
}

/// Where adapters deposit ticks. Writes overwrite per original symbol; the
/// tracker drains the whole map at snapshot time.
#[derive(Clone, Default)]
pub struct TickSink {
    buffer: Arc<Mutex<HashMap<String, RawTick>>>,
    last_message_ms: Arc<AtomicI64>,
}

impl TickSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a tick keyed by its original symbol. Ticks without a symbol
    /// or mark price, or with unparseable numeric fields, are dropped here
    /// so the writer path only ever sees valid rows.
    pub fn emit(&self, tick: RawTick) {
        if tick.symbol.trim().is_empty() {
            return;
        }
        if tick.mark_price.trim().is_empty() || tick.mark_price == "0" {
            return;
        }
        if let Err(reason) = tick.validate() {
            debug!(
                exchange = %tick.exchange,
                symbol = %tick.symbol,
                reason,
                "dropping malformed tick"
            );
            return;
        }

        self.last_message_ms
            .store(tick.recorded_at, Ordering::Relaxed);
        self.buffer.lock().insert(tick.symbol.clone(), tick);
    }

    /// Record venue traffic that did not produce a tick (pongs, heartbeats)
    /// so idle detection sees a live socket.
    pub fn touch(&self, now_ms: i64) {
        self.last_message_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Move the buffer out, leaving a fresh empty map.
    pub fn drain(&self) -> Vec<RawTick> {
        let map = std::mem::take(&mut *self.buffer.lock());
        let mut ticks: Vec<RawTick> = map.into_values().collect();
        ticks.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        ticks
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message_ms.load(Ordering::Relaxed)
    }
}

/// The adapter contract. `run` owns the connection or polling loop and only
/// returns when the venue link is gone (Ok for a clean close, Err for a
/// failure); the tracker decides whether and when to call it again.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> &'static str;

    fn kind(&self) -> AdapterKind;

    async fn run(&self, sink: TickSink) -> anyhow::Result<()>;
}

/// Hour-cached instrument list for pull adapters, refreshed with a small
/// deterministic jitter so venues never refresh in lockstep.
pub struct InstrumentCache<T> {
    cache: ArcSwapOption<CachedInstruments<T>>,
}

pub struct CachedInstruments<T> {
    pub items: Vec<T>,
    fetched_at_ms: i64,
    ttl_ms: i64,
}

impl<T> InstrumentCache<T> {
    pub fn new() -> Self {
        Self {
            cache: ArcSwapOption::const_empty(),
        }
    }

    /// Cached list if it is still inside its jittered TTL.
    pub fn get(&self, now_ms: i64) -> Option<Arc<CachedInstruments<T>>> {
        let cached = self.cache.load_full()?;
        if now_ms - cached.fetched_at_ms < cached.ttl_ms {
            Some(cached)
        } else {
            None
        }
    }

    pub fn store(&self, items: Vec<T>, now_ms: i64) {
        // +/- 10 % jitter derived from the fetch time itself.
        let base = INSTRUMENT_REFRESH.as_millis() as i64;
        let ttl_ms = base * (900 + now_ms.rem_euclid(200)) / 1000;
        self.cache.store(Some(Arc::new(CachedInstruments {
            items,
            fetched_at_ms: now_ms,
            ttl_ms,
        })));
    }
}

impl<T> Default for InstrumentCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Open interest in USD from base open interest and a mark price.
pub(crate) fn oi_usd(open_interest: Decimal, mark: Decimal) -> String {
    (open_interest * mark).normalize().to_string()
}

/// Fixed-point 1e18 string (x18 venues) to a plain decimal string.
pub(crate) fn from_x18(s: &str) -> String {
    match Decimal::from_str(s.trim()) {
        Ok(v) => (v / Decimal::from(10u64.pow(18))).normalize().to_string(),
        Err(_) => "0".to_string(),
    }
}

/// Build the adapter for a venue id. The registry is the only place that
/// knows which module serves which exchange.
pub fn build_adapter(venue: &str, http: reqwest::Client) -> Option<Arc<dyn VenueAdapter>> {
    match venue {
        "hyperliquid" => Some(Arc::new(hyperliquid::HyperliquidAdapter::new())),
        "drift" => Some(Arc::new(drift::DriftAdapter::new())),
        "dydx" => Some(Arc::new(dydx::DydxAdapter::new())),
        "vertex" => Some(Arc::new(vertex::VertexAdapter::new())),
        "orderly" => Some(Arc::new(orderly::OrderlyAdapter::new())),
        "paradex" => Some(Arc::new(paradex::ParadexAdapter::new())),
        "rabbitx" => Some(Arc::new(rabbitx::RabbitxAdapter::new())),
        "jupiter" => Some(Arc::new(jupiter::JupiterAdapter::new(http))),
        "gmx" => Some(Arc::new(gmx::GmxAdapter::new(http))),
        "aevo" => Some(Arc::new(aevo::AevoAdapter::new(http))),
        "apex" => Some(Arc::new(apex::ApexAdapter::new(http))),
        "bluefin" => Some(Arc::new(bluefin::BluefinAdapter::new(http))),
        "extended" => Some(Arc::new(extended::ExtendedAdapter::new(http))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_is_last_write_wins_per_symbol() {
        let sink = TickSink::new();

        let mut first = RawTick::new("gmx", "BTC-USD");
        first.mark_price = "100".into();
        first.funding_rate = "0.0001".into();
        first.stamp(1000);
        sink.emit(first);

        let mut second = RawTick::new("gmx", "BTC-USD");
        second.mark_price = "101".into();
        second.funding_rate = "0.00015".into();
        second.stamp(1500);
        sink.emit(second);

        let mut other = RawTick::new("gmx", "ETH-USD");
        other.mark_price = "3000".into();
        other.stamp(1600);
        sink.emit(other);

        let ticks = sink.drain();
        assert_eq!(ticks.len(), 2);
        let btc = ticks.iter().find(|t| t.symbol == "BTC-USD").unwrap();
        assert_eq!(btc.mark_price, "101");
        assert_eq!(btc.funding_rate, "0.00015");

        // Drain clears atomically.
        assert!(sink.is_empty());
    }

    #[test]
    fn sink_drops_ticks_without_mark_or_symbol() {
        let sink = TickSink::new();

        let no_mark = RawTick::new("gmx", "BTC-USD");
        sink.emit(no_mark);

        let mut no_symbol = RawTick::new("gmx", "");
        no_symbol.mark_price = "100".into();
        sink.emit(no_symbol);

        let mut bad_decimal = RawTick::new("gmx", "ETH-USD");
        bad_decimal.mark_price = "100".into();
        bad_decimal.funding_rate = "n/a".into();
        sink.emit(bad_decimal);

        assert!(sink.is_empty());
    }

    #[test]
    fn instrument_cache_expires() {
        let cache: InstrumentCache<String> = InstrumentCache::new();
        assert!(cache.get(0).is_none());

        cache.store(vec!["BTC-USD".to_string()], 1_000);
        assert!(cache.get(60_000).is_some());
        // Beyond the maximum jittered TTL (1.1x base).
        let past = 1_000 + INSTRUMENT_REFRESH.as_millis() as i64 * 2;
        assert!(cache.get(past).is_none());
    }

    #[test]
    fn x18_conversion() {
        assert_eq!(from_x18("50000000000000000000000"), "50000");
        assert_eq!(from_x18("100000000000000"), "0.0001");
        assert_eq!(from_x18("garbage"), "0");
    }
}
