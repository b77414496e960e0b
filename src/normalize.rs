//! Symbol canonicalization and funding-rate normalization.
//!
//! The canonical symbol is the merge key across venues: `BTCUSDT` (apex),
//! `BTC-USD-PERP` (paradex) and `hyna:BTC` (hyperliquid builder market) all
//! collapse to `BTC`. Funding rates are stored in three views: raw (venue
//! interval), hourly, and annualized percent. The venue-to-interval mapping
//! lives here and nowhere else.

use lazy_static::lazy_static;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub const HOURS_PER_YEAR: i64 = 24 * 365;

/// Venue ids in registry order. Every table below covers exactly this set.
pub const VENUE_IDS: [&str; 13] = [
    "hyperliquid",
    "drift",
    "dydx",
    "vertex",
    "orderly",
    "paradex",
    "rabbitx",
    "jupiter",
    "gmx",
    "aevo",
    "apex",
    "bluefin",
    "extended",
];

lazy_static! {
    /// Funding payout interval per venue, in hours. Interval-1 venues report
    /// a per-hour rate natively, so the hourly view equals the raw view.
    static ref FUNDING_INTERVAL_HOURS: HashMap<&'static str, i64> = {
        let mut m = HashMap::new();
        m.insert("hyperliquid", 1);
        m.insert("drift", 1);
        m.insert("dydx", 1);
        m.insert("jupiter", 1);
        m.insert("rabbitx", 1);
        m.insert("vertex", 4);
        m.insert("extended", 4);
        m.insert("gmx", 8);
        m.insert("aevo", 8);
        m.insert("paradex", 8);
        m.insert("orderly", 8);
        m.insert("apex", 8);
        m.insert("bluefin", 8);
        m
    };
}

/// Funding interval for a venue; unknown venues fall back to 8 h, the most
/// common payout schedule.
pub fn funding_interval_hours(exchange: &str) -> i64 {
    FUNDING_INTERVAL_HOURS.get(exchange).copied().unwrap_or(8)
}

/// Raw venue rate scaled to a per-hour rate.
pub fn hourly_funding_rate(exchange: &str, raw: Decimal) -> Decimal {
    let interval = funding_interval_hours(exchange);
    if interval <= 1 {
        raw
    } else {
        raw / Decimal::from(interval)
    }
}

/// Per-hour rate annualized as a percent: `hourly * 24 * 365 * 100`.
pub fn annualize_hourly(hourly: Decimal) -> f64 {
    (hourly * Decimal::from(HOURS_PER_YEAR) * Decimal::from(100))
        .to_f64()
        .unwrap_or(0.0)
}

/// All three funding views from the raw venue rate: (raw, hourly, annual %).
pub fn funding_views(exchange: &str, raw: Decimal) -> (Decimal, Decimal, f64) {
    let hourly = hourly_funding_rate(exchange, raw);
    (raw, hourly, annualize_hourly(hourly))
}

const QUOTE_SUFFIXES: [&str; 4] = ["-USD-PERP", "-USD", "USDT", "USD"];
const MULTIPLIER_PREFIXES: [&str; 2] = ["1000000", "1000"];

/// Rewrite a venue symbol to its canonical base-asset form.
///
/// Steps, in order: drop a colon-prefixed venue tag (`hyna:BONK` -> `BONK`),
/// drop the first matching quote suffix, drop a cheap-token multiplier
/// prefix, uppercase. Pure and idempotent; the original symbol is preserved
/// on the source record.
pub fn normalize_symbol(original: &str) -> String {
    let mut s = original.trim();

    if let Some((_, rest)) = s.split_once(':') {
        s = rest;
    }

    for suffix in QUOTE_SUFFIXES {
        if s.len() > suffix.len() {
            if let Some(stripped) = strip_suffix_ci(s, suffix) {
                s = stripped;
                break;
            }
        }
    }

    let mut owned = s.to_string();
    for prefix in MULTIPLIER_PREFIXES {
        if owned.len() > prefix.len() {
            if let Some(stripped) = owned.strip_prefix(prefix) {
                owned = stripped.to_string();
                break;
            }
        }
    }

    // A k/K prefix only counts as a multiplier when at least four characters
    // follow (keeps KAVA and friends intact).
    if owned.len() >= 5 {
        let mut chars = owned.chars();
        let first = chars.next().unwrap_or_default();
        if (first == 'k' || first == 'K') && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            owned = owned[1..].to_string();
        }
    }

    owned.to_ascii_uppercase()
}

fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    if s.len() < suffix.len() {
        return None;
    }
    let (head, tail) = s.split_at(s.len() - suffix.len());
    if tail.eq_ignore_ascii_case(suffix) {
        Some(head)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn canonical_forms_collapse() {
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC");
        assert_eq!(normalize_symbol("BTC-USD-PERP"), "BTC");
        assert_eq!(normalize_symbol("BTC-USD"), "BTC");
        assert_eq!(normalize_symbol("BTCUSD"), "BTC");
        assert_eq!(normalize_symbol("hyna:BTC"), "BTC");
        assert_eq!(normalize_symbol("vntl:SPACEX"), "SPACEX");
    }

    #[test]
    fn multiplier_prefixes_are_stripped() {
        assert_eq!(normalize_symbol("1000PEPEUSDT"), "PEPE");
        assert_eq!(normalize_symbol("1000000MOGUSDT"), "MOG");
        assert_eq!(normalize_symbol("kPEPE"), "PEPE");
        assert_eq!(normalize_symbol("KSHIB"), "SHIB");
    }

    #[test]
    fn short_k_symbols_survive() {
        assert_eq!(normalize_symbol("KAVA"), "KAVA");
        assert_eq!(normalize_symbol("KASUSDT"), "KAS");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "BTCUSDT",
            "BTC-USD-PERP",
            "hyna:BONK",
            "1000PEPEUSDT",
            "kFLOKI",
            "ETH-USD",
            "KAVA",
            "sol",
        ] {
            let once = normalize_symbol(raw);
            assert_eq!(normalize_symbol(&once), once, "not idempotent for {raw}");
        }
    }

    #[test]
    fn suffix_never_strips_to_empty() {
        assert_eq!(normalize_symbol("USDT"), "USDT");
        assert_eq!(normalize_symbol("USD"), "USD");
    }

    #[test]
    fn eight_hour_interval_views() {
        let raw = Decimal::from_str("0.0008").unwrap();
        let (raw_out, hourly, annual) = funding_views("gmx", raw);
        assert_eq!(raw_out, raw);
        assert_eq!(hourly, Decimal::from_str("0.0001").unwrap());
        assert!((annual - 87.6).abs() < 1e-9);
    }

    #[test]
    fn per_hour_native_venues_do_not_rescale() {
        let raw = Decimal::from_str("0.0001").unwrap();
        let (_, hourly, annual) = funding_views("hyperliquid", raw);
        assert_eq!(hourly, raw);
        assert!((annual - 87.6).abs() < 1e-9);
    }

    #[test]
    fn interval_table_covers_registry() {
        for venue in VENUE_IDS {
            assert!(FUNDING_INTERVAL_HOURS.contains_key(venue), "{venue}");
        }
    }
}
