// =============================================================================
// Ticker Normalizer — latest 24h price snapshot per watch-listed symbol
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{parse_string_f64, payload};

/// Event type carried by 24h ticker push frames.
pub const TICKER_EVENT: &str = "24hrTicker";

/// Canonical live price snapshot for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_24h: f64,
    pub change_pct_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    /// Exchange event time (ms since epoch).
    pub timestamp: i64,
}

/// Decode a 24h ticker frame (single-stream or combined envelope).
///
/// Expected shape:
/// ```json
/// { "e": "24hrTicker", "E": 1700000000000, "s": "BTCUSDT", "c": "37000.1",
///   "p": "120.5", "P": "0.33", "h": "37400", "l": "36500", "v": "15123.2" }
/// ```
pub fn parse_ticker(frame: &serde_json::Value) -> Result<PriceSnapshot> {
    let data = payload(frame);

    let event = data["e"].as_str().context("missing field e")?;
    if event != TICKER_EVENT {
        anyhow::bail!("unexpected event type {event}");
    }

    Ok(PriceSnapshot {
        symbol: data["s"].as_str().context("missing field s")?.to_uppercase(),
        price: parse_string_f64(&data["c"], "c")?,
        change_24h: parse_string_f64(&data["p"], "p")?,
        change_pct_24h: parse_string_f64(&data["P"], "P")?,
        high_24h: parse_string_f64(&data["h"], "h")?,
        low_24h: parse_string_f64(&data["l"], "l")?,
        volume_24h: parse_string_f64(&data["v"], "v")?,
        timestamp: data["E"].as_i64().context("missing field E")?,
    })
}

#[derive(Default)]
struct Board {
    watchlist: Vec<String>,
    snapshots: HashMap<String, PriceSnapshot>,
}

/// Symbol → latest snapshot for the current watchlist.
///
/// The watchlist and the snapshots share one lock, so a frame checked against
/// an old watchlist can never land after that watchlist was replaced.
pub struct TickerBoard {
    inner: RwLock<Board>,
}

impl TickerBoard {
    pub fn new(symbols: &[String]) -> Self {
        Self {
            inner: RwLock::new(Board {
                watchlist: symbols.to_vec(),
                snapshots: HashMap::new(),
            }),
        }
    }

    /// Apply one raw frame. Returns the stored snapshot, or `None` when the
    /// frame was dropped.
    pub fn apply(&self, frame: &serde_json::Value) -> Option<PriceSnapshot> {
        let snapshot = match parse_ticker(frame) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "dropping ticker frame");
                return None;
            }
        };

        let mut board = self.inner.write();
        if !board.watchlist.contains(&snapshot.symbol) {
            debug!(symbol = %snapshot.symbol, "ticker for unwatched symbol");
            return None;
        }
        board
            .snapshots
            .insert(snapshot.symbol.clone(), snapshot.clone());
        Some(snapshot)
    }

    /// Replace the watchlist and prune snapshots of removed symbols. Returns
    /// the number of snapshots pruned.
    pub fn set_watchlist(&self, symbols: &[String]) -> usize {
        let keep: HashSet<&String> = symbols.iter().collect();
        let mut board = self.inner.write();
        let before = board.snapshots.len();
        board.snapshots.retain(|symbol, _| keep.contains(symbol));
        board.watchlist = symbols.to_vec();
        before - board.snapshots.len()
    }

    pub fn watchlist(&self) -> Vec<String> {
        self.inner.read().watchlist.clone()
    }

    pub fn get(&self, symbol: &str) -> Option<PriceSnapshot> {
        self.inner.read().snapshots.get(symbol).cloned()
    }

    /// Snapshots in watchlist order; symbols without data yet are skipped.
    pub fn snapshots(&self) -> Vec<PriceSnapshot> {
        let board = self.inner.read();
        board
            .watchlist
            .iter()
            .filter_map(|s| board.snapshots.get(s).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(symbol: &str, price: &str) -> serde_json::Value {
        json!({
            "stream": format!("{}@ticker", symbol.to_lowercase()),
            "data": {
                "e": "24hrTicker",
                "E": 1700000000000_i64,
                "s": symbol,
                "c": price,
                "p": "-12.5",
                "P": "-0.42",
                "h": "31000.0",
                "l": "29000.0",
                "v": "1234.5"
            }
        })
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_ticker_fields() {
        let snap = parse_ticker(&frame("BTCUSDT", "30000.5")).unwrap();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.price, 30000.5);
        assert_eq!(snap.change_24h, -12.5);
        assert_eq!(snap.change_pct_24h, -0.42);
        assert_eq!(snap.high_24h, 31000.0);
        assert_eq!(snap.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn rejects_wrong_event_type() {
        let wrong = json!({ "e": "kline", "s": "BTCUSDT" });
        assert!(parse_ticker(&wrong).is_err());
    }

    #[test]
    fn updates_in_place() {
        let board = TickerBoard::new(&symbols(&["BTCUSDT", "ETHUSDT"]));
        board.apply(&frame("BTCUSDT", "100"));
        board.apply(&frame("ETHUSDT", "10"));
        board.apply(&frame("BTCUSDT", "101"));

        assert_eq!(board.snapshots().len(), 2);
        assert_eq!(board.get("BTCUSDT").unwrap().price, 101.0);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let board = TickerBoard::new(&symbols(&["BTCUSDT"]));
        assert!(board.apply(&frame("BTCUSDT", "not-a-number")).is_none());
        assert!(board.apply(&json!({ "e": "kline" })).is_none());
        assert!(board.snapshots().is_empty());
    }

    #[test]
    fn watchlist_change_prunes_immediately() {
        let board = TickerBoard::new(&symbols(&["BTCUSDT", "ETHUSDT"]));
        board.apply(&frame("BTCUSDT", "100"));
        board.apply(&frame("ETHUSDT", "10"));

        let pruned = board.set_watchlist(&symbols(&["ETHUSDT", "SOLUSDT"]));
        assert_eq!(pruned, 1);
        assert!(board.get("BTCUSDT").is_none());
        assert!(board.get("ETHUSDT").is_some());

        // A late frame for the removed symbol does not resurrect it.
        assert!(board.apply(&frame("BTCUSDT", "99")).is_none());
        assert!(board.get("BTCUSDT").is_none());
    }

    #[test]
    fn concurrent_frames_never_outlive_a_prune() {
        let board = TickerBoard::new(&symbols(&["BTCUSDT", "ETHUSDT"]));
        let btc = frame("BTCUSDT", "100");

        for _ in 0..50 {
            board.set_watchlist(&symbols(&["BTCUSDT", "ETHUSDT"]));
            std::thread::scope(|scope| {
                let feeder = scope.spawn(|| {
                    for _ in 0..200 {
                        board.apply(&btc);
                    }
                });
                board.set_watchlist(&symbols(&["ETHUSDT"]));
                feeder.join().unwrap();
            });

            // Every frame applied after the prune saw the new watchlist.
            assert!(board.get("BTCUSDT").is_none());
            assert_eq!(board.watchlist(), symbols(&["ETHUSDT"]));
        }
    }

    #[test]
    fn snapshots_follow_watchlist_order() {
        let board = TickerBoard::new(&symbols(&["SOLUSDT", "BTCUSDT"]));
        board.apply(&frame("BTCUSDT", "100"));
        board.apply(&frame("SOLUSDT", "20"));
        let order: Vec<String> = board.snapshots().into_iter().map(|s| s.symbol).collect();
        assert_eq!(order, symbols(&["SOLUSDT", "BTCUSDT"]));
    }
}
