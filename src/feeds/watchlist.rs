// =============================================================================
// Watchlist Feed — 24h tickers for every watched symbol on one connection
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_pump, FeedMonitor, FeedSettings, FeedStatus};
use crate::market_data::{ticker_stream, PriceSnapshot, TickerBoard};
use crate::stream::{Connector, StreamTransport, TransportEvent, WsConnector};
use crate::types::StateVersion;

pub struct WatchlistFeed<C: Connector = WsConnector> {
    transport: StreamTransport<C>,
    board: Arc<TickerBoard>,
    monitor: Arc<FeedMonitor>,
    pump: JoinHandle<()>,
}

impl<C: Connector> WatchlistFeed<C> {
    /// Build the feed and open its connection.
    pub fn start(symbols: &[String], settings: &FeedSettings, connector: C, version: StateVersion) -> Self {
        let symbols = normalize_symbols(symbols);
        let board = Arc::new(TickerBoard::new(&symbols));
        let monitor = Arc::new(FeedMonitor::new(version));

        let (transport, events) = StreamTransport::new(
            "watchlist",
            settings.stream_base_url.clone(),
            ticker_streams(&symbols),
            settings.settle_delay,
            connector,
        );

        let pump = {
            let board = Arc::clone(&board);
            let monitor = Arc::clone(&monitor);
            spawn_pump("watchlist", events, move |event| handle_event(&board, &monitor, event))
        };

        info!(symbols = ?symbols, "watchlist feed starting");
        transport.connect();

        Self {
            transport,
            board,
            monitor,
            pump,
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.board.watchlist()
    }

    pub fn prices(&self) -> Vec<PriceSnapshot> {
        self.board.snapshots()
    }

    pub fn price(&self, symbol: &str) -> Option<PriceSnapshot> {
        self.board.get(&symbol.trim().to_uppercase())
    }

    pub fn status(&self) -> FeedStatus {
        self.monitor.status(self.transport.attempts())
    }

    /// Replace the watchlist: prune removed symbols now, then resubscribe.
    pub fn set_symbols(&self, symbols: &[String]) -> Vec<String> {
        let symbols = normalize_symbols(symbols);
        let pruned = self.board.set_watchlist(&symbols);
        info!(symbols = ?symbols, pruned, "watchlist updated");
        self.monitor.touch();
        self.transport.update_streams(ticker_streams(&symbols));
        symbols
    }

    pub fn reconnect(&self) {
        self.transport.reconnect();
    }

    pub fn shutdown(&self) {
        self.transport.disconnect();
        self.pump.abort();
    }
}

/// Trim, uppercase and de-duplicate symbols, keeping first-seen order.
pub fn normalize_symbols(symbols: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

fn ticker_streams(symbols: &[String]) -> Vec<String> {
    symbols.iter().map(|s| ticker_stream(s)).collect()
}

fn handle_event(board: &TickerBoard, monitor: &FeedMonitor, event: TransportEvent) {
    match event {
        TransportEvent::Frame(frame) => {
            if board.apply(&frame).is_some() {
                monitor.touch();
            }
        }
        TransportEvent::StateChanged(state) => monitor.set_state(state),
        TransportEvent::Error(error) => {
            if error.code.is_connection_class() {
                warn!(feed = "watchlist", code = %error.code, error = %error.message, "feed connection error");
            } else {
                debug!(feed = "watchlist", code = %error.code, "feed error");
            }
            monitor.record_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConnectionState, ErrorCode, StreamError};
    use serde_json::json;

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn ticker(symbol: &str, price: &str) -> serde_json::Value {
        json!({
            "stream": format!("{}@ticker", symbol.to_lowercase()),
            "data": {
                "e": "24hrTicker", "E": 1700000000000_i64, "s": symbol,
                "c": price, "p": "1.0", "P": "0.5", "h": "110", "l": "90", "v": "1000"
            }
        })
    }

    #[test]
    fn normalizes_and_dedups_symbols() {
        let out = normalize_symbols(&symbols(&[" btcusdt", "ETHUSDT", "BTCUSDT", ""]));
        assert_eq!(out, symbols(&["BTCUSDT", "ETHUSDT"]));
    }

    #[test]
    fn ticker_streams_are_lowercase() {
        assert_eq!(
            ticker_streams(&symbols(&["BTCUSDT", "SOLUSDT"])),
            symbols(&["btcusdt@ticker", "solusdt@ticker"])
        );
    }

    #[test]
    fn events_update_board_and_status() {
        let version = StateVersion::default();
        let board = TickerBoard::new(&symbols(&["BTCUSDT"]));
        let monitor = FeedMonitor::new(version.clone());

        handle_event(&board, &monitor, TransportEvent::StateChanged(ConnectionState::Connected));
        let v = version.current();
        handle_event(&board, &monitor, TransportEvent::Frame(ticker("BTCUSDT", "101.5")));
        assert!(version.current() > v);
        assert_eq!(board.get("BTCUSDT").map(|s| s.price), Some(101.5));

        // Dropped frames do not bump the version.
        let v = version.current();
        handle_event(&board, &monitor, TransportEvent::Frame(ticker("DOGEUSDT", "0.1")));
        assert_eq!(version.current(), v);

        handle_event(
            &board,
            &monitor,
            TransportEvent::Error(StreamError::new(ErrorCode::Parse, "bad frame")),
        );
        let status = monitor.status(0);
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.last_error.map(|e| e.code), Some(ErrorCode::Parse));
    }
}
