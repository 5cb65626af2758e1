// =============================================================================
// Chart Session — one (symbol, interval) kline stream, seed and indicators
// =============================================================================
//
// A session is built for a single selection and never retargeted. Switching
// the chart tears the whole session down (transport, pump, seed task) and
// starts a new one, so a late seed or frame can only touch the buffer of the
// session that requested it.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{spawn_pump, FeedMonitor, FeedSettings, FeedStatus};
use crate::indicators::{IndicatorPoint, IndicatorSet};
use crate::market_data::candle_buffer::parse_kline;
use crate::market_data::{kline_stream, BarEntry, Candle, CandleAggregator, CandleKey, MergeOutcome};
use crate::stream::{Connector, StreamTransport, TransportEvent, WsConnector};
use crate::types::{ErrorCode, StateVersion, StreamError};

/// Everything the chart view needs in one serialisable value.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub symbol: String,
    pub interval: String,
    #[serde(flatten)]
    pub status: FeedStatus,
    pub bars: Vec<BarEntry>,
    pub indicators: Option<IndicatorSet>,
    pub history: Vec<IndicatorPoint>,
}

pub struct ChartSession<C: Connector = WsConnector> {
    key: CandleKey,
    transport: StreamTransport<C>,
    aggregator: Arc<RwLock<CandleAggregator>>,
    monitor: Arc<FeedMonitor>,
    pump: JoinHandle<()>,
    seeding: JoinHandle<()>,
}

impl<C: Connector> ChartSession<C> {
    /// Build a session for `key`, open its stream and apply `seed` to the
    /// buffer once it resolves.
    pub fn start<S>(key: CandleKey, settings: &FeedSettings, connector: C, version: StateVersion, seed: S) -> Self
    where
        S: Future<Output = Result<Vec<Candle>>> + Send + 'static,
    {
        let aggregator = Arc::new(RwLock::new(CandleAggregator::new(key.clone())));
        let monitor = Arc::new(FeedMonitor::new(version));

        let (transport, events) = StreamTransport::new(
            format!("chart:{key}"),
            settings.stream_base_url.clone(),
            vec![kline_stream(&key)],
            settings.settle_delay,
            connector,
        );

        let pump = {
            let aggregator = Arc::clone(&aggregator);
            let monitor = Arc::clone(&monitor);
            spawn_pump("chart", events, move |event| handle_event(&aggregator, &monitor, event))
        };

        let seeding = {
            let aggregator = Arc::clone(&aggregator);
            let monitor = Arc::clone(&monitor);
            let key = key.clone();
            tokio::spawn(async move {
                match seed.await {
                    Ok(candles) => apply_seed(&aggregator, &monitor, candles),
                    Err(e) => {
                        warn!(key = %key, error = %e, "chart seed fetch failed");
                        monitor.record_error(StreamError::new(
                            ErrorCode::Seed,
                            format!("failed to fetch history for {key}: {e:#}"),
                        ));
                    }
                }
            })
        };

        info!(key = %key, "chart session starting");
        transport.connect();

        Self {
            key,
            transport,
            aggregator,
            monitor,
            pump,
            seeding,
        }
    }

    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        let aggregator = self.aggregator.read();
        ChartSnapshot {
            symbol: self.key.symbol.clone(),
            interval: self.key.interval.clone(),
            status: self.monitor.status(self.transport.attempts()),
            bars: aggregator.bars(),
            indicators: aggregator.indicators().cloned(),
            history: aggregator.history().to_vec(),
        }
    }

    pub fn reconnect(&self) {
        self.transport.reconnect();
    }

    pub fn shutdown(&self) {
        info!(key = %self.key, "chart session shutting down");
        self.seeding.abort();
        self.transport.disconnect();
        self.pump.abort();
    }
}

fn apply_seed(aggregator: &RwLock<CandleAggregator>, monitor: &FeedMonitor, candles: Vec<Candle>) {
    let fetched = candles.len();
    let mut aggregator = aggregator.write();
    aggregator.seed(candles, Utc::now().timestamp_millis());
    info!(
        key = %aggregator.key(),
        fetched,
        bars = aggregator.len(),
        indicators = aggregator.indicators().is_some(),
        "chart seeded"
    );
    drop(aggregator);
    monitor.touch();
}

fn handle_event(aggregator: &RwLock<CandleAggregator>, monitor: &FeedMonitor, event: TransportEvent) {
    match event {
        TransportEvent::Frame(frame) => match parse_kline(&frame) {
            Ok(Some(update)) => {
                let outcome = aggregator.write().apply(update);
                if !matches!(outcome, MergeOutcome::Rejected | MergeOutcome::Ignored) {
                    monitor.touch();
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(feed = "chart", error = %e, "failed to process kline frame");
                monitor.record_error(StreamError::new(
                    ErrorCode::Process,
                    format!("failed to process kline: {e:#}"),
                ));
            }
        },
        TransportEvent::StateChanged(state) => monitor.set_state(state),
        TransportEvent::Error(error) => {
            if error.code.is_connection_class() {
                warn!(feed = "chart", code = %error.code, error = %error.message, "feed connection error");
            } else {
                debug!(feed = "chart", code = %error.code, "feed error");
            }
            monitor.record_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::connector::Connection;
    use crate::types::ConnectionState;
    use serde_json::json;

    const MINUTE: i64 = 60_000;

    fn kline(symbol: &str, interval: &str, open_time: i64, close: &str, closed: bool) -> serde_json::Value {
        json!({
            "stream": format!("{}@kline_{}", symbol.to_lowercase(), interval),
            "data": {
                "e": "kline", "E": open_time + 1, "s": symbol,
                "k": {
                    "t": open_time, "T": open_time + MINUTE - 1, "s": symbol, "i": interval,
                    "o": close, "c": close, "h": close, "l": close, "v": "5.0", "x": closed
                }
            }
        })
    }

    fn setup() -> (RwLock<CandleAggregator>, FeedMonitor, StateVersion) {
        let version = StateVersion::default();
        let aggregator = RwLock::new(CandleAggregator::new(CandleKey::new("BTCUSDT", "1m")));
        (aggregator, FeedMonitor::new(version.clone()), version)
    }

    #[test]
    fn kline_frames_reach_the_buffer() {
        let (aggregator, monitor, _) = setup();
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("BTCUSDT", "1m", 0, "100", false)));
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("BTCUSDT", "1m", 0, "101", true)));

        let agg = aggregator.read();
        assert_eq!(agg.len(), 1);
        assert!(agg.bars()[0].is_closed());
        assert_eq!(agg.bars()[0].candle().close, 101.0);
    }

    #[test]
    fn frames_for_other_selection_are_ignored() {
        let (aggregator, monitor, version) = setup();
        let v = version.current();
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("ETHUSDT", "1m", 0, "10", true)));
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("BTCUSDT", "5m", 0, "10", true)));
        assert_eq!(aggregator.read().len(), 0);
        assert_eq!(version.current(), v);
    }

    #[test]
    fn malformed_kline_is_a_process_error() {
        let (aggregator, monitor, _) = setup();
        handle_event(&aggregator, &monitor, TransportEvent::StateChanged(ConnectionState::Connected));
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("BTCUSDT", "1m", 0, "oops", true)));

        let status = monitor.status(0);
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.last_error.map(|e| e.code), Some(ErrorCode::Process));
        assert_eq!(aggregator.read().len(), 0);
    }

    #[test]
    fn seed_replaces_buffer() {
        let (aggregator, monitor, _) = setup();
        handle_event(&aggregator, &monitor, TransportEvent::Frame(kline("BTCUSDT", "1m", 0, "1", true)));

        let candles: Vec<Candle> = (0..200).map(|i| Candle::flat(i * MINUTE, 100.0)).collect();
        apply_seed(&aggregator, &monitor, candles);

        let agg = aggregator.read();
        assert_eq!(agg.len(), 200);
        assert!(agg.indicators().is_some());
        assert_eq!(agg.history().len(), 200);
    }

    /// Never finishes opening, so the only error a session can see is its own.
    struct Stalled;

    impl Connector for Stalled {
        async fn connect(&self, _url: &str) -> Result<Connection> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn failed_seed_is_reported_and_session_survives() {
        let settings = FeedSettings {
            stream_base_url: "wss://stream.example.com:9443".into(),
            settle_delay: std::time::Duration::from_millis(10),
        };
        let seed = async { Err::<Vec<Candle>, _>(anyhow::anyhow!("exchange unavailable")) };
        let session = ChartSession::start(
            CandleKey::new("BTCUSDT", "1m"),
            &settings,
            Stalled,
            StateVersion::default(),
            seed,
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.symbol, "BTCUSDT");
        assert!(snapshot.bars.is_empty());
        assert!(snapshot.indicators.is_none());
        assert_eq!(snapshot.status.state, ConnectionState::Connecting);
        assert_eq!(snapshot.status.attempts, 1);
        assert_eq!(snapshot.status.last_error.map(|e| e.code), Some(ErrorCode::Seed));
        session.shutdown();
    }
}
