// =============================================================================
// Stream Transport — one supervised push-feed connection
// =============================================================================
//
// State machine:
//
//   disconnected ─connect→ connecting ─open→ connected ─disconnect→ disconnecting
//        ▲                     │                 │                       │
//        └───────── close ─────┴──── error ──────┴───── close confirmed ─┘
//
// `error` is reachable from `connecting` or `connected` and is left by a fresh
// `connect()` / `reconnect()`.
//
// There is no automatic reconnect. An unexpected close is
// reported and the transport stays `disconnected` until a caller invokes
// `reconnect()`. Every connection attempt carries a generation number; events
// from superseded attempts are discarded, so a reconnect never leaves two live
// sockets feeding the same consumer.
// =============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connector::{Connection, Connector, Inbound, WsConnector, ABNORMAL_CLOSE, NORMAL_CLOSE};
use crate::types::{ConnectionState, ErrorCode, StreamError};

/// Everything a transport reports to its consumer, in order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    Frame(serde_json::Value),
    Error(StreamError),
}

/// Build the combined-stream URL for `streams`.
pub fn build_stream_url(base_url: &str, streams: &[String]) -> Result<String> {
    let base = base_url.trim_end_matches('/');
    if !(base.starts_with("ws://") || base.starts_with("wss://")) {
        anyhow::bail!("stream endpoint must be a ws:// or wss:// URL, got '{base_url}'");
    }
    if streams.is_empty() {
        anyhow::bail!("no streams to subscribe to");
    }
    if let Some(bad) = streams.iter().find(|s| s.is_empty() || s.contains(char::is_whitespace)) {
        anyhow::bail!("invalid stream name '{bad}'");
    }
    Ok(format!("{base}/stream?streams={}", streams.join("/")))
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Session {
    generation: u64,
    task: JoinHandle<()>,
    /// Present once the socket is open.
    close: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Status {
    state: ConnectionState,
    generation: u64,
    /// Connection attempts since the last successful open.
    attempts: u32,
    session: Option<Session>,
    pending_reconnect: Option<(u64, JoinHandle<()>)>,
    reconnect_seq: u64,
}

struct Shared<C> {
    label: String,
    base_url: String,
    settle_delay: Duration,
    connector: C,
    streams: RwLock<Vec<String>>,
    status: Mutex<Status>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl<C: Connector> Shared<C> {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, status: &mut Status, next: ConnectionState) {
        if status.state == next {
            return;
        }
        debug!(feed = %self.label, from = %status.state, to = %next, "connection state change");
        status.state = next;
        self.emit(TransportEvent::StateChanged(next));
    }

    fn report(&self, code: ErrorCode, message: String) {
        self.emit(TransportEvent::Error(StreamError::new(code, message)));
    }

    fn is_current(&self, generation: u64) -> bool {
        self.status.lock().generation == generation
    }

    fn on_closed(&self, generation: u64, code: u16, reason: &str) {
        let mut status = self.status.lock();
        if status.generation != generation {
            debug!(feed = %self.label, generation, "close from superseded connection");
            return;
        }
        status.session = None;
        let requested = status.state == ConnectionState::Disconnecting;
        self.transition(&mut status, ConnectionState::Disconnected);

        if requested || code == NORMAL_CLOSE {
            info!(feed = %self.label, code, "stream connection closed");
        } else {
            warn!(feed = %self.label, code, reason = %reason, "stream connection closed unexpectedly");
            self.report(
                ErrorCode::Close(code),
                format!("connection closed unexpectedly (code {code}): {reason}"),
            );
        }
    }

    fn on_failed(&self, generation: u64, code: ErrorCode, message: String) {
        let mut status = self.status.lock();
        if status.generation != generation {
            return;
        }
        status.session = None;
        self.transition(&mut status, ConnectionState::Error);
        warn!(feed = %self.label, error = %message, "stream connection failed");
        self.report(code, message);
    }
}

// ---------------------------------------------------------------------------
// StreamTransport
// ---------------------------------------------------------------------------

/// One push-feed connection carrying one or more logical streams.
///
/// Cheap to clone; clones share the same connection.
pub struct StreamTransport<C: Connector = WsConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for StreamTransport<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> StreamTransport<C> {
    /// Create an idle transport. Events arrive on the returned receiver; the
    /// consumer should drain it from a single task.
    pub fn new(
        label: impl Into<String>,
        base_url: impl Into<String>,
        streams: Vec<String>,
        settle_delay: Duration,
        connector: C,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            label: label.into(),
            base_url: base_url.into(),
            settle_delay,
            connector,
            streams: RwLock::new(streams),
            status: Mutex::new(Status::default()),
            events,
        });
        (Self { shared }, rx)
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    /// Connection attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.shared.status.lock().attempts
    }

    /// Open the connection unless one is already opening or open.
    pub fn connect(&self) {
        connect(&self.shared);
    }

    /// Cancel any pending reconnect and close the connection gracefully.
    pub fn disconnect(&self) {
        disconnect(&self.shared);
    }

    /// Disconnect, then connect again after the settling delay.
    pub fn reconnect(&self) {
        reconnect(&self.shared);
    }

    /// Replace the subscribed streams (disconnect + reconnect).
    pub fn update_streams(&self, streams: Vec<String>) {
        info!(feed = %self.shared.label, count = streams.len(), "updating stream subscriptions");
        *self.shared.streams.write() = streams;
        reconnect(&self.shared);
    }
}

fn connect<C: Connector>(shared: &Arc<Shared<C>>) {
    let mut status = shared.status.lock();
    if matches!(status.state, ConnectionState::Connecting | ConnectionState::Connected) {
        debug!(feed = %shared.label, state = %status.state, "connect ignored");
        return;
    }

    let url = match build_stream_url(&shared.base_url, &shared.streams.read()) {
        Ok(url) => url,
        Err(e) => {
            shared.transition(&mut status, ConnectionState::Error);
            warn!(feed = %shared.label, error = %e, "cannot create stream connection");
            shared.report(ErrorCode::Create, format!("{e:#}"));
            return;
        }
    };

    // A close that was never confirmed must not keep feeding us.
    if let Some(stale) = status.session.take() {
        stale.task.abort();
    }

    status.generation += 1;
    status.attempts += 1;
    let generation = status.generation;
    shared.transition(&mut status, ConnectionState::Connecting);

    let task = tokio::spawn(run_session(Arc::clone(shared), generation, url));
    status.session = Some(Session {
        generation,
        task,
        close: None,
    });
}

fn disconnect<C: Connector>(shared: &Arc<Shared<C>>) {
    let mut status = shared.status.lock();

    if let Some((_, pending)) = status.pending_reconnect.take() {
        debug!(feed = %shared.label, "cancelled pending reconnect");
        pending.abort();
    }

    let Some(mut session) = status.session.take() else {
        if status.state != ConnectionState::Disconnected {
            debug!(feed = %shared.label, from = %status.state, "disconnect without a live socket");
            shared.transition(&mut status, ConnectionState::Disconnecting);
            shared.transition(&mut status, ConnectionState::Disconnected);
        }
        return;
    };

    match session.close.take() {
        Some(close) if status.state == ConnectionState::Connected => {
            shared.transition(&mut status, ConnectionState::Disconnecting);
            let _ = close.send(());
            // Keep the session so its close confirmation is still accepted.
            status.session = Some(session);
        }
        _ => {
            debug!(feed = %shared.label, generation = session.generation, "abandoning connection attempt");
            session.task.abort();
            status.generation += 1;
            shared.transition(&mut status, ConnectionState::Disconnecting);
            shared.transition(&mut status, ConnectionState::Disconnected);
        }
    }
}

fn reconnect<C: Connector>(shared: &Arc<Shared<C>>) {
    disconnect(shared);

    let mut status = shared.status.lock();
    status.attempts = 0;
    status.reconnect_seq += 1;
    let seq = status.reconnect_seq;
    let delay = shared.settle_delay;
    let weak: Weak<Shared<C>> = Arc::downgrade(shared);

    info!(feed = %shared.label, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        {
            let mut status = shared.status.lock();
            match &status.pending_reconnect {
                Some((pending_seq, _)) if *pending_seq == seq => status.pending_reconnect = None,
                _ => return,
            }
        }
        connect(&shared);
    });
    status.pending_reconnect = Some((seq, handle));
}

async fn run_session<C: Connector>(shared: Arc<Shared<C>>, generation: u64, url: String) {
    info!(feed = %shared.label, url = %url, "opening stream connection");

    let Connection { mut inbound, close } = match shared.connector.connect(&url).await {
        Ok(connection) => connection,
        Err(e) => {
            shared.on_failed(generation, ErrorCode::Connection, format!("{e:#}"));
            return;
        }
    };

    {
        let mut status = shared.status.lock();
        if status.generation != generation {
            // Superseded while opening; dropping `close` shuts the socket.
            return;
        }
        if let Some(session) = status.session.as_mut() {
            session.close = Some(close);
        }
        status.attempts = 0;
        shared.transition(&mut status, ConnectionState::Connected);
    }

    while let Some(message) = inbound.recv().await {
        match message {
            Inbound::Text(text) => {
                if !shared.is_current(generation) {
                    return;
                }
                match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(frame) => shared.emit(TransportEvent::Frame(frame)),
                    Err(e) => {
                        warn!(feed = %shared.label, error = %e, "failed to parse stream frame");
                        shared.report(ErrorCode::Parse, format!("failed to parse frame: {e}"));
                    }
                }
            }
            Inbound::Closed { code, reason } => {
                shared.on_closed(generation, code, &reason);
                return;
            }
            Inbound::Failed(reason) => {
                shared.on_failed(generation, ErrorCode::Connection, reason);
                return;
            }
        }
    }

    shared.on_closed(generation, ABNORMAL_CLOSE, "connection dropped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    const SETTLE: Duration = Duration::from_millis(20);

    #[derive(Default)]
    struct MockInner {
        attempts: AtomicUsize,
        opened: AtomicUsize,
        refuse: AtomicBool,
        open_delay_ms: AtomicU64,
        sockets: Mutex<Vec<mpsc::Sender<Inbound>>>,
    }

    /// In-memory connector: every accepted connection is a channel the test
    /// can push inbound events into. A close request is echoed back as a
    /// normal close.
    #[derive(Clone, Default)]
    struct MockConnector(Arc<MockInner>);

    impl MockConnector {
        fn attempts(&self) -> usize {
            self.0.attempts.load(Ordering::SeqCst)
        }

        fn opened(&self) -> usize {
            self.0.opened.load(Ordering::SeqCst)
        }

        async fn push(&self, event: Inbound) {
            let tx = self.0.sockets.lock().last().cloned().expect("no socket");
            tx.send(event).await.expect("socket gone");
        }
    }

    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> Result<Connection> {
            self.0.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = self.0.open_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.0.refuse.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }

            let (tx, rx) = mpsc::channel(16);
            let (close_tx, close_rx) = oneshot::channel::<()>();
            let echo = tx.clone();
            tokio::spawn(async move {
                let _ = close_rx.await;
                let _ = echo
                    .send(Inbound::Closed { code: NORMAL_CLOSE, reason: String::new() })
                    .await;
            });
            self.0.sockets.lock().push(tx);
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Connection { inbound: rx, close: close_tx })
        }
    }

    fn transport(
        connector: &MockConnector,
        streams: &[&str],
    ) -> (StreamTransport<MockConnector>, mpsc::UnboundedReceiver<TransportEvent>) {
        StreamTransport::new(
            "test",
            "wss://stream.example.com:9443",
            streams.iter().map(|s| s.to_string()).collect(),
            SETTLE,
            connector.clone(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn states(events: &[TransportEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn errors(events: &[TransportEvent]) -> Vec<ErrorCode> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::Error(err) => Some(err.code),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn url_joins_streams() {
        let url = build_stream_url(
            "wss://stream.binance.com:9443/",
            &["btcusdt@ticker".into(), "ethusdt@ticker".into()],
        )
        .unwrap();
        assert_eq!(url, "wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/ethusdt@ticker");
    }

    #[test]
    fn url_rejects_bad_input() {
        assert!(build_stream_url("https://x", &["a@ticker".into()]).is_err());
        assert!(build_stream_url("wss://x", &[]).is_err());
        assert!(build_stream_url("wss://x", &["bad stream".into()]).is_err());
    }

    #[tokio::test]
    async fn connect_reaches_connected_once() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);

        t.connect();
        t.connect();
        settle().await;
        t.connect();

        assert_eq!(t.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 1);
        assert_eq!(t.attempts(), 0);
        assert_eq!(
            states(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn frames_are_forwarded_and_bad_json_reported() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        drain(&mut rx);

        connector.push(Inbound::Text(r#"{"e":"24hrTicker"}"#.into())).await;
        connector.push(Inbound::Text("{not json".into())).await;
        settle().await;

        let events = drain(&mut rx);
        assert!(matches!(&events[0], TransportEvent::Frame(v) if v["e"] == "24hrTicker"));
        assert_eq!(errors(&events), vec![ErrorCode::Parse]);
        assert!(states(&events).is_empty());
        assert_eq!(t.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn unexpected_close_reports_once_and_stays_down() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@kline_1m"]);
        t.connect();
        settle().await;
        drain(&mut rx);

        connector
            .push(Inbound::Closed { code: ABNORMAL_CLOSE, reason: "reset".into() })
            .await;
        settle().await;
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![ConnectionState::Disconnected]);
        let codes = errors(&events);
        assert_eq!(codes, vec![ErrorCode::Close(ABNORMAL_CLOSE)]);
        assert!(codes[0].is_connection_class());

        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn clean_server_close_is_not_an_error() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        drain(&mut rx);

        connector
            .push(Inbound::Closed { code: NORMAL_CLOSE, reason: String::new() })
            .await;
        settle().await;

        let events = drain(&mut rx);
        assert!(errors(&events).is_empty());
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn read_failure_moves_to_error() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        drain(&mut rx);

        connector.push(Inbound::Failed("boom".into())).await;
        settle().await;

        assert_eq!(errors(&drain(&mut rx)), vec![ErrorCode::Connection]);
        assert_eq!(t.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn refused_connection_reports_connection_error() {
        let connector = MockConnector::default();
        connector.0.refuse.store(true, Ordering::SeqCst);
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);

        t.connect();
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![ErrorCode::Connection]);
        assert_eq!(t.state(), ConnectionState::Error);
        assert_eq!(t.attempts(), 1);

        // Error is not terminal.
        connector.0.refuse.store(false, Ordering::SeqCst);
        t.reconnect();
        settle().await;
        assert_eq!(t.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn empty_stream_list_is_a_create_error() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &[]);

        t.connect();

        let events = drain(&mut rx);
        assert_eq!(errors(&events), vec![ErrorCode::Create]);
        assert_eq!(t.state(), ConnectionState::Error);
        assert_eq!(connector.attempts(), 0);

        t.update_streams(vec!["btcusdt@ticker".into()]);
        settle().await;
        assert_eq!(t.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_closes_gracefully() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        drain(&mut rx);

        t.disconnect();
        assert_eq!(t.state(), ConnectionState::Disconnecting);
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
        );
        assert!(errors(&events).is_empty());
    }

    #[tokio::test]
    async fn disconnect_from_error_passes_through_disconnecting() {
        let connector = MockConnector::default();
        connector.0.refuse.store(true, Ordering::SeqCst);
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        assert_eq!(t.state(), ConnectionState::Error);
        drain(&mut rx);

        t.disconnect();
        assert_eq!(
            states(&drain(&mut rx)),
            vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
        );

        // Already down: nothing to report.
        t.disconnect();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let (t, _rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;

        t.reconnect();
        t.disconnect();
        settle().await;
        settle().await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_while_connecting_makes_one_fresh_attempt() {
        let connector = MockConnector::default();
        connector.0.open_delay_ms.store(30, Ordering::SeqCst);
        let (t, _rx) = transport(&connector, &["btcusdt@kline_1m"]);

        t.connect();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(t.state(), ConnectionState::Connecting);
        assert_eq!(connector.attempts(), 1);

        t.reconnect();
        t.reconnect();
        tokio::time::sleep(SETTLE + Duration::from_millis(100)).await;

        assert_eq!(t.state(), ConnectionState::Connected);
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.opened(), 1);
    }

    #[tokio::test]
    async fn frames_from_superseded_socket_are_dropped() {
        let connector = MockConnector::default();
        let (t, mut rx) = transport(&connector, &["btcusdt@ticker"]);
        t.connect();
        settle().await;
        let old = connector.0.sockets.lock().last().cloned().unwrap();

        t.reconnect();
        settle().await;
        assert_eq!(t.state(), ConnectionState::Connected);
        drain(&mut rx);

        let _ = old.send(Inbound::Text(r#"{"stale":true}"#.into())).await;
        let _ = old
            .send(Inbound::Closed { code: ABNORMAL_CLOSE, reason: String::new() })
            .await;
        settle().await;

        let events = drain(&mut rx);
        assert!(events.is_empty(), "unexpected events: {events:?}");
        assert_eq!(t.state(), ConnectionState::Connected);
    }
}
