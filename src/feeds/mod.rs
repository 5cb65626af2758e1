// =============================================================================
// Feeds Module
// =============================================================================
//
// Wires stream transports to their consumers. Each feed drains its transport's
// event channel from a single pump task, so buffers are never mutated in
// parallel.

pub mod chart;
pub mod watchlist;

use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::runtime_config::RuntimeConfig;
use crate::stream::TransportEvent;
use crate::types::{ConnectionState, StateVersion, StreamError};

pub use chart::{ChartSession, ChartSnapshot};
pub use watchlist::WatchlistFeed;

/// Connection settings shared by every feed.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub stream_base_url: String,
    pub settle_delay: Duration,
}

impl FeedSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            stream_base_url: config.stream_base_url.clone(),
            settle_delay: Duration::from_millis(config.reconnect_settle_ms),
        }
    }
}

/// Serialisable connection status of one feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub last_error: Option<StreamError>,
    /// Connection attempts since the last successful open.
    pub attempts: u32,
}

/// Tracks what consumers see of a transport: its state and the most recent
/// error. A successful open clears the error.
#[derive(Debug)]
pub struct FeedMonitor {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<StreamError>>,
    version: StateVersion,
}

impl FeedMonitor {
    pub fn new(version: StateVersion) -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
            version,
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_error.write() = None;
        }
        self.version.bump();
    }

    pub fn record_error(&self, error: StreamError) {
        *self.last_error.write() = Some(error);
        self.version.bump();
    }

    /// Current status; `attempts` comes from the transport the monitor
    /// watches.
    pub fn status(&self, attempts: u32) -> FeedStatus {
        FeedStatus {
            state: *self.state.read(),
            last_error: self.last_error.read().clone(),
            attempts,
        }
    }

    pub fn touch(&self) {
        self.version.bump();
    }
}

/// Drain `events` on a dedicated task, handing each to `handle` in order.
pub(crate) fn spawn_pump<F>(
    label: &'static str,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut handle: F,
) -> JoinHandle<()>
where
    F: FnMut(TransportEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle(event);
        }
        debug!(feed = label, "event pump finished");
    })
}
