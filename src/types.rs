// =============================================================================
// Shared types used across the Market Pulse service
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Lifecycle of a single push-feed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Machine-readable code attached to every feed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Inbound frame was not valid JSON.
    Parse,
    /// Socket could not be opened or failed mid-stream.
    Connection,
    /// Transport could not be constructed (bad endpoint, no streams).
    Create,
    /// Peer closed the connection with a non-normal close code.
    Close(u16),
    /// A well-formed frame could not be applied to the data model.
    Process,
    /// Historical seed fetch failed.
    Seed,
}

impl ErrorCode {
    /// Connection-class codes describe the socket itself rather than the data
    /// flowing over it.
    pub fn is_connection_class(&self) -> bool {
        matches!(self, Self::Connection | Self::Close(_))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse => write!(f, "PARSE_ERROR"),
            Self::Connection => write!(f, "CONNECTION_ERROR"),
            Self::Create => write!(f, "CREATE_ERROR"),
            Self::Close(code) => write!(f, "CLOSE_{code}"),
            Self::Process => write!(f, "PROCESS_ERROR"),
            Self::Seed => write!(f, "SEED_ERROR"),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An error event surfaced to consumers of a feed.
#[derive(Debug, Clone, Serialize)]
pub struct StreamError {
    /// Human-readable error message.
    pub message: String,
    pub code: ErrorCode,
    pub at: DateTime<Utc>,
}

impl StreamError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            at: Utc::now(),
        }
    }
}

/// Monotonically increasing counter bumped on every observable state change.
/// The WebSocket push loop compares versions to decide when to resend.
#[derive(Debug, Clone)]
pub struct StateVersion(Arc<AtomicU64>);

impl Default for StateVersion {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl StateVersion {
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
