// =============================================================================
// Stream Module
// =============================================================================
//
// Push-feed connections. A `StreamTransport` owns the connection lifecycle and
// reports frames, state changes and errors on a single event channel.

pub mod connector;
pub mod transport;

pub use connector::{Connector, WsConnector};
pub use transport::{StreamTransport, TransportEvent};
