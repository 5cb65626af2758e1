// =============================================================================
// HTTP API Module
// =============================================================================
//
// REST reads and commands plus the WebSocket snapshot push.

pub mod rest;
pub mod ws;
