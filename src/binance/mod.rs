// =============================================================================
// Binance REST Module
// =============================================================================
//
// Public market-data endpoints used to seed the chart session.

pub mod client;

pub use client::BinanceClient;
