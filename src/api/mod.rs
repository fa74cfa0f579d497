// =============================================================================
// API Module
// =============================================================================
//
// REST endpoints (health, active signals, pipeline stats) and the push
// WebSocket server.

pub mod rest;
pub mod ws;

pub use ws::PushServer;
