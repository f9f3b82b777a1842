//! HTTP + WebSocket transport for the relay hub.

mod server;

pub use server::WebServer;
