//! mudgate-server: the proxy itself.
//!
//! Accepts browser WebSocket connections on `/ws`, anchors each to a
//! long-lived telnet upstream (TLS or plain TCP), keeps the upstream alive
//! across client disconnects, and replays buffered output on reattach.

pub mod config;
pub mod ops;
pub mod server;
pub mod session;
pub mod upstream;

pub use config::ProxyConfig;
pub use server::ProxyServer;
