//! Guardmesh gateway library.
//!
//! Wires the validation pipeline, trigger bus, learning loop, replication
//! log, and gossip transport into one running node, and exposes the
//! outward surfaces: the before-tool-call hook, the HTTP API, and
//! configuration loading.

pub mod api;
pub mod config;
pub mod hook;
pub mod state;

pub use state::{AppState, GatewayStats, LogOnlyDriver};
