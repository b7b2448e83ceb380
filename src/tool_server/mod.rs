//! Containerized tool-server orchestration.
//!
//! A [`ServerManager`](services::ServerManager) owns every server it starts.
//! Each server runs in a labeled container; its tool process is spawned
//! through the engine's exec facility and reached over a newline-delimited
//! JSON-RPC [`transport`] by a [`protocol`] client. The module follows
//! hexagonal architecture:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - Adapter implementations in [`adapters`]
//! - Orchestration services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod protocol;
pub mod services;
pub mod transport;
