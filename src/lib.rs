//! Quay: lifecycle management for containerized tool servers.
//!
//! Quay starts tool servers in containers, waits for them to become ready,
//! speaks a JSON-RPC tool-invocation protocol with them over the stdio of an
//! exec-attached process, monitors their liveness, and tears them down.
//! Every container it creates carries management labels, so containers left
//! behind by a crashed process can be found and reaped.
//!
//! # Architecture
//!
//! Quay follows hexagonal architecture principles:
//!
//! - **Domain**: identifiers, configuration, lifecycle states, and health
//! - **Ports**: the container engine capability trait
//! - **Adapters**: a Docker engine client and an in-memory engine double
//! - **Services**: instance lifecycle, liveness, and the server manager
//!
//! # Modules
//!
//! - [`tool_server`]: tool-server orchestration
//! - [`telemetry`]: structured logging setup

pub mod telemetry;
pub mod tool_server;
