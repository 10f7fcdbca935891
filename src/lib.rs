//! brgnet: tunnel configuration reconciliation engine
//!
//! Keeps WireGuard and AmneziaWG interfaces, their peers and addresses, and
//! the host's NAT, forwarding-block, forwarding and inbound-port policy in
//! line with a durable desired state.
//!
//! # Architecture
//!
//! Every mutating call goes through the [`Reconciler`]: it validates the
//! request, takes the file locks it needs, records the intended state and
//! drives the kernel adapters toward it, rolling back to the last confirmed
//! state when an adapter fails. Reads go through the [`QueryProjector`],
//! which merges stored records with live kernel state and takes no locks.
//!
//! # Modules
//!
//! - `config`: TOML engine configuration and input validation
//! - `engine`: the reconciliation engine and its request types
//! - `error`: error taxonomy
//! - `filter`: packet filter adapter (iptables, sysctl)
//! - `kernel`: tunnel adapters (`ip`, `wg`, `awg`)
//! - `lock`: cross-process advisory locks
//! - `logging`: stderr and per-interface log sinks
//! - `model`: desired-state records
//! - `platform`: command execution and `ip` helpers
//! - `query`: read-only views
//! - `store`: durable JSON state store
//! - `wireguard`: key material and obfuscation parameters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod lock;
pub mod logging;
pub mod model;
pub mod platform;
pub mod query;
pub mod store;
pub mod wireguard;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{AddInterface, ChangeSet, PeerSpec, ReconcileReport, Reconciler};
pub use error::{BrgError, ErrorKind, Result};
pub use query::QueryProjector;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
