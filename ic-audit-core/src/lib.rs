//! # ic-audit-core
//!
//! Core library for ic-audit - a best-effort local audit trail collector.
//!
//! This library provides:
//! - The event envelope and its wire framing
//! - A fire-and-forget [`Notifier`] for programs that emit audit events
//! - The collector [`AuditServer`] with its in-memory [`Store`]
//! - Durable snapshots and time-windowed dumps
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! ```text
//! Notifier ──TCP/JSON lines──► AuditServer ──► Store ──┬─► SnapshotFile (~/.cellar/loser_audit.jsonl)
//!                                                      └─► Dumper (dumped_audit_trails.json)
//! ```
//!
//! Sending never blocks or fails the caller; the server isolates every
//! connection, and persistence problems never stop it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ic_audit_core::{fast_audit_blocking, Notifier};
//! use ic_audit_core::types::{events, ExtraFields};
//!
//! // One line of audit for a script that exits right away
//! let _ = fast_audit_blocking("nightly-rebalance", "equities", "Nightly portfolio rebalance");
//!
//! // A long-lived sender
//! let notifier = Notifier::new("grid-bot", "crypto", "Grid bot", &[]);
//! notifier.send(events::ERROR, "exchange feed lost", ExtraFields::new());
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use dump::{DumpReport, DumpWindow, Dumper};
pub use error::{Error, Result};
pub use notifier::{fast_audit, fast_audit_blocking, Notifier};
pub use persistence::SnapshotFile;
pub use server::{AuditServer, BlockingServer, ServerState};
pub use store::Store;
pub use types::*;

// Public modules
pub mod config;
pub mod dump;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod persistence;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;
