//! # opscope-core
//!
//! Core library for opscope - a live surgical procedure telemetry monitor.
//!
//! This library provides:
//! - A connection manager for the broker-backed telemetry feed, with
//!   bounded-retry reconnection and quiet-mode backoff
//! - A pure classifier for inbound stage, tool, and status messages
//! - Stage and tool reconcilers that turn unreliable, possibly duplicated
//!   telemetry into a deduplicated timeline and current-state projections
//! - An analysis session controller for the single allowed remote job
//!
//! ## Architecture
//!
//! Raw messages flow through three layers:
//! - **Feed:** one logical broker connection, payloads parsed before dispatch
//! - **Classification:** pure topic+shape rules produce typed messages
//! - **Reconciliation:** stateful dedup and set-difference logic produce
//!   timeline events and projections for the presentation layer
//!
//! ## Example
//!
//! ```rust,no_run
//! use opscope_core::analysis::AnalysisKind;
//! use opscope_core::{Config, Procedure, ProcedureMonitor};
//!
//! # async fn run() -> opscope_core::Result<()> {
//! let config = Config::load()?;
//! let monitor = ProcedureMonitor::new(config)?;
//!
//! monitor.load_procedure(Procedure::new("op-17", "video01"));
//! monitor.start_analysis(AnalysisKind::ToolDetection).await?;
//!
//! for event in monitor.events() {
//!     println!("{}: {}", event.timestamp, event.description);
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use monitor::ProcedureMonitor;
pub use timeline::TimelineStore;
pub use types::*;

// Public modules
pub mod analysis;
pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod logging;
pub mod monitor;
pub mod reconcile;
pub mod timeline;
pub mod types;
