//! canopy-core: nested-interval hierarchy engine.
//!
//! One SQLite store holds many isolated organizational trees, one per
//! (tenant, domain) scope. Each node carries an integer interval that
//! strictly contains every descendant's interval, which turns ancestor
//! chains, subtree listings, and cumulative counter propagation into
//! single interval-predicate queries. Materialized paths and per-node
//! counters are denormalizations on top; reconciliation re-derives both
//! from authority when they drift.
//!
//! [`store::Engine`] is the entry point; the modules underneath it are
//! usable on their own against any connection from [`db::open_store`].
//!
//! # Conventions
//!
//! - **Errors**: plumbing returns `anyhow::Result`; the engine surface
//!   returns [`error::EngineError`], every variant carrying a stable
//!   machine code.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`).
//!   Corrections and refusals are logged where they happen.
//! - **Transactions**: callers of `tree::*` and `stats::*` own the
//!   transaction; the engine wraps each operation in exactly one.

pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod model;
pub mod reconcile;
pub mod scope;
pub mod stats;
pub mod store;
pub mod tree;
pub mod verify;
