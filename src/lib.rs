//! # Metagraph
//!
//! Metagraph is the write path of an RDF metadata repository. Concurrent write requests are
//! batched into single graph transactions, every committed delta is appended to a durable
//! transaction log, and a relational projection of the graph is kept up to date for fast
//! filtered and paginated queries.
//!
//! ## Features
//!
//! - Batch commit scheduler with partial-failure isolation
//! - Sharded, crash-safe transaction log with pluggable codecs and replay
//! - Change tracking per write transaction
//! - View projection into SQLite with set columns, joins and materialized views
//!
//! ## Example
//!
//! ```rust
//! use metagraph::core::CallerContext;
//! use metagraph::store::MemoryGraphStore;
//! use metagraph::transactions::BatchCommitScheduler;
//! use std::sync::Arc;
//!
//! fn example() -> metagraph::Result<()> {
//!     let scheduler = BatchCommitScheduler::unlogged(Arc::new(MemoryGraphStore::new()))?;
//!     let caller = CallerContext::new("user-1", "Alice");
//!     let answer = scheduler.submit_write(caller, |_ctx| Ok(42))?;
//!     assert_eq!(answer, 42);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::doc_markdown)]

/// Application configuration
pub mod config;

/// Statements, caller context, term syntax and vocabulary
pub mod core;

/// Error types
pub mod error;

/// Graph store abstraction and the in-memory store
pub mod store;

/// Batching, change tracking, the transaction log and recovery
pub mod transactions;

/// Relational view projection and queries
pub mod views;

pub use error::{Error, Result};
