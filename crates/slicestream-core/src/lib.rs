//! # Slicestream Core
//!
//! The slice-based incremental aggregation engine for windowed stream
//! processing: unbounded, possibly out-of-order, possibly multi-node streams
//! of timestamped records in; periodically emitted per-window aggregates out.
//!
//! This crate provides:
//! - **Window definitions and assignment**: tumbling, sliding, and session
//!   windows mapped to slice time ranges
//! - **Mergeable aggregation**: a `lift` / `combine` / `lower` algebra with
//!   built-in count, sum, min, max, and average functions
//! - **Slice store**: bounded, reclaimable per-key partial-aggregate state,
//!   safe under concurrent ingestion
//! - **Watermarks and triggering**: per-origin watermark tracking with
//!   bounded lateness and pluggable trigger policies
//! - **Distributed pipeline**: slice creation, merging, and window
//!   computation roles for cross-node decomposition
//!
//! ## Design Principles
//!
//! 1. **Structural locks stay small** - the store's mutex covers pointer and
//!    metadata bookkeeping only, never `combine` or `lower`
//! 2. **Handles, not pointers** - slices are addressed by stable [`slice::SliceId`]
//!    arena indices; lifetime is owned by the store
//! 3. **Merge order never matters** - `combine` is associative and
//!    commutative, which is what makes local pre-aggregation and distributed
//!    merging produce identical results
//!
//! ## Example
//!
//! ```rust
//! use slicestream_core::aggregate::Sum;
//! use slicestream_core::config::EngineContext;
//! use slicestream_core::handler::{RecordColumns, WindowHandler};
//! use slicestream_core::time::OriginId;
//! use slicestream_core::window::WindowDefinition;
//! use std::time::Duration;
//!
//! let def = WindowDefinition::tumbling(Duration::from_millis(10));
//! let handler = WindowHandler::new(
//!     EngineContext::default(),
//!     def,
//!     Sum::new(),
//!     RecordColumns::default(),
//! ).unwrap();
//!
//! // Ingest record batches from worker threads, then:
//! let results = handler.advance_watermark(OriginId(0), 25).unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod config;
pub mod handler;
pub mod pipeline;
pub mod slice;
pub mod time;
pub mod trigger;
pub mod window;

/// Result type for slicestream-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for slicestream-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Time and timestamp-extraction errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Window definition errors
    #[error("Window error: {0}")]
    Window(#[from] window::WindowError),

    /// Aggregation errors
    #[error("Aggregate error: {0}")]
    Aggregate(#[from] aggregate::AggregateError),

    /// Slice store errors
    #[error("Store error: {0}")]
    Store(#[from] slice::StoreError),

    /// Distributed pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    /// Arrow batch construction errors
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}
