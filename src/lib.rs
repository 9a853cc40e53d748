//! Tideline - Tiered time-series metric store engine
//!
//! This library provides the server-side core of a metric store:
//! - Metric registry with a label schema and an in-memory lookup cache
//! - Buffered async ingestion with validation and cardinality protection
//! - Query planning over raw samples, pre-computed aggregates, percentiles,
//!   and counter rates
//! - Cold-storage archival of aged samples to an object store, with
//!   transparent query-back
//!
//! The HTTP transport, the time-series store, and the object store live
//! outside this crate; the two storage systems are reached through the
//! traits in [`storage`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod cardinality;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod ingest;
pub mod query;
pub mod registry;
pub mod services;
pub mod storage;
pub mod types;

// Re-export main types
pub use config::Config;
pub use engine::{MetricEngine, MetricEngineBuilder};
pub use error::{Error, ErrorKind, Result};
pub use types::{Labels, Metric, MetricId, MetricKind, Sample, TimeRange};
