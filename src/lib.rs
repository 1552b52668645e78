#![doc = include_str!("../README.md")]
// Declare modules
pub mod align;
pub mod config;
pub mod consolidate;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod fetch;
pub mod finder;
pub mod functions;
pub mod intervals;
pub mod memory;
pub mod node;
pub mod pattern;
pub mod readers;
pub mod search;
pub mod store;
pub mod telemetry;
pub mod types;

/// Configuration options for the query engine.
pub use crate::engine::EngineConfig;
/// Main entry point: find, fetch and render requests.
pub use crate::engine::{QueryEngine, RenderResult};
/// Already-parsed call graph of a render target.
pub use crate::evaluator::Expr;
/// Error type for query operations.
pub use crate::error::QueryError;
/// Backend contracts.
pub use crate::finder::{FindQuery, Finder, FinderCapabilities, MultiFetch};
pub use crate::node::{FetchResult, LeafNode, Node, Reader};
/// Time coverage bookkeeping.
pub use crate::intervals::{Interval, IntervalSet};
/// In-memory reference backend.
pub use crate::memory::MemoryFinder;
/// Structured event hook for observability.
pub use crate::telemetry::{QueryEvent, QueryEventListener};
/// Series and time-grid value types.
pub use crate::types::{ConsolidationFunc, MetricPath, Point, Series, TimeInfo, Timestamp, Value};
