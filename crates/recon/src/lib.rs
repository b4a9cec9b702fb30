//! `tillmatch-recon`: N-stage ledger reconciliation engine.
//!
//! One chunk (tenant + date range + type/sub-type + channel) at a time: read
//! every stage's ledger, normalize, aggregate by group key, walk the stage
//! chain, classify, and emit one result per group. Ledger, result store, queue
//! and job store are traits; in-memory implementations ship alongside.

pub mod aggregate;
pub mod classify;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod reader;
pub mod tracker;

pub use config::{ChunkRequest, DateRange, PipelineConfig};
pub use emitter::{MemoryResultSink, ResultEmitter, ResultMessage, ResultPublisher, ResultStore};
pub use engine::{process_chunk, run_chunk, ReconContext, TrackedChunk};
pub use error::ReconError;
pub use model::{ChunkReport, ReconciliationResult};
pub use reader::{LedgerQuery, MemoryLedger};
pub use tracker::{JobStore, JobTracker, MemoryJobStore};
