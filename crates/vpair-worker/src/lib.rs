//! Pairing and processing worker.
//!
//! This crate provides:
//! - Batch orchestration of pairs and single videos on a worker pool
//! - A supervisor for raw media processes speaking the tool line protocol
//! - The state ledger, the single merge point for persisted state
//! - Startup recovery of interrupted jobs
//! - The `MediaService` façade used by the binary

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod service;
pub mod supervisor;

pub use config::{RecoveryPolicy, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use events::{EventEmitter, EventHub};
pub use ledger::{LedgerSink, StateLedger};
pub use logging::{JobKind, JobLogger};
pub use orchestrator::{BatchOrchestrator, BatchReport};
pub use recovery::{recover_orphans, RecoveryReport};
pub use runner::JobRunner;
pub use service::{ImportReport, MediaService, ProcessReport};
pub use supervisor::ProcessSupervisor;
