#![warn(missing_docs)]

//! QuotaGate engine: accounting ingestion, subscriber partitioning and the wiring
//! between the policy and enforcement subsystems.

pub mod catalog;
pub mod config;
pub mod dryrun;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod partition;
pub mod stats;
pub mod store;

pub use catalog::Catalog;
pub use config::EngineConfig;
pub use dryrun::LoggingNasClient;
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, Result};
pub use event::{AccountingEvent, EventKind};
pub use ingest::{IngestOutcome, Ingestor};
pub use partition::{PartitionMessage, PartitionRouter};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use store::{MemoryStore, SubscriberRecord, SubscriberStore};
