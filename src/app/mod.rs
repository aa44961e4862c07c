//! Application layer: lifecycle orchestration, batching and background work.

pub mod batch;
pub mod registry;
pub mod service;
pub mod worker;

pub use batch::BatchCoordinator;
pub use registry::{ChainFactory, ServiceRegistry};
pub use service::{ServiceSettings, TransactionService};
pub use worker::{AnchorWorker, WorkerConfig, WorkerReport, spawn_worker};
