//! The Runinator worker: lease firings, run handlers, report runs.
//!
//! [`pool::WorkerPool`] drives the lease→run→report cycle over any
//! [`runinator_core::broker::FiringBroker`] binding; [`console`] ships the
//! stock shell handlers; [`report`] posts run records with bounded retries.

pub mod console;
pub mod pool;
pub mod report;

pub use pool::{WorkerConfig, WorkerPool};
