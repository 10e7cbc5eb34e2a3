//! The Runinator broker: a claim-once queue for task firings.
//!
//! The queue itself lives in [`queue::FiringQueue`] and can run embedded in
//! another process (the `--broker-backend in-memory` binding and the test
//! suites use it directly). The `runinator-broker` binary wraps the same
//! queue with the HTTP control plane in [`http`].

pub mod http;
pub mod queue;

pub use queue::{sweep_loop, FiringQueue};
