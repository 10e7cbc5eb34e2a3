//! The Runinator web service: JSON admin API over SQLite.
//!
//! Owns the `scheduled_tasks` and `task_runs` tables. The scheduler reads
//! and advances tasks here; workers post run records; the command center
//! and the importer manage task definitions.

pub mod app;
pub mod models;
pub mod routes;

pub use app::build_app;
