mod health;
mod task_runs;
pub mod tasks;

pub use health::health_handler;
pub use task_runs::{list_task_runs_handler, record_run_handler};
pub use tasks::{
    create_task_handler, list_tasks_handler, patch_task_handler, request_run_handler,
};
