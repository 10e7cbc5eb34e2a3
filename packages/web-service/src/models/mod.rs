//! SQL row shapes and queries. The HTTP layer converts these to and from
//! the shared wire model.

mod run;
mod task;

pub use run::RunRow;
pub use task::{apply_patch, TaskRow};
