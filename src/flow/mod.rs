//! Stage wiring: a dependency graph of named stages, each run with its own
//! retry policy by a sequential scheduler.

pub mod dag;
pub mod retry;
pub mod scheduler;
pub mod stages;

pub use dag::TaskGraph;
pub use retry::{RetryPolicy, RetryScope};
pub use scheduler::{RunReport, Scheduler, TaskFn};
pub use stages::{build_pipeline, run_gold, run_silver_table, PipelineContext, Plan};
