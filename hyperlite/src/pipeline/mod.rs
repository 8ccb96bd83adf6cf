//! Table-driven pipeline used to bring a sandbox up.
//!
//! ## Architecture
//!
//! ```text
//! ExecutionPlan → Stages → Tasks
//!
//! - ExecutionPlan: ordered stages, picked from a table by boot mode
//! - Stage: tasks plus an execution mode (parallel/sequential)
//! - Task: one unit of work against a shared context
//! ```
//!
//! The first failing task aborts the whole plan; its error is returned
//! unchanged so callers can decide how to clean up.

mod executor;
mod metrics;
mod stage;
mod task;

pub use executor::{ExecutionPlan, PipelineExecutor};
pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
