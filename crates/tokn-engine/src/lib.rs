//! Runs flow graphs: validation, per-node model streaming with tool calls,
//! and hand-off to optimizer backends.

pub mod executor;
pub mod optimizer;
pub mod tool_loop;
pub mod validate;

pub use executor::{FlowExecutor, NodeResult, RunReport};
pub use optimizer::{
    HttpOptimizerBackend, OptimizerBackend, OptimizerContext, OptimizerOutcome, Progress,
};
pub use tool_loop::ModelOutcome;
pub use validate::ValidationIssue;
