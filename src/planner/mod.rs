//! Planning and execution.
//!
//! The planner compares the declared graph with recorded state and produces
//! an immutable [`Plan`]; the executor consumes it exactly once.

mod diff;
mod executor;
mod plan;

pub use diff::{AttributeDiff, ChangeKind, FieldChange};
pub use executor::{
    ActionState, CancellationSignal, CancelledAction, CompletedAction, FailedAction, PlanExecutor,
    RunOutcome, RunResult,
};
pub use plan::{ActionKind, Drift, Plan, PlanSummary, PlannedAction, Planner};
