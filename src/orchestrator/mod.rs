//! Deployment orchestration.
//!
//! The orchestrator turns a desired spec set into a plan, executes the
//! confirmed plan against providers and reverses partial work on failure.

mod engine;
mod options;
mod phase;
mod result;

pub use engine::Orchestrator;
pub use options::{DeployOptions, ExecuteOptions};
pub use phase::DeploymentPhase;
pub use result::{
    DeployReport, DeploymentResult, Drift, ExecutionOutcome, ObservedResource, PartialFailure,
};
