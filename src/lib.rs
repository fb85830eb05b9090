// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # envdeploy
//!
//! Declarative, environment-scoped infrastructure deployments.
//!
//! ## Overview
//!
//! Each environment (`dev`, `staging`, `prod`, ...) declares the resources it
//! needs in `envdeploy.yaml`. envdeploy compares that desired set with the
//! recorded state of the environment, computes a plan of additions, updates
//! and deletions, and executes it through pluggable providers:
//!
//! - Dependencies between resources are honoured: creation and update run in
//!   topological order, deletion in reverse.
//! - Independent resources run concurrently up to a parallelism bound.
//! - A per-environment lock keeps two operations from mutating the same
//!   environment.
//! - A failed execution is reported as a partial failure and rolled back to
//!   the state captured when it started.
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, templating and validation
//! - [`graph`]: Dependency graph and topological ordering
//! - [`state`]: Per-environment state and lock storage
//! - [`provider`]: Provider contract, built-in providers and registry
//! - [`planner`]: Plan computation
//! - [`orchestrator`]: Execution, rollback and the deploy lifecycle
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! version: "1"
//! providers:
//!   local: { type: local }
//! environments:
//!   staging:
//!     provider: local
//!     variables: { image_tag: "1.4.2" }
//!     resources:
//!       - name: db
//!         type: database
//!         properties: { engine: postgres }
//!       - name: web
//!         type: instance
//!         properties: { image: "web:${var.image_tag}" }
//!         depends_on: [db]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig, ResourceSpec};
pub use error::{DeployError, Result};
pub use graph::ResourceGraph;
pub use orchestrator::{
    DeployOptions, DeployReport, DeploymentPhase, DeploymentResult, ExecuteOptions,
    ExecutionOutcome, Orchestrator, PartialFailure,
};
pub use planner::{ConfirmedPlan, Plan, Planner};
pub use provider::{Provider, ProviderRegistry};
pub use state::{LocalStateStore, State, StateStore};
