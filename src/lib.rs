//! StepRunner - Declarative Workflow Execution Engine
//!
//! Runs declared steps and shared resources as a dependency graph.
//! Steps may be replicated with `count` or `for_each`, including counts
//! only known once an upstream step has produced its output.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Definitions, expressions, the runner registry and graph building
//! - [`execution`]: Bounded parallel engine with resource lifecycle and fail-fast
//! - [`monitoring`]: Execution timeline
//! - [`builtin`]: Small runner registry used by the command line
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use steprunner::execution::RunContext;
//! use steprunner::workflow::{Expression, Reference, StepDefinition};
//! use steprunner::{build, builtin, execute, Definitions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let defs = Definitions::new()
//!         .with_step(StepDefinition::new("hello", "echo")
//!             .with_argument("message", Expression::literal("hi")))
//!         .with_step(StepDefinition::new("reply", "echo")
//!             .with_argument("message", Expression::Reference(
//!                 Reference::step("hello").attr("message"))));
//!
//!     let registry = Arc::new(builtin::registry());
//!     let graph = build(&defs, &registry)?;
//!     let report = execute(RunContext::new(), graph, registry, 4).await?;
//!     println!("{}", report.summary());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod builtin;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{BuildError, ExecuteError, RunError};
pub use execution::{Engine, RunContext, RunReport};
pub use workflow::graph::Graph;
pub use workflow::model::Definitions;
pub use workflow::parser::load_definitions;
pub use workflow::registry::Registry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StepRunner";

/// Compiles definitions into an execution graph.
///
/// Fails without running anything when the definitions are structurally
/// invalid: unknown runners, cycles, ambiguous references and so on.
pub fn build(defs: &Definitions, registry: &Registry) -> Result<Graph, BuildError> {
    Graph::build(defs, registry)
}

/// Executes a graph with at most `workers` nodes running at once.
pub async fn execute(
    ctx: RunContext,
    graph: Graph,
    registry: Arc<Registry>,
    workers: usize,
) -> Result<RunReport, ExecuteError> {
    let mut engine = Engine::new(registry);
    engine.set_max_parallel(workers);
    engine.execute(ctx, graph).await
}
