//! Workflow Definition Module
//!
//! Data structures and utilities for declaring, parsing and compiling
//! workflows into an execution graph.
//!
//! # Structure
//!
//! - [`model`]: Step and resource definitions
//! - [`expression`]: References, loop variables and placeholder templates
//! - [`registry`]: Runners and resource kinds with their declared shapes
//! - [`parser`]: YAML and JSON loading
//! - [`validator`]: Validation rules and dependency ordering
//! - [`instancing`]: `count` and `for_each` replication
//! - [`graph`]: The compiled node graph
//! - [`planner`]: Execution state and dynamic expansion

pub mod expression;
pub mod graph;
pub mod instancing;
pub mod model;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod validator;

pub use expression::{Expression, LoopVars, Reference, Scope, Variable};
pub use graph::{Graph, Node, NodeId, NodeKind};
pub use instancing::Replication;
pub use model::{Definitions, ResourceDefinition, RetryPolicy, StepDefinition};
pub use parser::{load_definitions, parse_definitions};
pub use planner::{ExecutionPlanner, NodeStatus};
pub use registry::{
    Dependencies, Registry, ResourceInstance, ResourceShape, RunnerShape, ValueKind,
};
