//! Workflow Execution Module
//!
//! Runs a built graph: bounded parallel scheduling, resource lifecycle
//! and fail-fast cancellation.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine orchestrating runs
//! - [`step`]: Work of a single node inside a worker task
//! - [`resources`]: Create-once slots and release after the last consumer
//! - [`context`]: Cancellation and deadline scope handed to handlers

pub mod context;
pub mod engine;
pub mod resources;
pub mod step;

pub use context::RunContext;
pub use engine::{Engine, RunReport};
