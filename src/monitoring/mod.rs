//! Run Monitoring Module
//!
//! Records the execution timeline of a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Node start/end timing for Gantt charts and reports

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
