//! Error Types
//!
//! Errors are split by the phase that produces them:
//!
//! - [`BuildError`]: structural problems found while compiling definitions
//!   into a graph. Nothing has run when one of these is returned.
//! - [`RunError`]: a single node failing during execution.
//! - [`DestroyError`]: a resource teardown failure, recorded but non-fatal.
//! - [`ExecuteError`]: the terminal outcome of a run.
//!
//! Handler errors are kept as boxed sources so callers can find the
//! original cause with [`ExecuteError::find_cause`].

use std::error::Error as StdError;

use thiserror::Error;

use crate::execution::engine::RunReport;
use crate::workflow::graph::NodeId;

/// Boxed error returned by runner and resource handlers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Invalid replication value for a step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CountError {
    #[error("count for step {step} must be a number, but got {found}")]
    NotANumber { step: String, found: &'static str },

    #[error("count for step {step} cannot be negative")]
    Negative { step: String },

    #[error("count for step {step} must be a whole number, but got {value}")]
    Fractional { step: String, value: f64 },

    #[error("for_each for step {step} must be a list or map, but got {found}")]
    NotACollection { step: String, found: &'static str },

    #[error("count for step {step} must be at most {max}, but got {value}")]
    TooLarge { step: String, value: f64, max: usize },
}

/// Malformed expression text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("invalid reference '{text}': {reason}")]
    InvalidReference { text: String, reason: String },
}

/// Failure evaluating an expression against a scope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("no value available for {0}")]
    UnresolvedReference(String),

    #[error("variable {0} is not bound")]
    UnboundVariable(String),
}

/// Structural error detected before any node runs.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("duplicate resource name '{0}'")]
    DuplicateResource(String),

    #[error("step {step}: unknown runner '{runner}'")]
    UnknownRunner { step: String, runner: String },

    #[error("resource {resource}: unknown resource kind '{kind}'")]
    UnknownResourceKind { resource: String, kind: String },

    #[error("{node}: shape mismatch: {reason}")]
    ShapeMismatch { node: String, reason: String },

    #[error("{node}: reference to unknown {reference}")]
    UnknownReference { node: String, reference: String },

    #[error(
        "{node}: ambiguous implicit dependency on {reference}: step {step} has {count} instances, \
         use an index or [*]"
    )]
    AmbiguousImplicitDependency {
        node: String,
        reference: String,
        step: String,
        count: usize,
    },

    #[error(
        "{node}: ambiguous dependency on {reference}: step {step} has {count} instances, \
         use an index or [*]"
    )]
    AmbiguousDependency {
        node: String,
        reference: String,
        step: String,
        count: usize,
    },

    #[error("{node}: {reference} refers to step {step}, which has no instances")]
    NoInstances {
        node: String,
        reference: String,
        step: String,
    },

    #[error("{node}: reference to undeclared output '{attribute}' of step {step} (runner {runner})")]
    UndeclaredOutput {
        node: String,
        step: String,
        runner: String,
        attribute: String,
    },

    #[error("{node}: index {index} out of range for step {step} with {count} instances")]
    IndexOutOfRange {
        node: String,
        step: String,
        index: usize,
        count: usize,
    },

    #[error("{node}: step {step} is not replicated and cannot be indexed")]
    NotReplicated { node: String, step: String },

    #[error("{node}: variable {variable} is not available here")]
    UnexpectedVariable { node: String, variable: String },

    #[error("step {0}: count and for_each are mutually exclusive")]
    CountAndForEach(String),

    #[error("{node}: resource {reference} cannot be used as a value, declare it in uses")]
    ResourceValue { node: String, reference: String },

    #[error("{node}: depends_on entry {reference} must name a step")]
    InvalidDependency { node: String, reference: String },

    #[error("{node}: uses entry {reference} must name a resource")]
    InvalidUses { node: String, reference: String },

    #[error("dependency cycle detected among: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("expansion of {0} is not pending")]
    NotExpandable(String),

    #[error("{0}")]
    Count(#[from] CountError),

    #[error("{0}")]
    Expression(#[from] ExpressionError),

    #[error("{0}")]
    Eval(#[from] EvalError),
}

/// Failure of a single node during a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("step failed: {source}")]
    Step {
        #[source]
        source: BoxError,
    },

    #[error("resource creation failed: {source}")]
    Create {
        #[source]
        source: BoxError,
    },

    #[error("deadline exceeded")]
    DeadlineExceeded(#[from] tokio::time::error::Elapsed),

    #[error("run cancelled")]
    Cancelled,

    #[error("argument '{input}' must be {expected}, but got {found}")]
    InputType {
        input: String,
        expected: String,
        found: &'static str,
    },

    #[error("{node} did not produce output '{attribute}'")]
    MissingOutput { node: String, attribute: String },

    #[error("resource {0} is not available")]
    ResourceUnavailable(String),

    #[error("no handler registered for {0}")]
    MissingHandler(String),

    #[error("{0}")]
    Count(#[from] CountError),

    #[error("{0}")]
    Eval(#[from] EvalError),

    #[error("graph expansion failed: {0}")]
    Expansion(#[source] BuildError),

    #[error("worker task panicked: {0}")]
    Panicked(String),
}

/// Resource teardown failure.
#[derive(Debug, Error)]
#[error("destroy of resource {resource} failed: {source}")]
pub struct DestroyError {
    pub resource: String,
    #[source]
    pub source: BoxError,
}

/// Terminal error of a run.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("{node} failed: {source}")]
    Failed {
        node: NodeId,
        #[source]
        source: RunError,
        report: Box<RunReport>,
    },

    #[error("run cancelled before completion")]
    Cancelled { report: Box<RunReport> },

    #[error("run stalled with {} nodes unable to start: {}", .pending.len(), join_ids(.pending))]
    Stalled {
        pending: Vec<NodeId>,
        report: Box<RunReport>,
    },
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}

impl ExecuteError {
    /// True for structural errors raised before execution started.
    pub fn is_build_error(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Report of the partial run, if execution started.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Build(_) => None,
            Self::Failed { report, .. }
            | Self::Cancelled { report }
            | Self::Stalled { report, .. } => Some(report),
        }
    }

    /// Node that caused the failure.
    pub fn failed_node(&self) -> Option<&NodeId> {
        match self {
            Self::Failed { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Walks the source chain looking for an error of type `E`.
    pub fn find_cause<E: StdError + 'static>(&self) -> Option<&E> {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(found) = err.downcast_ref::<E>() {
                return Some(found);
            }
            current = err.source();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("injected")]
    struct Injected;

    #[test]
    fn test_count_error_messages() {
        let err = CountError::NotANumber {
            step: "step.b".to_string(),
            found: "string",
        };
        assert_eq!(err.to_string(), "count for step step.b must be a number, but got string");

        let err = CountError::Negative {
            step: "step.b".to_string(),
        };
        assert!(err.to_string().contains("cannot be negative"));
    }

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = BuildError::Cycle(vec!["step.a".to_string(), "step.b".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("step.a, step.b"));
    }

    #[test]
    fn test_ambiguous_messages() {
        let implicit = BuildError::AmbiguousImplicitDependency {
            node: "step.b".to_string(),
            reference: "step.a.out".to_string(),
            step: "a".to_string(),
            count: 3,
        };
        assert!(implicit.to_string().contains("ambiguous implicit dependency"));

        let explicit = BuildError::AmbiguousDependency {
            node: "step.b".to_string(),
            reference: "step.a".to_string(),
            step: "a".to_string(),
            count: 3,
        };
        assert!(explicit.to_string().contains("ambiguous dependency"));
    }

    #[test]
    fn test_run_error_keeps_source() {
        let err = RunError::Step {
            source: Box::new(Injected),
        };
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<Injected>().is_some());
    }

    #[test]
    fn test_count_cause_survives_wrapping() {
        let err = RunError::from(CountError::Negative {
            step: "step.b".to_string(),
        });
        assert_eq!(err.to_string(), "count for step step.b cannot be negative");
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<CountError>().is_some());

        let err = BuildError::from(EvalError::UnboundVariable("count.index".to_string()));
        let source = err.source().expect("source");
        assert!(source.downcast_ref::<EvalError>().is_some());
    }

    #[test]
    fn test_build_error_is_build() {
        let err = ExecuteError::from(BuildError::DuplicateStep("a".to_string()));
        assert!(err.is_build_error());
        assert!(err.report().is_none());
        assert!(err.find_cause::<BuildError>().is_some());
    }
}
