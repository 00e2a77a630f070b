//! Definition Validation
//!
//! Structural checks performed before any node is created:
//!
//! - Unique step and resource names
//! - Known runners and resource kinds
//! - Argument names match declared inputs
//! - References point at existing steps and declared outputs
//! - Loop variables only where a replication binds them
//! - `depends_on` names steps, `uses` names resources of an accepted kind
//!
//! Cycle detection over the built node graph also lives here, using
//! Kahn's algorithm.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use log::debug;

use crate::error::BuildError;

use super::expression::{Expression, Reference, Target, Variable};
use super::graph::{Node, NodeId};
use super::model::{Definitions, StepDefinition};
use super::registry::{check_arguments, Registry};

/// Which loop variables an expression may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarScope {
    None,
    Count,
    Each,
}

impl VarScope {
    fn of(step: &StepDefinition) -> Self {
        if step.count.is_some() {
            Self::Count
        } else if step.for_each.is_some() {
            Self::Each
        } else {
            Self::None
        }
    }

    fn allows(self, variable: Variable) -> bool {
        matches!(
            (self, variable),
            (Self::Count, Variable::CountIndex)
                | (Self::Each, Variable::EachKey)
                | (Self::Each, Variable::EachValue)
        )
    }
}

/// Validates definitions against the registry.
///
/// Returns the first problem found.
pub fn validate_definitions(defs: &Definitions, registry: &Registry) -> Result<(), BuildError> {
    let mut step_names = HashSet::new();
    for step in &defs.steps {
        if !step_names.insert(step.name.as_str()) {
            return Err(BuildError::DuplicateStep(step.name.clone()));
        }
    }

    let mut resource_names = HashSet::new();
    for resource in &defs.resources {
        if !resource_names.insert(resource.name.as_str()) {
            return Err(BuildError::DuplicateResource(resource.name.clone()));
        }
    }

    for resource in &defs.resources {
        let node = format!("resource.{}", resource.name);
        let entry = registry
            .resource_kind(&resource.kind)
            .ok_or_else(|| BuildError::UnknownResourceKind {
                resource: resource.name.clone(),
                kind: resource.kind.clone(),
            })?;

        check_arguments(&entry.shape.inputs, resource.arguments.keys())
            .map_err(|reason| BuildError::ShapeMismatch {
                node: node.clone(),
                reason,
            })?;

        for expr in resource.arguments.values() {
            check_value_expression(&node, expr, VarScope::None, defs, registry)?;
        }
    }

    for step in &defs.steps {
        validate_step(step, defs, registry)?;
    }

    debug!(
        "Validated {} steps and {} resources",
        defs.steps.len(),
        defs.resources.len()
    );
    Ok(())
}

fn validate_step(
    step: &StepDefinition,
    defs: &Definitions,
    registry: &Registry,
) -> Result<(), BuildError> {
    let node = format!("step.{}", step.name);

    let entry = registry
        .runner(&step.runner)
        .ok_or_else(|| BuildError::UnknownRunner {
            step: step.name.clone(),
            runner: step.runner.clone(),
        })?;

    if step.count.is_some() && step.for_each.is_some() {
        return Err(BuildError::CountAndForEach(step.name.clone()));
    }

    check_arguments(&entry.shape.inputs, step.arguments.keys()).map_err(|reason| {
        BuildError::ShapeMismatch {
            node: node.clone(),
            reason,
        }
    })?;

    let vars = VarScope::of(step);
    for expr in step.arguments.values() {
        check_value_expression(&node, expr, vars, defs, registry)?;
    }
    for expr in step.count.iter().chain(step.for_each.iter()) {
        check_value_expression(&node, expr, VarScope::None, defs, registry)?;
    }

    for reference in &step.depends_on {
        if !reference.is_step() {
            return Err(BuildError::InvalidDependency {
                node: node.clone(),
                reference: reference.to_string(),
            });
        }
        check_step_reference(&node, reference, defs, registry)?;
    }

    for reference in &step.uses {
        if !reference.is_resource() {
            return Err(BuildError::InvalidUses {
                node: node.clone(),
                reference: reference.to_string(),
            });
        }
        let resource = defs.get_resource(reference.target.name()).ok_or_else(|| {
            BuildError::UnknownReference {
                node: node.clone(),
                reference: reference.to_string(),
            }
        })?;
        if !entry.shape.uses.iter().any(|kind| *kind == resource.kind) {
            return Err(BuildError::ShapeMismatch {
                node: node.clone(),
                reason: format!(
                    "runner '{}' does not accept resource kind '{}'",
                    step.runner, resource.kind
                ),
            });
        }
    }

    Ok(())
}

/// Checks an expression whose value will be computed from references.
fn check_value_expression(
    node: &str,
    expr: &Expression,
    vars: VarScope,
    defs: &Definitions,
    registry: &Registry,
) -> Result<(), BuildError> {
    for variable in expr.variables() {
        if !vars.allows(variable) {
            return Err(BuildError::UnexpectedVariable {
                node: node.to_string(),
                variable: variable.to_string(),
            });
        }
    }

    for reference in expr.references() {
        if reference.is_resource() {
            return Err(BuildError::ResourceValue {
                node: node.to_string(),
                reference: reference.to_string(),
            });
        }
        check_step_reference(node, &reference, defs, registry)?;
    }
    Ok(())
}

fn check_step_reference(
    node: &str,
    reference: &Reference,
    defs: &Definitions,
    registry: &Registry,
) -> Result<(), BuildError> {
    let Target::Step(name) = &reference.target else {
        return Ok(());
    };

    let step = defs
        .get_step(name)
        .ok_or_else(|| BuildError::UnknownReference {
            node: node.to_string(),
            reference: reference.to_string(),
        })?;

    if let Some(attribute) = &reference.attribute {
        let declared = registry
            .runner(&step.runner)
            .map(|entry| entry.shape.has_output(attribute))
            .unwrap_or(false);
        if !declared {
            return Err(BuildError::UndeclaredOutput {
                node: node.to_string(),
                step: step.name.clone(),
                runner: step.runner.clone(),
                attribute: attribute.clone(),
            });
        }
    }
    Ok(())
}

/// Orders nodes so every node follows its predecessors.
///
/// Uses Kahn's algorithm. Nodes left with unresolved predecessors form or
/// feed a cycle and are reported sorted by id.
pub fn topological_order(nodes: &BTreeMap<NodeId, Node>) -> Result<Vec<NodeId>, BuildError> {
    let mut in_degree: HashMap<&NodeId, usize> = nodes
        .iter()
        .map(|(id, node)| (id, node.predecessors.len()))
        .collect();

    let mut queue: VecDeque<&NodeId> = nodes
        .values()
        .filter(|node| node.predecessors.is_empty())
        .map(|node| &node.id)
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());

    while let Some(current) = queue.pop_front() {
        sorted.push(current.clone());

        let Some(node) = nodes.get(current) else {
            continue;
        };
        for successor in &node.successors {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(successor);
                }
            }
        }
    }

    if sorted.len() != nodes.len() {
        let mut remaining: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        remaining.sort();
        return Err(BuildError::Cycle(remaining));
    }

    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ResourceDefinition;
    use crate::workflow::registry::{ResourceInstance, ResourceShape, RunnerShape, ValueKind};
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_runner(
            "echo",
            RunnerShape::new()
                .optional("message", ValueKind::Any)
                .output("message")
                .uses("pool"),
            |_ctx, _deps, input| async move { Ok(input) },
        );
        registry.register_runner(
            "strict",
            RunnerShape::new().input("n", ValueKind::Integer),
            |_ctx, _deps, input| async move { Ok(input) },
        );
        registry.register_resource(
            "pool",
            ResourceShape::new().optional("size", ValueKind::Integer),
            |_ctx, _input| async move { Ok(std::sync::Arc::new(()) as ResourceInstance) },
            |_instance| async move { Ok(()) },
        );
        registry.register_resource(
            "other",
            ResourceShape::new(),
            |_ctx, _input| async move { Ok(std::sync::Arc::new(()) as ResourceInstance) },
            |_instance| async move { Ok(()) },
        );
        registry
    }

    fn expr(text: &str) -> Expression {
        Expression::parse(text).unwrap()
    }

    #[test]
    fn test_valid_definitions() {
        let defs = Definitions::new()
            .with_resource(ResourceDefinition::new("db", "pool").with_argument("size", expr("4")))
            .with_step(StepDefinition::new("a", "echo"))
            .with_step(
                StepDefinition::new("b", "echo")
                    .with_count(Expression::literal(2))
                    .with_argument("message", expr("${step.a.message}-${count.index}"))
                    .uses(Reference::resource("db")),
            );
        assert!(validate_definitions(&defs, &registry()).is_ok());
    }

    #[test]
    fn test_duplicate_names() {
        let defs = Definitions::new()
            .with_step(StepDefinition::new("a", "echo"))
            .with_step(StepDefinition::new("a", "echo"));
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(matches!(err, BuildError::DuplicateStep(name) if name == "a"));

        let defs = Definitions::new()
            .with_resource(ResourceDefinition::new("db", "pool"))
            .with_resource(ResourceDefinition::new("db", "pool"));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::DuplicateResource(_))
        ));
    }

    #[test]
    fn test_unknown_runner_and_kind() {
        let defs = Definitions::new().with_step(StepDefinition::new("a", "nope"));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::UnknownRunner { .. })
        ));

        let defs = Definitions::new().with_resource(ResourceDefinition::new("db", "nope"));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::UnknownResourceKind { .. })
        ));
    }

    #[test]
    fn test_argument_shape() {
        let defs = Definitions::new().with_step(StepDefinition::new("a", "strict"));
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(err.to_string().contains("missing required input 'n'"));

        let defs = Definitions::new().with_step(
            StepDefinition::new("a", "strict")
                .with_argument("n", Expression::literal(1))
                .with_argument("extra", Expression::literal(1)),
        );
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(err.to_string().contains("unknown input 'extra'"));
    }

    #[test]
    fn test_undeclared_output() {
        let defs = Definitions::new()
            .with_step(StepDefinition::new("a", "echo"))
            .with_step(
                StepDefinition::new("b", "echo")
                    .with_argument("message", expr("${step.a.missing}")),
            );
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(err.to_string().contains("reference to undeclared output"));
    }

    #[test]
    fn test_unknown_reference() {
        let defs = Definitions::new().with_step(
            StepDefinition::new("b", "echo").depends_on(Reference::step("ghost")),
        );
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(matches!(err, BuildError::UnknownReference { .. }));
        assert!(err.to_string().contains("step.ghost"));
    }

    #[test]
    fn test_loop_variables_scoped_to_replication() {
        let defs = Definitions::new().with_step(
            StepDefinition::new("a", "echo").with_argument("message", expr("${count.index}")),
        );
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::UnexpectedVariable { .. })
        ));

        let defs = Definitions::new().with_step(
            StepDefinition::new("a", "echo")
                .with_count(Expression::literal(2))
                .with_argument("message", expr("${each.value}")),
        );
        assert!(validate_definitions(&defs, &registry()).is_err());

        let defs = Definitions::new().with_step(
            StepDefinition::new("a", "echo")
                .with_for_each(Expression::literal(json!(["x"])))
                .with_argument("message", expr("${each.key}=${each.value}")),
        );
        assert!(validate_definitions(&defs, &registry()).is_ok());

        let defs = Definitions::new()
            .with_step(StepDefinition::new("a", "echo").with_count(expr("${count.index}")));
        assert!(validate_definitions(&defs, &registry()).is_err());
    }

    #[test]
    fn test_resource_reference_roles() {
        let defs = Definitions::new()
            .with_resource(ResourceDefinition::new("db", "pool"))
            .with_step(StepDefinition::new("a", "echo").with_argument("message", expr("${resource.db}")));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::ResourceValue { .. })
        ));

        let defs = Definitions::new()
            .with_resource(ResourceDefinition::new("db", "pool"))
            .with_step(StepDefinition::new("a", "echo").depends_on(Reference::resource("db")));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::InvalidDependency { .. })
        ));

        let defs = Definitions::new()
            .with_step(StepDefinition::new("a", "echo"))
            .with_step(StepDefinition::new("b", "echo").uses(Reference::step("a")));
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::InvalidUses { .. })
        ));
    }

    #[test]
    fn test_uses_kind_must_be_accepted() {
        let defs = Definitions::new()
            .with_resource(ResourceDefinition::new("x", "other"))
            .with_step(StepDefinition::new("a", "echo").uses(Reference::resource("x")));
        let err = validate_definitions(&defs, &registry()).unwrap_err();
        assert!(err.to_string().contains("does not accept resource kind 'other'"));
    }

    #[test]
    fn test_count_and_for_each_conflict() {
        let defs = Definitions::new().with_step(
            StepDefinition::new("a", "echo")
                .with_count(Expression::literal(1))
                .with_for_each(Expression::literal(json!([1]))),
        );
        assert!(matches!(
            validate_definitions(&defs, &registry()),
            Err(BuildError::CountAndForEach(_))
        ));
    }
}
