//! Individual Node Execution
//!
//! Handles the work of a single node inside a worker task:
//! - Argument evaluation against the node's scope
//! - Coercion to the runner's declared input kinds
//! - Handler invocation bounded by cancellation and deadline
//! - Resource creation through the shared slot
//! - Replication evaluation for placeholders

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use serde_json::Value;

use crate::error::RunError;
use crate::workflow::expression::{Expression, LoopVars, Scope};
use crate::workflow::graph::NodeId;
use crate::workflow::instancing::Replication;
use crate::workflow::registry::{
    coerce_arguments, Dependencies, InputSpec, ResourceKindEntry, RunnerEntry,
};

use super::context::RunContext;
use super::resources::ResourceManager;

/// What a finished node hands back to the engine loop.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// A step's output value
    Output(Value),
    /// A resource instance now exists in its slot
    Created,
    /// A placeholder's instances
    Expanded(Vec<LoopVars>),
}

/// Work performed by one node.
pub(crate) enum Work {
    Step {
        runner: RunnerEntry,
        arguments: BTreeMap<String, Expression>,
        deps: Dependencies,
    },
    Create {
        name: String,
        entry: ResourceKindEntry,
        arguments: BTreeMap<String, Expression>,
        resources: Arc<ResourceManager>,
    },
    Expand {
        replication: Replication,
    },
}

/// Bundled parameters for a single node execution task.
pub(crate) struct NodeTask {
    pub id: NodeId,
    pub ctx: RunContext,
    pub scope: Scope,
    pub work: Work,
}

/// Result of a node task, with the instant the work finished.
pub(crate) type TaskResult = (NodeId, Result<NodeOutcome, RunError>, Instant);

impl NodeTask {
    /// Executes this node in its own task so a panicking handler is
    /// reported against the node instead of tearing down the run.
    pub async fn run(self) -> TaskResult {
        let id = self.id.clone();
        let result = match tokio::spawn(self.execute()).await {
            Ok(result) => result,
            Err(join_err) => Err(RunError::Panicked(join_err.to_string())),
        };
        (id, result, Instant::now())
    }

    async fn execute(self) -> Result<NodeOutcome, RunError> {
        let Self {
            id,
            ctx,
            scope,
            work,
        } = self;

        match work {
            Work::Step {
                runner,
                arguments,
                deps,
            } => {
                let input = evaluate_arguments(&runner.shape.inputs, &arguments, &scope)?;
                debug!("Node '{}' input: {}", id, input);

                let output = ctx
                    .guard((runner.handler)(ctx.clone(), deps, input))
                    .await?
                    .map_err(|source| RunError::Step { source })?;
                Ok(NodeOutcome::Output(output))
            }
            Work::Create {
                name,
                entry,
                arguments,
                resources,
            } => {
                let input = evaluate_arguments(&entry.shape.inputs, &arguments, &scope)?;
                let create = entry.create.clone();
                let create_ctx = ctx.clone();

                resources
                    .acquire(&name, || async move {
                        create_ctx
                            .guard(create(create_ctx.clone(), input))
                            .await
                            .and_then(|created| {
                                created.map_err(|source| RunError::Create { source })
                            })
                    })
                    .await?;
                Ok(NodeOutcome::Created)
            }
            Work::Expand { replication } => {
                let instances = replication.instances(id.as_str(), &scope)?;
                if instances.is_empty() {
                    warn!("Node '{}' expands to no instances", id);
                }
                Ok(NodeOutcome::Expanded(instances))
            }
        }
    }
}

/// Evaluates argument expressions and coerces them to declared kinds.
///
/// # Returns
///
/// * `Ok(Value)` - A map of argument name to value
/// * `Err(RunError)` - A reference could not be resolved or a value has the wrong kind
pub fn evaluate_arguments(
    inputs: &[InputSpec],
    arguments: &BTreeMap<String, Expression>,
    scope: &Scope,
) -> Result<Value, RunError> {
    let values = arguments
        .iter()
        .map(|(name, expr)| expr.evaluate(scope).map(|v| (name.clone(), v)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    coerce_arguments(inputs, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::Reference;
    use crate::workflow::registry::{Registry, ResourceInstance, ResourceShape, RunnerShape, ValueKind};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_runner(
            "add",
            RunnerShape::new()
                .input("a", ValueKind::Integer)
                .input("b", ValueKind::Integer)
                .output("sum"),
            |_ctx, _deps, input| async move {
                let sum = input["a"].as_i64().unwrap_or(0) + input["b"].as_i64().unwrap_or(0);
                Ok(json!({ "sum": sum }))
            },
        );
        registry.register_runner(
            "hang",
            RunnerShape::new(),
            |_ctx, _deps, _input| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            },
        );
        registry.register_runner("explode", RunnerShape::new(), |_ctx, _deps, _input| async move {
            panic!("handler blew up")
        });
        registry.register_resource(
            "counter",
            ResourceShape::new(),
            |_ctx, _input| async move { Ok(Arc::new(0_u32) as ResourceInstance) },
            |_instance| async move { Ok(()) },
        );
        registry
    }

    fn step_task(runner: &str, arguments: BTreeMap<String, Expression>, ctx: RunContext) -> NodeTask {
        NodeTask {
            id: NodeId::step(runner),
            ctx,
            scope: Scope::default(),
            work: Work::Step {
                runner: registry().runner(runner).unwrap().clone(),
                arguments,
                deps: Dependencies::new(),
            },
        }
    }

    #[test]
    fn test_evaluate_arguments_coerces() {
        let inputs = RunnerShape::new().input("n", ValueKind::Integer).inputs;
        let mut arguments = BTreeMap::new();
        arguments.insert(
            "n".to_string(),
            Expression::Reference(Reference::step("plan").attr("n")),
        );
        let mut scope = Scope::default();
        scope.insert(Reference::step("plan").attr("n"), json!("12"));

        let input = evaluate_arguments(&inputs, &arguments, &scope).unwrap();
        assert_eq!(input, json!({"n": 12}));
    }

    #[tokio::test]
    async fn test_step_task_output() {
        let mut arguments = BTreeMap::new();
        arguments.insert("a".to_string(), Expression::literal(2));
        arguments.insert("b".to_string(), Expression::literal("3"));

        let (id, result, _) = step_task("add", arguments, RunContext::new()).run().await;
        assert_eq!(id, "step.add");
        assert_eq!(result.unwrap(), NodeOutcome::Output(json!({"sum": 5})));
    }

    #[tokio::test]
    async fn test_step_task_input_type_error() {
        let mut arguments = BTreeMap::new();
        arguments.insert("a".to_string(), Expression::literal("two"));
        arguments.insert("b".to_string(), Expression::literal(3));

        let (_, result, _) = step_task("add", arguments, RunContext::new()).run().await;
        assert!(matches!(result, Err(RunError::InputType { .. })));
    }

    #[tokio::test]
    async fn test_step_task_deadline() {
        let ctx = RunContext::new().for_node("step.hang", Some(Duration::from_millis(20)));
        let (_, result, _) = step_task("hang", BTreeMap::new(), ctx).run().await;
        assert!(matches!(result, Err(RunError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_step_task_panic_is_reported() {
        let (id, result, _) = step_task("explode", BTreeMap::new(), RunContext::new())
            .run()
            .await;
        assert_eq!(id, "step.explode");
        assert!(matches!(result, Err(RunError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_create_task_fills_slot() {
        let resources = Arc::new(ResourceManager::new());
        resources.register("hits", "counter", [NodeId::step("a")]);

        let task = NodeTask {
            id: NodeId::resource("hits"),
            ctx: RunContext::new(),
            scope: Scope::default(),
            work: Work::Create {
                name: "hits".to_string(),
                entry: registry().resource_kind("counter").unwrap().clone(),
                arguments: BTreeMap::new(),
                resources: resources.clone(),
            },
        };
        let (_, result, _) = task.run().await;
        assert_eq!(result.unwrap(), NodeOutcome::Created);
        assert!(resources.instance("hits").is_some());
    }

    #[tokio::test]
    async fn test_expand_task_evaluates_replication() {
        let mut scope = Scope::default();
        scope.insert(Reference::step("plan").attr("n"), json!(3));

        let task = NodeTask {
            id: NodeId::step("fetch"),
            ctx: RunContext::new(),
            scope,
            work: Work::Expand {
                replication: Replication::Count(Expression::Reference(
                    Reference::step("plan").attr("n"),
                )),
            },
        };
        match task.run().await.1.unwrap() {
            NodeOutcome::Expanded(instances) => assert_eq!(instances.len(), 3),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
