//! Built-in Runners
//!
//! A small registry for trying definitions from the command line:
//!
//! - `echo`: returns its `message` argument as output `message`
//! - `sleep`: waits `ms` milliseconds, then echoes `message`
//! - `fail`: always fails with its `message`
//! - `increment`: adds `by` (default 1) to every counter it uses, output `value`
//! - resource kind `counter`: a shared `AtomicU64` starting at `start`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde_json::{json, Value};

use crate::error::BoxError;
use crate::workflow::registry::{
    Registry, ResourceInstance, ResourceShape, RunnerShape, ValueKind,
};

/// Registry with the built-in runners and resource kinds.
pub fn registry() -> Registry {
    let mut registry = Registry::new();

    registry.register_runner(
        "echo",
        RunnerShape::new()
            .optional("message", ValueKind::Any)
            .output("message"),
        |_ctx, _deps, input| async move {
            let message = input.get("message").cloned().unwrap_or(Value::Null);
            Ok(json!({ "message": message }))
        },
    );

    registry.register_runner(
        "sleep",
        RunnerShape::new()
            .input("ms", ValueKind::Integer)
            .optional("message", ValueKind::Any)
            .output("message")
            .output("slept_ms"),
        |_ctx, _deps, input| async move {
            let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let message = input.get("message").cloned().unwrap_or(Value::Null);
            Ok(json!({ "message": message, "slept_ms": ms }))
        },
    );

    registry.register_runner(
        "fail",
        RunnerShape::new().optional("message", ValueKind::String),
        |_ctx, _deps, input| async move {
            let message = input
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("step failed")
                .to_string();
            Err(BoxError::from(message))
        },
    );

    registry.register_runner(
        "increment",
        RunnerShape::new()
            .optional("by", ValueKind::Integer)
            .output("value")
            .uses("counter"),
        |_ctx, deps, input| async move {
            let by = input.get("by").and_then(Value::as_u64).unwrap_or(1);
            let mut value = 0;
            for name in deps.names() {
                let counter = deps
                    .get::<AtomicU64>(name)
                    .ok_or_else(|| format!("resource {} is not a counter", name))?;
                value = counter.fetch_add(by, Ordering::SeqCst) + by;
            }
            Ok::<_, BoxError>(json!({ "value": value }))
        },
    );

    registry.register_resource(
        "counter",
        ResourceShape::new().optional("start", ValueKind::Integer),
        |_ctx, input| async move {
            let start = input.get("start").and_then(Value::as_u64).unwrap_or(0);
            Ok(Arc::new(AtomicU64::new(start)) as ResourceInstance)
        },
        |instance| async move {
            if let Ok(counter) = instance.downcast::<AtomicU64>() {
                info!("Counter finished at {}", counter.load(Ordering::SeqCst));
            }
            Ok(())
        },
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Engine, RunContext};
    use crate::workflow::{parse_definitions, Graph, NodeStatus};

    #[test]
    fn test_registry_contents() {
        let registry = registry();
        for name in ["echo", "sleep", "fail", "increment"] {
            assert!(registry.runner(name).is_some(), "missing runner {}", name);
        }
        assert!(registry.resource_kind("counter").is_some());
    }

    #[tokio::test]
    async fn test_builtin_run() {
        let defs = parse_definitions(
            r#"
resources:
  - name: hits
    kind: counter
    arguments:
      start: 10

steps:
  - name: plan
    runner: echo
    arguments:
      message: 2
  - name: work
    runner: increment
    count: ${step.plan.message}
    uses: [hits]
  - name: done
    runner: sleep
    arguments:
      ms: 5
      message: ${step.work[*].value}
"#,
        )
        .unwrap();

        let registry = Arc::new(registry());
        let graph = Graph::build(&defs, &registry).unwrap();
        let report = Engine::new(registry)
            .execute(RunContext::new(), graph)
            .await
            .unwrap();

        let mut values: Vec<u64> = report.result("step.done").unwrap()["message"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_u64)
            .collect();
        values.sort();
        assert_eq!(values, vec![11, 12]);
        assert_eq!(report.status("resource.hits"), Some(&NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_builtin_fail_message() {
        let defs = parse_definitions(
            "steps:\n  - name: boom\n    runner: fail\n    arguments:\n      message: disk full\n",
        )
        .unwrap();
        let registry = Arc::new(registry());
        let graph = Graph::build(&defs, &registry).unwrap();
        let err = Engine::new(registry)
            .execute(RunContext::new(), graph)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "step.boom failed: step failed: disk full");
    }
}
