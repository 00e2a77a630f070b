//! Handler Registry
//!
//! Maps declared runner names and resource kinds to callables with a uniform
//! calling convention, plus the shape (inputs, outputs, used resource kinds)
//! the graph builder validates definitions against.
//!
//! The registry is built once at startup and passed explicitly to both the
//! builder and the engine.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{BoxError, RunError};
use crate::execution::context::RunContext;

use super::expression::value_type_name;

/// Boxed future returned by handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A created resource, shared by reference with every consumer.
pub type ResourceInstance = Arc<dyn Any + Send + Sync>;

/// Step callable: `(context, dependencies, input) -> output`.
pub type StepHandler =
    Arc<dyn Fn(RunContext, Dependencies, Value) -> BoxFuture<Result<Value, BoxError>> + Send + Sync>;

/// Resource create callable: `(context, input) -> instance`.
pub type CreateHandler =
    Arc<dyn Fn(RunContext, Value) -> BoxFuture<Result<ResourceInstance, BoxError>> + Send + Sync>;

/// Resource destroy callable: `(instance) -> ()`.
pub type DestroyHandler =
    Arc<dyn Fn(ResourceInstance) -> BoxFuture<Result<(), BoxError>> + Send + Sync>;

/// Declared type of an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Any,
    String,
    Number,
    Integer,
    Bool,
    List,
    Map,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any value",
            Self::String => "a string",
            Self::Number => "a number",
            Self::Integer => "an integer",
            Self::Bool => "a bool",
            Self::List => "a list",
            Self::Map => "a map",
        };
        write!(f, "{}", name)
    }
}

impl ValueKind {
    /// Converts a value to this kind, if a lossless conversion exists.
    pub fn coerce(self, value: Value) -> Option<Value> {
        match (self, value) {
            (Self::Any, v) => Some(v),
            (Self::String, Value::String(s)) => Some(Value::String(s)),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Number, Value::Number(n)) => Some(Value::Number(n)),
            (Self::Number, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            (Self::Integer, Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Some(Value::from(i)),
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Some(Value::from(f as i64))
                }
                _ => None,
            },
            (Self::Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
            (Self::Bool, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            (Self::List, Value::Array(items)) => Some(Value::Array(items)),
            (Self::Map, Value::Object(entries)) => Some(Value::Object(entries)),
            _ => None,
        }
    }
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: String,
    pub kind: ValueKind,
    pub required: bool,
}

/// Declared shape of a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerShape {
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<String>,
    pub uses: Vec<String>,
}

impl RunnerShape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a required input.
    pub fn input(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Declares an optional input.
    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Declares an output attribute.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// Declares a resource kind the runner expects in `uses`.
    pub fn uses(mut self, kind: impl Into<String>) -> Self {
        self.uses.push(kind.into());
        self
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }
}

/// Declared shape of a resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceShape {
    pub inputs: Vec<InputSpec>,
}

impl ResourceShape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.inputs.push(InputSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }
}

/// Checks argument names against declared inputs.
///
/// Returns a description of the first mismatch.
pub fn check_arguments<'a>(
    inputs: &[InputSpec],
    arguments: impl Iterator<Item = &'a String>,
) -> Result<(), String> {
    let names: Vec<&String> = arguments.collect();

    for name in &names {
        if !inputs.iter().any(|i| &&i.name == name) {
            return Err(format!("unknown input '{}'", name));
        }
    }
    for input in inputs.iter().filter(|i| i.required) {
        if !names.iter().any(|n| **n == input.name) {
            return Err(format!("missing required input '{}'", input.name));
        }
    }
    Ok(())
}

/// Coerces evaluated arguments to their declared kinds.
pub fn coerce_arguments(
    inputs: &[InputSpec],
    arguments: BTreeMap<String, Value>,
) -> Result<Value, RunError> {
    let mut out = serde_json::Map::new();
    for (name, value) in arguments {
        let kind = inputs
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.kind)
            .unwrap_or(ValueKind::Any);
        let found = value_type_name(&value);
        let coerced = kind.coerce(value).ok_or_else(|| RunError::InputType {
            input: name.clone(),
            expected: kind.to_string(),
            found,
        })?;
        out.insert(name, coerced);
    }
    Ok(Value::Object(out))
}

/// Resource instances handed to a step.
#[derive(Clone, Default)]
pub struct Dependencies {
    resources: BTreeMap<String, ResourceInstance>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, instance: ResourceInstance) {
        self.resources.insert(name.into(), instance);
    }

    /// Raw instance by resource name.
    pub fn instance(&self, name: &str) -> Option<&ResourceInstance> {
        self.resources.get(name)
    }

    /// Instance by resource name, downcast to its concrete type.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.resources.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.resources.keys()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A registered runner.
#[derive(Clone)]
pub struct RunnerEntry {
    pub shape: RunnerShape,
    pub handler: StepHandler,
}

/// A registered resource kind.
#[derive(Clone)]
pub struct ResourceKindEntry {
    pub shape: ResourceShape,
    pub create: CreateHandler,
    pub destroy: DestroyHandler,
}

/// Lookup table of runners and resource kinds.
#[derive(Clone, Default)]
pub struct Registry {
    runners: HashMap<String, RunnerEntry>,
    resources: HashMap<String, ResourceKindEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step runner.
    pub fn register_runner<F, Fut>(&mut self, name: impl Into<String>, shape: RunnerShape, f: F)
    where
        F: Fn(RunContext, Dependencies, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        let handler: StepHandler = Arc::new(
            move |ctx: RunContext, deps: Dependencies, input: Value| -> BoxFuture<Result<Value, BoxError>> {
                Box::pin(f(ctx, deps, input))
            },
        );
        self.runners
            .insert(name.into(), RunnerEntry { shape, handler });
    }

    /// Registers a resource kind.
    pub fn register_resource<C, CFut, D, DFut>(
        &mut self,
        kind: impl Into<String>,
        shape: ResourceShape,
        create: C,
        destroy: D,
    ) where
        C: Fn(RunContext, Value) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<ResourceInstance, BoxError>> + Send + 'static,
        D: Fn(ResourceInstance) -> DFut + Send + Sync + 'static,
        DFut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let create: CreateHandler = Arc::new(
            move |ctx: RunContext, input: Value| -> BoxFuture<Result<ResourceInstance, BoxError>> {
                Box::pin(create(ctx, input))
            },
        );
        let destroy: DestroyHandler = Arc::new(
            move |instance: ResourceInstance| -> BoxFuture<Result<(), BoxError>> {
                Box::pin(destroy(instance))
            },
        );
        self.resources.insert(
            kind.into(),
            ResourceKindEntry {
                shape,
                create,
                destroy,
            },
        );
    }

    pub fn runner(&self, name: &str) -> Option<&RunnerEntry> {
        self.runners.get(name)
    }

    pub fn resource_kind(&self, kind: &str) -> Option<&ResourceKindEntry> {
        self.resources.get(kind)
    }

    pub fn runner_names(&self) -> Vec<&String> {
        let mut names: Vec<_> = self.runners.keys().collect();
        names.sort();
        names
    }

    pub fn resource_kinds(&self) -> Vec<&String> {
        let mut kinds: Vec<_> = self.resources.keys().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("runners", &self.runner_names())
            .field("resources", &self.resource_kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_kind_coercion() {
        assert_eq!(ValueKind::Number.coerce(json!("2.5")), Some(json!(2.5)));
        assert_eq!(ValueKind::Integer.coerce(json!("42")), Some(json!(42)));
        assert_eq!(ValueKind::Integer.coerce(json!(3.0)), Some(json!(3)));
        assert_eq!(ValueKind::Integer.coerce(json!(3.5)), None);
        assert_eq!(ValueKind::String.coerce(json!(7)), Some(json!("7")));
        assert_eq!(ValueKind::Bool.coerce(json!("true")), Some(json!(true)));
        assert_eq!(ValueKind::Bool.coerce(json!("yes")), None);
        assert_eq!(ValueKind::List.coerce(json!({})), None);
        assert_eq!(ValueKind::Any.coerce(json!(null)), Some(json!(null)));
    }

    #[test]
    fn test_check_arguments() {
        let shape = RunnerShape::new()
            .input("url", ValueKind::String)
            .optional("retries", ValueKind::Integer);

        let ok = ["url".to_string()];
        assert!(check_arguments(&shape.inputs, ok.iter()).is_ok());

        let unknown = ["url".to_string(), "body".to_string()];
        let err = check_arguments(&shape.inputs, unknown.iter()).unwrap_err();
        assert!(err.contains("unknown input 'body'"));

        let missing = ["retries".to_string()];
        let err = check_arguments(&shape.inputs, missing.iter()).unwrap_err();
        assert!(err.contains("missing required input 'url'"));
    }

    #[test]
    fn test_coerce_arguments_reports_type() {
        let inputs = RunnerShape::new().input("n", ValueKind::Integer).inputs;
        let mut args = BTreeMap::new();
        args.insert("n".to_string(), json!("many"));

        let err = coerce_arguments(&inputs, args).unwrap_err();
        assert_eq!(
            err.to_string(),
            "argument 'n' must be an integer, but got string"
        );
    }

    #[test]
    fn test_dependencies_downcast() {
        let mut deps = Dependencies::new();
        deps.insert("counter", Arc::new(5_u32) as ResourceInstance);

        assert_eq!(deps.get::<u32>("counter").as_deref(), Some(&5));
        assert!(deps.get::<String>("counter").is_none());
        assert!(deps.get::<u32>("missing").is_none());
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn test_register_and_call_runner() {
        let mut registry = Registry::new();
        registry.register_runner(
            "double",
            RunnerShape::new().input("n", ValueKind::Integer).output("n"),
            |_ctx, _deps, input| async move {
                let n = input["n"].as_i64().unwrap_or_default();
                Ok(json!({ "n": n * 2 }))
            },
        );

        let entry = registry.runner("double").unwrap();
        assert!(entry.shape.has_output("n"));
        let out = (entry.handler)(RunContext::new(), Dependencies::new(), json!({"n": 4}))
            .await
            .unwrap();
        assert_eq!(out, json!({"n": 8}));
        assert!(registry.runner("missing").is_none());
    }
}
