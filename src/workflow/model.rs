//! Definition Data Model
//!
//! Parsed, un-evaluated declarations of steps and resources.
//!
//! # Example YAML Format
//!
//! ```yaml
//! resources:
//!   - name: client
//!     kind: http_client
//!     arguments:
//!       base_url: https://example.test
//!
//! steps:
//!   - name: plan
//!     runner: planner
//!
//!   - name: fetch
//!     runner: http_get
//!     count: ${step.plan.pages}
//!     arguments:
//!       path: /items?page=${count.index}
//!     uses:
//!       - resource.client
//!     timeout_ms: 5000
//!
//!   - name: report
//!     runner: summarize
//!     arguments:
//!       statuses: ${step.fetch[*].status}
//!     depends_on:
//!       - step.plan
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Deserialize;

use super::expression::{Expression, Reference};

/// Declaration of a reusable unit of work.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StepDefinition {
    /// Unique step name
    pub name: String,

    /// Registered runner handling this step
    pub runner: String,

    /// Argument expressions, keyed by runner input name
    #[serde(default)]
    pub arguments: BTreeMap<String, Expression>,

    /// Number of instances to create
    #[serde(default)]
    pub count: Option<Expression>,

    /// Collection to create one instance per entry of
    #[serde(default)]
    pub for_each: Option<Expression>,

    /// Explicit dependencies on other steps
    #[serde(default)]
    pub depends_on: Vec<Reference>,

    /// Resources handed to this step's runner
    #[serde(default, deserialize_with = "resource_refs")]
    pub uses: Vec<Reference>,

    /// Per-instance timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Retry policy (parsed, not applied by the engine)
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Declaration of a shared, stateful object.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// Unique resource name
    pub name: String,

    /// Registered resource kind providing create/destroy
    pub kind: String,

    /// Argument expressions passed to create
    #[serde(default)]
    pub arguments: BTreeMap<String, Expression>,
}

/// Retry settings accepted in definitions.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_attempts() -> u32 {
    1
}

/// Accepts `resource.NAME` or a bare `NAME` in `uses` lists.
fn resource_refs<'de, D>(deserializer: D) -> Result<Vec<Reference>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    raw.iter()
        .map(|entry| parse_uses(entry).map_err(de::Error::custom))
        .collect()
}

fn parse_uses(entry: &str) -> Result<Reference, crate::error::ExpressionError> {
    if entry.contains('.') {
        Reference::parse(entry)
    } else {
        Ok(Reference::resource(entry.trim()))
    }
}

impl StepDefinition {
    /// Creates a step with no arguments or dependencies.
    ///
    /// # Example
    ///
    /// ```
    /// use steprunner::workflow::{Expression, Reference, StepDefinition};
    ///
    /// let step = StepDefinition::new("fetch", "http_get")
    ///     .with_count(Expression::literal(3))
    ///     .with_argument("path", Expression::parse("/items/${count.index}").unwrap())
    ///     .uses(Reference::resource("client"));
    /// assert_eq!(step.name, "fetch");
    /// ```
    pub fn new(name: impl Into<String>, runner: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            runner: runner.into().trim().to_string(),
            arguments: BTreeMap::new(),
            count: None,
            for_each: None,
            depends_on: Vec::new(),
            uses: Vec::new(),
            timeout_ms: None,
            retry: None,
        }
    }

    /// Sets one argument expression.
    pub fn with_argument(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.arguments.insert(name.into(), expression);
        self
    }

    /// Sets the replication count expression.
    pub fn with_count(mut self, count: Expression) -> Self {
        self.count = Some(count);
        self
    }

    /// Sets the `for_each` collection expression.
    pub fn with_for_each(mut self, collection: Expression) -> Self {
        self.for_each = Some(collection);
        self
    }

    /// Adds an explicit dependency.
    pub fn depends_on(mut self, reference: Reference) -> Self {
        self.depends_on.push(reference);
        self
    }

    /// Adds a resource this step uses.
    pub fn uses(mut self, reference: Reference) -> Self {
        self.uses.push(reference);
        self
    }

    /// Sets the per-instance timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// True when the step declares `count` or `for_each`.
    pub fn is_replicated(&self) -> bool {
        self.count.is_some() || self.for_each.is_some()
    }

    /// Every expression attached to this step.
    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.arguments
            .values()
            .chain(self.count.iter())
            .chain(self.for_each.iter())
    }
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            kind: kind.into().trim().to_string(),
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, expression: Expression) -> Self {
        self.arguments.insert(name.into(), expression);
        self
    }
}

/// Complete set of declarations for one run.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Definitions {
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates definitions from lists of steps and resources.
    pub fn from_parts(steps: Vec<StepDefinition>, resources: Vec<ResourceDefinition>) -> Self {
        Self { resources, steps }
    }

    /// Adds a step.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Adds a resource.
    pub fn with_resource(mut self, resource: ResourceDefinition) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn get_resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builder() {
        let step = StepDefinition::new(" fetch ", "http_get")
            .with_count(Expression::literal(2))
            .depends_on(Reference::step("login"))
            .uses(Reference::resource("client"))
            .with_timeout(Duration::from_millis(250));

        assert_eq!(step.name, "fetch");
        assert!(step.is_replicated());
        assert_eq!(step.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(step.depends_on, vec![Reference::step("login")]);
        assert_eq!(step.uses, vec![Reference::resource("client")]);
    }

    #[test]
    fn test_deserialize_step() {
        let yaml = r#"
name: fetch
runner: http_get
count: "${step.plan.pages}"
arguments:
  path: "/items/${count.index}"
  retries: 3
depends_on: ["step.login"]
uses: [client, resource.cache]
timeout_ms: 100
retry:
  max_attempts: 3
"#;
        let step: StepDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            step.count,
            Some(Expression::Reference(Reference::step("plan").attr("pages")))
        );
        assert_eq!(step.arguments["retries"], Expression::Literal(json!(3)));
        assert_eq!(
            step.uses,
            vec![Reference::resource("client"), Reference::resource("cache")]
        );
        assert_eq!(step.retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert_eq!(step.expressions().count(), 3);
    }

    #[test]
    fn test_deserialize_rejects_bad_reference() {
        let yaml = "name: a\nrunner: r\ndepends_on: [\"step.\"]\n";
        assert!(serde_yaml::from_str::<StepDefinition>(yaml).is_err());
    }

    #[test]
    fn test_definitions_lookup() {
        let defs = Definitions::new()
            .with_step(StepDefinition::new("a", "echo"))
            .with_resource(ResourceDefinition::new("db", "counter"));

        assert!(defs.get_step("a").is_some());
        assert!(defs.get_step("b").is_none());
        assert!(defs.get_resource("db").is_some());
        assert!(!defs.is_empty());
        assert!(Definitions::default().is_empty());
    }
}
