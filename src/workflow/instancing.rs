//! Step Replication
//!
//! Turns a step's `count` or `for_each` value into one [`LoopVars`] per
//! instance:
//!
//! - `count = N` produces instances `0..N`, each with `count.index`
//! - `for_each = [a, b]` produces one instance per element
//!   (`each.key` = position, `each.value` = element)
//! - `for_each = {k: v}` produces one instance per entry in key order
//!
//! Replication whose expression references another step is *dynamic*: it is
//! evaluated by the engine once the producer finishes.

use log::debug;
use serde_json::Value;

use crate::error::{BuildError, CountError, RunError};

use super::expression::{value_type_name, Expression, LoopVars, Scope};
use super::model::StepDefinition;

/// Upper bound on the instances a single `count` may produce.
pub const MAX_INSTANCES: usize = 100_000;

/// How a step is expanded into instances.
#[derive(Debug, Clone, PartialEq)]
pub enum Replication {
    /// Exactly one unindexed instance
    Single,
    Count(Expression),
    ForEach(Expression),
}

impl Replication {
    /// Reads the replication settings of a step.
    pub fn of(step: &StepDefinition) -> Result<Self, BuildError> {
        match (&step.count, &step.for_each) {
            (Some(_), Some(_)) => Err(BuildError::CountAndForEach(step.name.clone())),
            (Some(count), None) => Ok(Self::Count(count.clone())),
            (None, Some(collection)) => Ok(Self::ForEach(collection.clone())),
            (None, None) => Ok(Self::Single),
        }
    }

    pub fn expression(&self) -> Option<&Expression> {
        match self {
            Self::Single => None,
            Self::Count(expr) | Self::ForEach(expr) => Some(expr),
        }
    }

    /// True when evaluation must wait for another step.
    pub fn is_dynamic(&self) -> bool {
        self.expression().map(|e| !e.is_static()).unwrap_or(false)
    }

    /// Expands an evaluated replication value into per-instance loop variables.
    ///
    /// `Single` yields an empty list; callers treat it as one unindexed instance.
    pub fn expand(&self, step: &str, value: Value) -> Result<Vec<LoopVars>, CountError> {
        let instances = match self {
            Self::Single => Vec::new(),
            Self::Count(_) => count_instances(step, &value)?,
            Self::ForEach(_) => for_each_instances(step, value)?,
        };
        debug!("Step '{}' expands to {} instances", step, instances.len());
        Ok(instances)
    }

    /// Evaluates the replication expression and expands it.
    pub fn instances(&self, step: &str, scope: &Scope) -> Result<Vec<LoopVars>, RunError> {
        let Some(expr) = self.expression() else {
            return Ok(Vec::new());
        };
        let value = expr.evaluate(scope)?;
        Ok(self.expand(step, value)?)
    }
}

/// Validates a `count` value and produces its instances.
pub fn count_instances(step: &str, value: &Value) -> Result<Vec<LoopVars>, CountError> {
    let n = value.as_f64().ok_or_else(|| CountError::NotANumber {
        step: step.to_string(),
        found: value_type_name(value),
    })?;

    if n < 0.0 {
        return Err(CountError::Negative {
            step: step.to_string(),
        });
    }
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(CountError::Fractional {
            step: step.to_string(),
            value: n,
        });
    }

    if n > MAX_INSTANCES as f64 {
        return Err(CountError::TooLarge {
            step: step.to_string(),
            value: n,
            max: MAX_INSTANCES,
        });
    }

    Ok((0..n as usize).map(LoopVars::count).collect())
}

/// Validates a `for_each` value and produces its instances.
pub fn for_each_instances(step: &str, value: Value) -> Result<Vec<LoopVars>, CountError> {
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| LoopVars::each(i, Value::from(i), item))
            .collect()),
        Value::Object(entries) => {
            let mut entries: Vec<(String, Value)> = entries.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(entries
                .into_iter()
                .enumerate()
                .map(|(i, (key, item))| LoopVars::each(i, Value::String(key), item))
                .collect())
        }
        other => Err(CountError::NotACollection {
            step: step.to_string(),
            found: value_type_name(&other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::{Reference, Variable};
    use serde_json::json;

    #[test]
    fn test_count_instances() {
        let instances = count_instances("a", &json!(3)).unwrap();
        assert_eq!(instances.len(), 3);
        assert_eq!(instances[2].get(Variable::CountIndex), Some(json!(2)));
        assert!(count_instances("a", &json!(0)).unwrap().is_empty());
        assert_eq!(count_instances("a", &json!(2.0)).unwrap().len(), 2);
    }

    #[test]
    fn test_count_rejects_bad_values() {
        let err = count_instances("step.b", &json!("three")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "count for step step.b must be a number, but got string"
        );

        let err = count_instances("step.b", &json!(-1)).unwrap_err();
        assert_eq!(err.to_string(), "count for step step.b cannot be negative");

        let err = count_instances("step.b", &json!(1.5)).unwrap_err();
        assert!(matches!(err, CountError::Fractional { .. }));

        let err = count_instances("step.b", &json!(true)).unwrap_err();
        assert!(err.to_string().ends_with("but got bool"));
    }

    #[test]
    fn test_count_rejects_huge_values() {
        let err = count_instances("step.b", &json!(1e20)).unwrap_err();
        assert!(matches!(err, CountError::TooLarge { max: MAX_INSTANCES, .. }));
        assert!(err.to_string().contains("must be at most 100000"));

        assert_eq!(count_instances("step.b", &json!(MAX_INSTANCES)).unwrap().len(), MAX_INSTANCES);
    }

    #[test]
    fn test_for_each_list_and_map() {
        let list = for_each_instances("a", json!(["x", "y"])).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].get(Variable::EachKey), Some(json!(1)));
        assert_eq!(list[1].get(Variable::EachValue), Some(json!("y")));

        let map = for_each_instances("a", json!({"us": 1, "eu": 2})).unwrap();
        assert_eq!(map[0].get(Variable::EachKey), Some(json!("eu")));
        assert_eq!(map[1].get(Variable::EachValue), Some(json!(1)));

        let err = for_each_instances("a", json!(4)).unwrap_err();
        assert!(err.to_string().contains("must be a list or map, but got number"));
    }

    #[test]
    fn test_replication_of_step() {
        let single = StepDefinition::new("a", "echo");
        assert_eq!(Replication::of(&single).unwrap(), Replication::Single);

        let both = StepDefinition::new("a", "echo")
            .with_count(Expression::literal(1))
            .with_for_each(Expression::literal(json!([1])));
        let err = Replication::of(&both).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_dynamic_replication_evaluates_against_scope() {
        let count = Expression::Reference(Reference::step("plan").attr("n"));
        let replication = Replication::Count(count);
        assert!(replication.is_dynamic());

        let mut scope = Scope::default();
        scope.insert(Reference::step("plan").attr("n"), json!(2));
        assert_eq!(replication.instances("step.b", &scope).unwrap().len(), 2);

        scope.insert(Reference::step("plan").attr("n"), json!("three"));
        let err = replication.instances("step.b", &scope).unwrap_err();
        assert!(err.to_string().contains("must be a number, but got string"));
    }
}
