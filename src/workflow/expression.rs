//! Expression Resolver
//!
//! Configuration values are raw expressions. A string consisting of a single
//! `${...}` placeholder becomes a typed reference; strings mixing text and
//! placeholders become templates; lists and maps are converted element-wise.
//!
//! # Reference Syntax
//!
//! ```text
//! step.fetch              whole result of the (single) fetch instance
//! step.fetch.status       one output attribute
//! step.fetch[2].status    attribute of instance 2
//! step.fetch[*].status    ordered list over every instance
//! resource.client         a resource (only valid in `uses`)
//! count.index             loop variables of a replicated step
//! each.key / each.value
//! ```
//!
//! References can be extracted without evaluating anything, which is what the
//! graph builder uses to discover implicit dependencies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EvalError, ExpressionError};

/// What a reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Step(String),
    Resource(String),
}

impl Target {
    /// Declared name of the step or resource.
    pub fn name(&self) -> &str {
        match self {
            Self::Step(name) | Self::Resource(name) => name,
        }
    }
}

/// Instance selector of a step reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceIndex {
    /// `step.a` - valid only when `a` has exactly one instance
    Unindexed,
    /// `step.a[i]`
    At(usize),
    /// `step.a[*]`
    Splat,
}

/// A reference to another step's output or to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub target: Target,
    pub index: InstanceIndex,
    pub attribute: Option<String>,
}

impl Reference {
    /// Unindexed reference to a step's whole result.
    pub fn step(name: impl Into<String>) -> Self {
        Self {
            target: Target::Step(name.into()),
            index: InstanceIndex::Unindexed,
            attribute: None,
        }
    }

    /// Reference to a resource.
    pub fn resource(name: impl Into<String>) -> Self {
        Self {
            target: Target::Resource(name.into()),
            index: InstanceIndex::Unindexed,
            attribute: None,
        }
    }

    /// Selects a single instance.
    pub fn at(mut self, index: usize) -> Self {
        self.index = InstanceIndex::At(index);
        self
    }

    /// Selects every instance.
    pub fn splat(mut self) -> Self {
        self.index = InstanceIndex::Splat;
        self
    }

    /// Selects one output attribute.
    pub fn attr(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn is_step(&self) -> bool {
        matches!(self.target, Target::Step(_))
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.target, Target::Resource(_))
    }

    /// Parses `step.NAME[IDX].ATTR` or `resource.NAME`, with or without `${}`.
    pub fn parse(text: &str) -> Result<Self, ExpressionError> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("${")
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed)
            .trim();

        let invalid = |reason: &str| ExpressionError::InvalidReference {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let (kind, rest) = body
            .split_once('.')
            .ok_or_else(|| invalid("expected step.NAME or resource.NAME"))?;

        let name_end = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        let (name, mut rest) = rest.split_at(name_end);
        if name.is_empty() {
            return Err(invalid("missing name"));
        }

        let mut index = InstanceIndex::Unindexed;
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']').ok_or_else(|| invalid("unclosed index"))?;
            let inner = after[..close].trim();
            index = if inner == "*" {
                InstanceIndex::Splat
            } else {
                InstanceIndex::At(
                    inner
                        .parse()
                        .map_err(|_| invalid("index must be a whole number or *"))?,
                )
            };
            rest = &after[close + 1..];
        }

        let attribute = if rest.is_empty() {
            None
        } else {
            let attr = rest
                .strip_prefix('.')
                .ok_or_else(|| invalid("unexpected characters after name"))?;
            if attr.is_empty() || !attr.chars().all(is_name_char) {
                return Err(invalid("invalid attribute name"));
            }
            Some(attr.to_string())
        };

        let target = match kind {
            "step" => Target::Step(name.to_string()),
            "resource" => {
                if index != InstanceIndex::Unindexed || attribute.is_some() {
                    return Err(invalid("resources cannot be indexed or have attributes"));
                }
                Target::Resource(name.to_string())
            }
            other => return Err(invalid(&format!("unknown reference type '{}'", other))),
        };

        Ok(Self {
            target,
            index,
            attribute,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Step(name) => write!(f, "step.{}", name)?,
            Target::Resource(name) => write!(f, "resource.{}", name)?,
        }
        match self.index {
            InstanceIndex::Unindexed => {}
            InstanceIndex::At(i) => write!(f, "[{}]", i)?,
            InstanceIndex::Splat => write!(f, "[*]")?,
        }
        if let Some(attr) = &self.attribute {
            write!(f, ".{}", attr)?;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Reference::parse(&text).map_err(de::Error::custom)
    }
}

/// Loop variables available to a replicated step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    CountIndex,
    EachKey,
    EachValue,
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountIndex => write!(f, "count.index"),
            Self::EachKey => write!(f, "each.key"),
            Self::EachValue => write!(f, "each.value"),
        }
    }
}

/// Values bound to the loop variables of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopVars {
    pub index: Option<usize>,
    pub key: Option<Value>,
    pub value: Option<Value>,
}

impl LoopVars {
    /// Variables of the `index`-th instance of a counted step.
    pub fn count(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    /// Variables of one `for_each` entry.
    pub fn each(index: usize, key: Value, value: Value) -> Self {
        Self {
            index: Some(index),
            key: Some(key),
            value: Some(value),
        }
    }

    pub fn get(&self, variable: Variable) -> Option<Value> {
        match variable {
            Variable::CountIndex => {
                if self.key.is_some() {
                    None
                } else {
                    self.index.map(Value::from)
                }
            }
            Variable::EachKey => self.key.clone(),
            Variable::EachValue => self.value.clone(),
        }
    }
}

/// Piece of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Reference(Reference),
    Variable(Variable),
}

/// An unevaluated configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Reference(Reference),
    Variable(Variable),
    Template(Vec<Segment>),
    List(Vec<Expression>),
    Map(BTreeMap<String, Expression>),
}

impl Expression {
    /// Wraps a plain value without interpreting placeholders.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Parses a single string.
    pub fn parse(text: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(pos) = rest.find("${") {
            if rest[..pos].ends_with('$') {
                literal.push_str(&rest[..pos - 1]);
                literal.push_str("${");
                rest = &rest[pos + 2..];
                continue;
            }

            literal.push_str(&rest[..pos]);
            let after = &rest[pos + 2..];
            let close = after
                .find('}')
                .ok_or_else(|| ExpressionError::Unterminated(text.to_string()))?;

            if !literal.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut literal)));
            }
            segments.push(parse_placeholder(&after[..close])?);
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Text(literal));
        }

        if segments.len() > 1 {
            return Ok(Self::Template(segments));
        }
        Ok(match segments.pop() {
            None => Self::Literal(Value::String(String::new())),
            Some(Segment::Text(text)) => Self::Literal(Value::String(text)),
            Some(Segment::Reference(reference)) => Self::Reference(reference),
            Some(Segment::Variable(variable)) => Self::Variable(variable),
        })
    }

    /// Converts a raw configuration value.
    pub fn from_value(value: Value) -> Result<Self, ExpressionError> {
        match value {
            Value::String(text) => Self::parse(&text),
            Value::Array(items) => items
                .into_iter()
                .map(Self::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(entries) => entries
                .into_iter()
                .map(|(k, v)| Self::from_value(v).map(|e| (k, e)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            other => Ok(Self::Literal(other)),
        }
    }

    /// Every reference in this expression, in order of first appearance.
    pub fn references(&self) -> Vec<Reference> {
        let mut found = Vec::new();
        self.walk(&mut |reference| {
            if !found.contains(reference) {
                found.push(reference.clone());
            }
        }, &mut |_| {});
        found
    }

    /// Every loop variable used in this expression.
    pub fn variables(&self) -> Vec<Variable> {
        let mut found = Vec::new();
        self.walk(&mut |_| {}, &mut |variable| {
            if !found.contains(&variable) {
                found.push(variable);
            }
        });
        found
    }

    /// True when the expression can be evaluated without any produced value.
    pub fn is_static(&self) -> bool {
        self.references().is_empty()
    }

    fn walk(&self, on_ref: &mut dyn FnMut(&Reference), on_var: &mut dyn FnMut(Variable)) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => on_ref(reference),
            Self::Variable(variable) => on_var(*variable),
            Self::Template(segments) => {
                for segment in segments {
                    match segment {
                        Segment::Text(_) => {}
                        Segment::Reference(reference) => on_ref(reference),
                        Segment::Variable(variable) => on_var(*variable),
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.walk(on_ref, on_var);
                }
            }
            Self::Map(entries) => {
                for item in entries.values() {
                    item.walk(on_ref, on_var);
                }
            }
        }
    }

    /// Evaluates against already-produced values.
    pub fn evaluate(&self, scope: &Scope) -> Result<Value, EvalError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(reference) => scope.resolve(reference),
            Self::Variable(variable) => scope.variable(*variable),
            Self::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Reference(reference) => {
                            out.push_str(&render(&scope.resolve(reference)?))
                        }
                        Segment::Variable(variable) => {
                            out.push_str(&render(&scope.variable(*variable)?))
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.evaluate(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.evaluate(scope).map(|v| (k.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
        }
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Expression::from_value(raw).map_err(de::Error::custom)
    }
}

/// Values visible to one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: HashMap<Reference, Value>,
    vars: LoopVars,
}

impl Scope {
    pub fn new(vars: LoopVars) -> Self {
        Self {
            values: HashMap::new(),
            vars,
        }
    }

    pub fn insert(&mut self, reference: Reference, value: Value) {
        self.values.insert(reference, value);
    }

    pub fn get(&self, reference: &Reference) -> Option<&Value> {
        self.values.get(reference)
    }

    pub fn vars(&self) -> &LoopVars {
        &self.vars
    }

    fn resolve(&self, reference: &Reference) -> Result<Value, EvalError> {
        self.values
            .get(reference)
            .cloned()
            .ok_or_else(|| EvalError::UnresolvedReference(reference.to_string()))
    }

    fn variable(&self, variable: Variable) -> Result<Value, EvalError> {
        self.vars
            .get(variable)
            .ok_or_else(|| EvalError::UnboundVariable(variable.to_string()))
    }
}

/// Short type name used in error messages.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn parse_placeholder(body: &str) -> Result<Segment, ExpressionError> {
    match body.trim() {
        "count.index" => Ok(Segment::Variable(Variable::CountIndex)),
        "each.key" => Ok(Segment::Variable(Variable::EachKey)),
        "each.value" => Ok(Segment::Variable(Variable::EachValue)),
        other => Reference::parse(other).map(Segment::Reference),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
