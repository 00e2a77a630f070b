//! Graph Builder
//!
//! Compiles [`Definitions`] into a DAG of nodes:
//!
//! - one node per step instance (`step.NAME` or `step.NAME[i]`)
//! - one placeholder node per step whose replication depends on another
//!   step's output, expanded by the engine once that value is known
//! - one node per resource that has at least one consumer
//!
//! Every reference becomes a [`Binding`] that records the nodes producing
//! its value. Edges are the union of binding producers.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::error::BuildError;

use super::expression::{Expression, InstanceIndex, LoopVars, Reference, Scope, Target};
use super::instancing::Replication;
use super::model::{Definitions, ResourceDefinition, RetryPolicy, StepDefinition};
use super::registry::Registry;
use super::validator::{topological_order, validate_definitions};

/// Stable node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Id of an unreplicated step or of a placeholder.
    pub fn step(name: &str) -> Self {
        Self(format!("step.{}", name))
    }

    /// Id of one instance of a replicated step.
    pub fn instance(name: &str, index: usize) -> Self {
        Self(format!("step.{}[{}]", name, index))
    }

    pub fn resource(name: &str) -> Self {
        Self(format!("resource.{}", name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_resource(&self) -> bool {
        self.0.starts_with("resource.")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Why a node depends on a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    /// Value flows into an argument
    Argument,
    /// Value decides `count` or `for_each`
    Replication,
    /// Ordering only, from `depends_on`
    Explicit,
    /// Resource handed to the runner
    Uses,
}

impl BindingRole {
    /// True when the node reads the producer's value.
    pub fn reads_value(self) -> bool {
        matches!(self, Self::Argument | Self::Replication)
    }
}

/// A reference resolved to the nodes that produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub reference: Reference,
    pub role: BindingRole,
    pub producers: Vec<NodeId>,
}

/// One runnable instance of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInstance {
    pub step: String,
    pub index: Option<usize>,
    pub runner: String,
    pub arguments: BTreeMap<String, Expression>,
    pub vars: LoopVars,
    pub uses: Vec<String>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl StepInstance {
    fn from_definition(step: &StepDefinition, index: Option<usize>, vars: LoopVars) -> Self {
        Self {
            step: step.name.clone(),
            index,
            runner: step.runner.clone(),
            arguments: step.arguments.clone(),
            vars,
            uses: step.uses.iter().map(|r| r.target.name().to_string()).collect(),
            timeout: step.timeout(),
            retry: step.retry.clone(),
        }
    }

    /// Copy of this template bound to one instance.
    pub fn instantiate(&self, index: usize, vars: LoopVars) -> Self {
        Self {
            index: Some(index),
            vars,
            ..self.clone()
        }
    }
}

/// Placeholder for a step whose instance count is known only at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub replication: Replication,
    pub template: StepInstance,
}

/// A resource with at least one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub name: String,
    pub kind: String,
    pub arguments: BTreeMap<String, Expression>,
}

impl From<&ResourceDefinition> for ResourceNode {
    fn from(def: &ResourceDefinition) -> Self {
        Self {
            name: def.name.clone(),
            kind: def.kind.clone(),
            arguments: def.arguments.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Step(StepInstance),
    Expansion(Expansion),
    Resource(ResourceNode),
}

/// A vertex of the execution graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub bindings: Vec<Binding>,
    pub predecessors: BTreeSet<NodeId>,
    pub successors: BTreeSet<NodeId>,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind, bindings: Vec<Binding>) -> Self {
        let mut node = Self {
            id,
            kind,
            bindings,
            predecessors: BTreeSet::new(),
            successors: BTreeSet::new(),
        };
        node.predecessors = node.edge_producers().cloned().collect();
        node
    }

    /// Producers that gate this node.
    ///
    /// A placeholder does not wait on its resources: they are needed by
    /// its instances, which may not exist at all.
    pub fn edge_producers(&self) -> impl Iterator<Item = &NodeId> {
        let placeholder = self.is_expansion();
        self.bindings
            .iter()
            .filter(move |b| !(placeholder && b.role == BindingRole::Uses))
            .flat_map(|b| b.producers.iter())
    }

    pub fn is_resource(&self) -> bool {
        matches!(self.kind, NodeKind::Resource(_))
    }

    pub fn is_expansion(&self) -> bool {
        matches!(self.kind, NodeKind::Expansion(_))
    }

    /// Resource node ids this node consumes.
    pub fn resources(&self) -> impl Iterator<Item = &NodeId> {
        self.bindings
            .iter()
            .filter(|b| b.role == BindingRole::Uses)
            .flat_map(|b| b.producers.iter())
    }

    /// Short description used in listings.
    pub fn describe(&self) -> String {
        match &self.kind {
            NodeKind::Step(step) => format!("runner {}", step.runner),
            NodeKind::Expansion(expansion) => {
                format!("runner {} (expanded at run time)", expansion.template.runner)
            }
            NodeKind::Resource(resource) => format!("kind {}", resource.kind),
        }
    }
}

/// Instances known for a step while building.
enum Shape {
    Single(NodeId),
    Instances(Vec<NodeId>),
    Deferred(NodeId),
}

/// Resolves a reference against the instances of a replicated step.
pub(crate) fn resolve_producers(
    node: &NodeId,
    reference: &Reference,
    role: BindingRole,
    instances: &[NodeId],
) -> Result<Vec<NodeId>, BuildError> {
    let step = reference.target.name();
    match reference.index {
        InstanceIndex::Splat => Ok(instances.to_vec()),
        InstanceIndex::At(index) => instances
            .get(index)
            .map(|id| vec![id.clone()])
            .ok_or_else(|| BuildError::IndexOutOfRange {
                node: node.to_string(),
                step: step.to_string(),
                index,
                count: instances.len(),
            }),
        InstanceIndex::Unindexed => match instances {
            [only] => Ok(vec![only.clone()]),
            [] => Err(BuildError::NoInstances {
                node: node.to_string(),
                reference: reference.to_string(),
                step: step.to_string(),
            }),
            many if role == BindingRole::Explicit => Err(BuildError::AmbiguousDependency {
                node: node.to_string(),
                reference: reference.to_string(),
                step: step.to_string(),
                count: many.len(),
            }),
            many => Err(BuildError::AmbiguousImplicitDependency {
                node: node.to_string(),
                reference: reference.to_string(),
                step: step.to_string(),
                count: many.len(),
            }),
        },
    }
}

/// The compiled execution graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    order: Vec<NodeId>,
}

impl Graph {
    /// Validates definitions and compiles them into a graph.
    pub fn build(defs: &Definitions, registry: &Registry) -> Result<Self, BuildError> {
        info!(
            "Building graph: {} steps, {} resources",
            defs.steps.len(),
            defs.resources.len()
        );
        validate_definitions(defs, registry)?;

        let mut builder = Builder::new(defs);
        builder.create_step_nodes()?;
        builder.create_resource_nodes()?;
        let nodes = builder.finish();

        let order = topological_order(&nodes)?;
        let graph = Self { nodes, order };

        info!(
            "Graph built: {} nodes, {} edges",
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[cfg(test)]
    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Nodes in dependency order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.predecessors.len()).sum()
    }

    /// Hands the nodes to the planner.
    pub(crate) fn into_parts(self) -> (BTreeMap<NodeId, Node>, Vec<NodeId>) {
        (self.nodes, self.order)
    }
}

struct Builder<'a> {
    defs: &'a Definitions,
    shapes: HashMap<&'a str, Shape>,
    nodes: BTreeMap<NodeId, Node>,
}

impl<'a> Builder<'a> {
    fn new(defs: &'a Definitions) -> Self {
        Self {
            defs,
            shapes: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    fn create_step_nodes(&mut self) -> Result<(), BuildError> {
        let mut pending: Vec<(NodeId, &'a StepDefinition, Option<(usize, LoopVars)>)> = Vec::new();
        let mut placeholders: Vec<(NodeId, &'a StepDefinition, Replication)> = Vec::new();

        let defs = self.defs;
        for step in &defs.steps {
            let replication = Replication::of(step)?;
            let id = NodeId::step(&step.name);

            match replication.expression() {
                None => {
                    self.shapes.insert(&step.name, Shape::Single(id.clone()));
                    pending.push((id, step, None));
                }
                Some(_) if replication.is_dynamic() => {
                    debug!("Step '{}' has dynamic replication", step.name);
                    self.shapes.insert(&step.name, Shape::Deferred(id.clone()));
                    placeholders.push((id, step, replication));
                }
                Some(expr) => {
                    let value = expr.evaluate(&Scope::default())?;
                    let instances = replication.expand(id.as_str(), value)?;
                    let ids: Vec<NodeId> = (0..instances.len())
                        .map(|i| NodeId::instance(&step.name, i))
                        .collect();
                    for (i, vars) in instances.into_iter().enumerate() {
                        pending.push((ids[i].clone(), step, Some((i, vars))));
                    }
                    self.shapes.insert(&step.name, Shape::Instances(ids));
                }
            }
        }

        for (id, step, instance) in pending {
            let bindings = self.step_bindings(&id, step, false)?;
            let kind = match instance {
                Some((index, vars)) => StepInstance::from_definition(step, Some(index), vars),
                None => StepInstance::from_definition(step, None, LoopVars::default()),
            };
            self.insert(Node::new(id, NodeKind::Step(kind), bindings));
        }

        for (id, step, replication) in placeholders {
            let bindings = self.step_bindings(&id, step, true)?;
            let template = StepInstance::from_definition(step, None, LoopVars::default());
            let kind = NodeKind::Expansion(Expansion {
                replication,
                template,
            });
            self.insert(Node::new(id, kind, bindings));
        }
        Ok(())
    }

    fn create_resource_nodes(&mut self) -> Result<(), BuildError> {
        let consumed: BTreeSet<NodeId> = self
            .nodes
            .values()
            .flat_map(|n| n.resources().cloned())
            .collect();

        let defs = self.defs;
        for resource in &defs.resources {
            let id = NodeId::resource(&resource.name);
            if !consumed.contains(&id) {
                debug!("Resource '{}' has no consumers, not creating a node", resource.name);
                continue;
            }

            let mut bindings = Vec::new();
            for expr in resource.arguments.values() {
                for reference in expr.references() {
                    self.push_binding(&mut bindings, &id, reference, BindingRole::Argument)?;
                }
            }
            self.insert(Node::new(id, NodeKind::Resource(resource.into()), bindings));
        }
        Ok(())
    }

    fn step_bindings(
        &self,
        id: &NodeId,
        step: &StepDefinition,
        with_replication: bool,
    ) -> Result<Vec<Binding>, BuildError> {
        let mut bindings = Vec::new();

        if with_replication {
            for expr in step.count.iter().chain(step.for_each.iter()) {
                for reference in expr.references() {
                    self.push_binding(&mut bindings, id, reference, BindingRole::Replication)?;
                }
            }
        }
        for expr in step.arguments.values() {
            for reference in expr.references() {
                self.push_binding(&mut bindings, id, reference, BindingRole::Argument)?;
            }
        }
        for reference in &step.depends_on {
            self.push_binding(&mut bindings, id, reference.clone(), BindingRole::Explicit)?;
        }
        for reference in &step.uses {
            self.push_binding(&mut bindings, id, reference.clone(), BindingRole::Uses)?;
        }
        Ok(bindings)
    }

    fn push_binding(
        &self,
        bindings: &mut Vec<Binding>,
        node: &NodeId,
        reference: Reference,
        role: BindingRole,
    ) -> Result<(), BuildError> {
        if bindings
            .iter()
            .any(|b| b.reference == reference && b.role == role)
        {
            return Ok(());
        }
        let producers = self.producers(node, &reference, role)?;
        bindings.push(Binding {
            reference,
            role,
            producers,
        });
        Ok(())
    }

    fn producers(
        &self,
        node: &NodeId,
        reference: &Reference,
        role: BindingRole,
    ) -> Result<Vec<NodeId>, BuildError> {
        let name = match &reference.target {
            Target::Resource(name) => return Ok(vec![NodeId::resource(name)]),
            Target::Step(name) => name,
        };

        match self.shapes.get(name.as_str()) {
            None => Err(BuildError::UnknownReference {
                node: node.to_string(),
                reference: reference.to_string(),
            }),
            Some(Shape::Single(id)) => match reference.index {
                InstanceIndex::At(_) => Err(BuildError::NotReplicated {
                    node: node.to_string(),
                    step: name.clone(),
                }),
                _ => Ok(vec![id.clone()]),
            },
            Some(Shape::Instances(ids)) => resolve_producers(node, reference, role, ids),
            Some(Shape::Deferred(id)) => Ok(vec![id.clone()]),
        }
    }

    fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Fills successor sets from predecessors.
    fn finish(mut self) -> BTreeMap<NodeId, Node> {
        let edges: Vec<(NodeId, NodeId)> = self
            .nodes
            .values()
            .flat_map(|n| n.predecessors.iter().map(|p| (p.clone(), n.id.clone())))
            .collect();
        for (from, to) in edges {
            if let Some(node) = self.nodes.get_mut(&from) {
                node.successors.insert(to);
            }
        }
        self.nodes
    }
}
