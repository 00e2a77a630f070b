//! Execution Planner
//!
//! Live state of a run, owned by the engine loop:
//! - Node status and progress
//! - Readiness, including lazy resource demand
//! - Produced values and the scope each node evaluates against
//! - Splicing instances of dynamically replicated steps into the graph
//! - Skipping dependents of failed nodes

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::Hash;

use log::{debug, info};
use serde_json::Value;

use crate::error::{BuildError, RunError};

use super::expression::{InstanceIndex, LoopVars, Scope};
use super::graph::{resolve_producers, Binding, BindingRole, Graph, Node, NodeId, NodeKind};

/// Status of a node during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    /// Waiting for predecessors or demand
    Pending,
    /// Work is in flight
    Running,
    Succeeded,
    /// Failed with error message
    Failed(String),
    /// Never started, with the reason
    Skipped(String),
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Skipped(_))
    }
}

/// Tracks node state and decides what runs next.
///
/// The planner has a single writer: the engine loop. Workers only see
/// the data the loop copies out for them.
#[derive(Debug)]
pub struct ExecutionPlanner {
    nodes: BTreeMap<NodeId, Node>,
    /// Scan order: topological, with spliced instances appended
    order: Vec<NodeId>,
    statuses: HashMap<NodeId, NodeStatus>,
    results: HashMap<NodeId, Value>,
}

impl ExecutionPlanner {
    /// Creates a planner for a built graph.
    pub fn new(graph: Graph) -> Self {
        let (nodes, order) = graph.into_parts();
        let statuses = nodes
            .keys()
            .map(|id| (id.clone(), NodeStatus::Pending))
            .collect();

        info!("Creating planner: {} nodes", nodes.len());

        Self {
            nodes,
            order,
            statuses,
            results: HashMap::new(),
        }
    }

    /// Returns up to `limit` nodes that can start now.
    ///
    /// A node is ready when it is pending and every predecessor succeeded.
    /// A resource node additionally needs demand: some pending consumer
    /// must be waiting on nothing but resources.
    pub fn get_ready_nodes(&self, limit: usize) -> Vec<NodeId> {
        let mut ready = Vec::new();

        for id in &self.order {
            if ready.len() >= limit {
                break;
            }
            if self.status(id) != Some(&NodeStatus::Pending) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if !node.predecessors.iter().all(|p| self.succeeded(p)) {
                continue;
            }
            if node.is_resource() && !self.is_demanded(node) {
                continue;
            }
            ready.push(id.clone());
        }

        ready
    }

    fn is_demanded(&self, resource: &Node) -> bool {
        resource.successors.iter().any(|consumer| {
            self.status(consumer) == Some(&NodeStatus::Pending)
                && self.nodes.get(consumer).is_some_and(|node| {
                    node.predecessors
                        .iter()
                        .all(|p| self.succeeded(p) || p.is_resource())
                })
        })
    }

    fn succeeded(&self, id: &NodeId) -> bool {
        self.status(id) == Some(&NodeStatus::Succeeded)
    }

    fn set_status(&mut self, id: &NodeId, status: NodeStatus) {
        if let Some(current) = self.statuses.get_mut(id) {
            *current = status;
        }
    }

    /// Every node, including spliced instances.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node<Q>(&self, id: &Q) -> Option<&Node>
    where
        NodeId: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.nodes.get(id)
    }

    pub fn status<Q>(&self, id: &Q) -> Option<&NodeStatus>
    where
        NodeId: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.statuses.get(id)
    }

    /// Value produced by a succeeded node.
    pub fn result<Q>(&self, id: &Q) -> Option<&Value>
    where
        NodeId: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.results.get(id)
    }

    /// Marks a node as running.
    pub fn mark_running(&mut self, id: &NodeId) {
        self.set_status(id, NodeStatus::Running);
        debug!("Node '{}' marked running", id);
    }

    /// Marks a node as succeeded, storing its output.
    pub fn mark_succeeded(&mut self, id: &NodeId, output: Option<Value>) {
        self.set_status(id, NodeStatus::Succeeded);
        if let Some(output) = output {
            self.results.insert(id.clone(), output);
        }
    }

    /// Marks a node as failed and skips everything that depends on it.
    ///
    /// Returns the skipped nodes.
    pub fn mark_failed(&mut self, id: &NodeId, error: String) -> Vec<NodeId> {
        self.set_status(id, NodeStatus::Failed(error));

        let reason = format!("dependency {} failed", id);
        let mut skipped = Vec::new();
        let mut queue: VecDeque<NodeId> = self
            .nodes
            .get(id)
            .map(|n| n.successors.iter().cloned().collect())
            .unwrap_or_default();

        while let Some(current) = queue.pop_front() {
            if self.status(&current) != Some(&NodeStatus::Pending) {
                continue;
            }
            self.set_status(&current, NodeStatus::Skipped(reason.clone()));
            if let Some(node) = self.nodes.get(&current) {
                queue.extend(node.successors.iter().cloned());
            }
            skipped.push(current);
        }

        skipped
    }

    /// Skips every pending node.
    pub fn skip_pending(&mut self, reason: &str) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        for id in &self.order {
            if let Some(status) = self.statuses.get_mut(id) {
                if *status == NodeStatus::Pending {
                    *status = NodeStatus::Skipped(reason.to_string());
                    skipped.push(id.clone());
                }
            }
        }
        skipped
    }

    /// Skips pending resource nodes that no unfinished node consumes.
    ///
    /// Happens when a dynamic step expands to zero instances.
    pub fn skip_idle_resources(&mut self) -> Vec<NodeId> {
        let mut live: BTreeSet<&NodeId> = BTreeSet::new();
        for node in self.nodes.values() {
            let finished = self
                .status(&node.id)
                .map(NodeStatus::is_terminal)
                .unwrap_or(true);
            if !finished {
                live.extend(node.resources());
            }
        }

        let idle: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_resource() && !live.contains(&n.id))
            .filter(|n| self.status(&n.id) == Some(&NodeStatus::Pending))
            .map(|n| n.id.clone())
            .collect();

        for id in &idle {
            self.set_status(id, NodeStatus::Skipped("no remaining consumers".to_string()));
        }
        idle
    }

    /// Builds the evaluation scope of a node from its producers' outputs.
    pub fn scope_for(&self, node: &Node) -> Result<Scope, RunError> {
        let vars = match &node.kind {
            NodeKind::Step(step) => step.vars.clone(),
            _ => LoopVars::default(),
        };
        let mut scope = Scope::new(vars);

        for binding in node.bindings.iter().filter(|b| b.role.reads_value()) {
            let attribute = binding.reference.attribute.as_deref();
            let mut values = binding
                .producers
                .iter()
                .map(|producer| self.output_of(producer, attribute))
                .collect::<Result<Vec<_>, _>>()?;

            let value = if binding.reference.index == InstanceIndex::Splat {
                Value::Array(values)
            } else if values.is_empty() {
                Value::Null
            } else {
                values.swap_remove(0)
            };
            scope.insert(binding.reference.clone(), value);
        }

        Ok(scope)
    }

    fn output_of(&self, producer: &NodeId, attribute: Option<&str>) -> Result<Value, RunError> {
        let output = self.results.get(producer);
        match attribute {
            None => Ok(output.cloned().unwrap_or(Value::Null)),
            Some(name) => output
                .and_then(|v| v.get(name))
                .cloned()
                .ok_or_else(|| RunError::MissingOutput {
                    node: producer.to_string(),
                    attribute: name.to_string(),
                }),
        }
    }

    /// Splices the instances of a running placeholder into the graph.
    ///
    /// Every successor binding that pointed at the placeholder is resolved
    /// against the new instances. Nothing changes if a binding cannot be
    /// resolved. The caller marks the placeholder succeeded afterwards.
    pub fn expand(
        &mut self,
        placeholder: &NodeId,
        instances: Vec<LoopVars>,
    ) -> Result<Vec<NodeId>, BuildError> {
        let node = match self.nodes.get(placeholder) {
            Some(node) if node.is_expansion() && self.status(placeholder) == Some(&NodeStatus::Running) => {
                node.clone()
            }
            _ => return Err(BuildError::NotExpandable(placeholder.to_string())),
        };
        let NodeKind::Expansion(expansion) = &node.kind else {
            return Err(BuildError::NotExpandable(placeholder.to_string()));
        };

        let children: Vec<NodeId> = (0..instances.len())
            .map(|i| NodeId::instance(&expansion.template.step, i))
            .collect();

        let mut rewired: Vec<(NodeId, Vec<Binding>)> = Vec::new();
        for successor in &node.successors {
            let Some(dependent) = self.nodes.get(successor) else {
                continue;
            };
            let mut bindings = dependent.bindings.clone();
            for binding in bindings.iter_mut() {
                if !binding.producers.contains(placeholder) {
                    continue;
                }
                let resolved =
                    resolve_producers(successor, &binding.reference, binding.role, &children)?;
                binding.producers.retain(|p| p != placeholder);
                binding.producers.extend(resolved);
            }
            rewired.push((successor.clone(), bindings));
        }

        let inherited: Vec<Binding> = node
            .bindings
            .iter()
            .filter(|b| b.role != BindingRole::Replication)
            .cloned()
            .collect();

        for (i, vars) in instances.into_iter().enumerate() {
            let kind = NodeKind::Step(expansion.template.instantiate(i, vars));
            let child = Node::new(children[i].clone(), kind, inherited.clone());
            self.link(&child);
            self.statuses.insert(child.id.clone(), NodeStatus::Pending);
            self.order.push(child.id.clone());
            self.nodes.insert(child.id.clone(), child);
        }

        for (id, bindings) in rewired {
            let Some(dependent) = self.nodes.get_mut(&id) else {
                continue;
            };
            dependent.bindings = bindings;
            dependent.predecessors = dependent.edge_producers().cloned().collect();
            let dependent = dependent.clone();
            self.link(&dependent);
        }

        if let Some(node) = self.nodes.get_mut(placeholder) {
            node.successors.clear();
        }

        info!("Expanded {} into {} instances", placeholder, children.len());
        Ok(children)
    }

    /// Adds `node` to the successor sets of its predecessors.
    fn link(&mut self, node: &Node) {
        for predecessor in &node.predecessors {
            if let Some(producer) = self.nodes.get_mut(predecessor) {
                producer.successors.insert(node.id.clone());
            }
        }
    }

    /// Nodes that consume a resource node, as currently known.
    pub fn consumers_of(&self, resource: &NodeId) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.resources().any(|r| r == resource))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Returns true if any node has not reached a terminal state.
    pub fn has_work_remaining(&self) -> bool {
        self.statuses.values().any(|s| !s.is_terminal())
    }

    /// Returns the current progress as (finished, total).
    pub fn progress(&self) -> (usize, usize) {
        let finished = self.statuses.values().filter(|s| s.is_terminal()).count();
        (finished, self.statuses.len())
    }

    /// Final status of every node.
    pub fn statuses(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.statuses
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    /// Takes the produced values.
    pub fn take_results(&mut self) -> BTreeMap<NodeId, Value> {
        self.results.drain().collect()
    }
}
