//! Execution Engine
//!
//! Drives a built graph to completion:
//! - Bounded parallel scheduling on a tokio `JoinSet`
//! - Lazy resource creation and teardown after the last consumer
//! - Splicing of dynamically replicated steps once their count is known
//! - Fail-fast: the first failure cancels the run and skips pending work
//!
//! A step that was the last consumer of a resource is only marked
//! succeeded once that resource is destroyed, so its dependents never
//! overlap the teardown. Every created resource is destroyed before
//! `execute` returns, whatever the outcome of the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::task::{JoinError, JoinSet};

use crate::error::{BoxError, DestroyError, EvalError, ExecuteError, RunError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::graph::{Graph, NodeId, NodeKind};
use crate::workflow::planner::{ExecutionPlanner, NodeStatus};
use crate::workflow::registry::{Dependencies, Registry};

use super::context::RunContext;
use super::resources::{Released, ResourceManager};
use super::step::{NodeOutcome, NodeTask, TaskResult, Work};

/// Result of one destroy task.
struct DestroyResult {
    name: String,
    /// Consumer whose success waits on this destroy
    owner: Option<NodeId>,
    result: Result<(), BoxError>,
    finished: Instant,
}

/// Executes graphs against a registry of runners and resource kinds.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    max_parallel: usize,
    timeout: Option<Duration>,
}

impl Engine {
    /// Creates an engine with one worker per CPU.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            max_parallel: num_cpus::get(),
            timeout: None,
        }
    }

    /// Sets the maximum number of nodes running at once.
    pub fn set_max_parallel(&mut self, max: usize) {
        self.max_parallel = max.max(1);
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Limits the whole run to `timeout`.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Executes a graph.
    ///
    /// Cancelling `ctx` stops the run: running nodes observe the
    /// cancellation and pending nodes are skipped.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - Every node succeeded or was skipped as an idle resource
    /// * `Err(ExecuteError::Failed)` - The first node failure, with the partial report
    /// * `Err(ExecuteError::Cancelled)` - The caller cancelled the run
    /// * `Err(ExecuteError::Stalled)` - Pending nodes could never become ready
    pub async fn execute(&self, ctx: RunContext, graph: Graph) -> Result<RunReport, ExecuteError> {
        let started_at = Local::now();
        let start = Instant::now();

        let mut ctx = ctx.child();
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }

        info!(
            "Starting execution: {} nodes, {} edges (max parallel: {})",
            graph.len(),
            graph.edge_count(),
            self.max_parallel
        );

        let mut run = Run::new(self, ctx, graph);
        run.drive().await;
        run.teardown().await;
        run.finish(started_at, start.elapsed())
    }
}

/// State of one run.
struct Run<'a> {
    engine: &'a Engine,
    ctx: RunContext,
    planner: ExecutionPlanner,
    resources: Arc<ResourceManager>,
    timeline: ExecutionTimeline,
    tasks: JoinSet<TaskResult>,
    destroys: JoinSet<DestroyResult>,
    destroy_errors: Vec<DestroyError>,
    /// Finished nodes waiting for destroys: remaining count and output
    deferred: HashMap<NodeId, (usize, Option<Value>)>,
    failure: Option<(NodeId, RunError)>,
    cancelled: bool,
    stalled: Vec<NodeId>,
    running: usize,
}

impl<'a> Run<'a> {
    fn new(engine: &'a Engine, ctx: RunContext, graph: Graph) -> Self {
        let planner = ExecutionPlanner::new(graph);
        let resources = Arc::new(ResourceManager::new());
        for node in planner.nodes() {
            if let NodeKind::Resource(resource) = &node.kind {
                resources.register(
                    resource.name.as_str(),
                    resource.kind.as_str(),
                    planner.consumers_of(&node.id),
                );
            }
        }

        Self {
            engine,
            ctx,
            planner,
            resources,
            timeline: ExecutionTimeline::new(),
            tasks: JoinSet::new(),
            destroys: JoinSet::new(),
            destroy_errors: Vec::new(),
            deferred: HashMap::new(),
            failure: None,
            cancelled: false,
            stalled: Vec::new(),
            running: 0,
        }
    }

    fn accepting(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// Main loop: start ready nodes, then wait for a completion.
    async fn drive(&mut self) {
        loop {
            self.observe_cancellation();
            if self.accepting() {
                self.schedule();
            }

            if self.destroys.is_empty() && !self.deferred.is_empty() {
                self.settle_deferred();
                continue;
            }

            if self.running == 0 && self.deferred.is_empty() {
                if self.accepting() && self.planner.has_work_remaining() {
                    let reason = "no runnable nodes";
                    self.stalled = self.planner.skip_pending(reason);
                    error!(
                        "Run stalled: {} nodes can never start",
                        self.stalled.len()
                    );
                    self.record_skipped(self.stalled.clone(), reason);
                }
                break;
            }

            let accepting = self.accepting();
            let destroying = !self.destroys.is_empty();
            tokio::select! {
                Some(joined) = self.tasks.join_next() => {
                    self.running -= 1;
                    match joined {
                        Ok((id, result, finished)) => self.complete(id, result, finished),
                        Err(join_err) => error!("Worker task failed: {}", join_err),
                    }
                }
                Some(joined) = self.destroys.join_next(), if destroying => {
                    self.record_destroy(joined);
                }
                _ = self.ctx.cancelled(), if accepting => {}
            }
        }
    }

    fn observe_cancellation(&mut self) {
        if self.accepting() && self.ctx.is_cancelled() {
            warn!("Run cancelled by caller");
            self.cancelled = true;
            self.skip_pending("run cancelled");
        }
    }

    fn schedule(&mut self) {
        while self.accepting() && self.running < self.engine.max_parallel {
            let ready = self
                .planner
                .get_ready_nodes(self.engine.max_parallel - self.running);
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if !self.accepting() {
                    break;
                }
                self.start(id);
            }
        }
    }

    fn start(&mut self, id: NodeId) {
        info!("Starting node: {}", id);
        self.planner.mark_running(&id);
        self.timeline.add_event(id.as_str(), EventType::Started);

        match self.prepare(&id) {
            Ok(task) => {
                self.tasks.spawn(task.run());
                self.running += 1;
            }
            Err(err) => self.complete(id, Err(err), Instant::now()),
        }
    }

    /// Builds the task for a node that was just marked running.
    fn prepare(&self, id: &NodeId) -> Result<NodeTask, RunError> {
        let node = self
            .planner
            .node(id)
            .ok_or_else(|| EvalError::UnresolvedReference(id.to_string()))?;
        let scope = self.planner.scope_for(node)?;
        let registry = &self.engine.registry;

        let (work, timeout) = match &node.kind {
            NodeKind::Step(step) => {
                let runner = registry
                    .runner(&step.runner)
                    .cloned()
                    .ok_or_else(|| RunError::MissingHandler(format!("runner '{}'", step.runner)))?;

                if let Some(retry) = step.retry.as_ref().filter(|r| r.max_attempts > 1) {
                    warn!(
                        "Node '{}' declares {} attempts; retries are not applied",
                        id, retry.max_attempts
                    );
                }

                let mut deps = Dependencies::new();
                for name in &step.uses {
                    let instance = self
                        .resources
                        .instance(name)
                        .ok_or_else(|| RunError::ResourceUnavailable(name.clone()))?;
                    deps.insert(name.as_str(), instance);
                }

                let work = Work::Step {
                    runner,
                    arguments: step.arguments.clone(),
                    deps,
                };
                (work, step.timeout)
            }
            NodeKind::Resource(resource) => {
                let entry = registry.resource_kind(&resource.kind).cloned().ok_or_else(|| {
                    RunError::MissingHandler(format!("resource kind '{}'", resource.kind))
                })?;
                let work = Work::Create {
                    name: resource.name.clone(),
                    entry,
                    arguments: resource.arguments.clone(),
                    resources: self.resources.clone(),
                };
                (work, None)
            }
            NodeKind::Expansion(expansion) => {
                let work = Work::Expand {
                    replication: expansion.replication.clone(),
                };
                (work, None)
            }
        };

        Ok(NodeTask {
            id: id.clone(),
            ctx: self.ctx.for_node(id.as_str(), timeout),
            scope,
            work,
        })
    }

    fn complete(&mut self, id: NodeId, result: Result<NodeOutcome, RunError>, finished: Instant) {
        match result {
            Ok(NodeOutcome::Output(value)) => self.succeed(id, Some(value), finished),
            Ok(NodeOutcome::Created) => self.succeed(id, None, finished),
            Ok(NodeOutcome::Expanded(instances)) => match self.planner.expand(&id, instances) {
                Ok(children) => {
                    info!("Node '{}' expanded into {} instances", id, children.len());
                    for child in children {
                        let uses = match self.planner.node(&child).map(|n| &n.kind) {
                            Some(NodeKind::Step(step)) => step.uses.clone(),
                            _ => Vec::new(),
                        };
                        for name in uses {
                            self.resources.add_consumers(&name, [child.clone()]);
                        }
                    }
                    self.succeed(id, None, finished);

                    let idle = self.planner.skip_idle_resources();
                    self.record_skipped(idle, "no remaining consumers");
                    if !self.accepting() {
                        self.skip_pending("run cancelled");
                    }
                }
                Err(err) => self.fail(id, RunError::Expansion(err), finished),
            },
            Err(err) => self.fail(id, err, finished),
        }
    }

    /// Records a finished node. Dependents see it succeeded only after
    /// the resources it released are destroyed.
    fn succeed(&mut self, id: NodeId, output: Option<Value>, finished: Instant) {
        self.timeline
            .add_event_at(id.as_str(), EventType::Succeeded, finished);
        let pending = self.release(&id);
        if pending == 0 {
            self.settle(id, output);
        } else {
            debug!("Node '{}' finished, waiting for {} destroys", id, pending);
            self.deferred.insert(id, (pending, output));
        }
    }

    fn settle(&mut self, id: NodeId, output: Option<Value>) {
        self.planner.mark_succeeded(&id, output);
        let (finished, total) = self.planner.progress();
        info!("Node '{}' succeeded ({}/{})", id, finished, total);
    }

    /// Counts down a deferred node; settles it after its last destroy.
    fn destroy_done(&mut self, owner: NodeId) {
        let Some((pending, _)) = self.deferred.get_mut(&owner) else {
            return;
        };
        *pending -= 1;
        if *pending > 0 {
            return;
        }
        if let Some((_, output)) = self.deferred.remove(&owner) {
            self.settle(owner, output);
            let idle = self.planner.skip_idle_resources();
            self.record_skipped(idle, "no remaining consumers");
        }
    }

    /// Settles every deferred node whose destroys can no longer report.
    fn settle_deferred(&mut self) {
        let deferred: Vec<(NodeId, Option<Value>)> = self
            .deferred
            .drain()
            .map(|(id, (_, output))| (id, output))
            .collect();
        for (id, output) in deferred {
            warn!("Node '{}' lost track of its destroys", id);
            self.settle(id, output);
        }
    }

    fn fail(&mut self, id: NodeId, err: RunError, finished: Instant) {
        let message = err.to_string();
        self.timeline
            .add_event_at(id.as_str(), EventType::Failed, finished);
        let skipped = self.planner.mark_failed(&id, message.clone());

        if self.failure.is_none() && !self.cancelled {
            if matches!(err, RunError::Cancelled) {
                warn!("Node '{}' stopped: run cancelled by caller", id);
                self.cancelled = true;
            } else {
                error!("Node '{}' failed: {}", id, message);
                self.failure = Some((id.clone(), err));
                self.ctx.cancel();
            }
        } else {
            warn!("Node '{}' stopped: {}", id, message);
        }

        self.record_skipped(skipped, "dependency failed");
        self.release(&id);
        if !self.accepting() {
            self.skip_pending("run cancelled");
        }
    }

    fn skip_pending(&mut self, reason: &str) {
        let skipped = self.planner.skip_pending(reason);
        self.record_skipped(skipped, reason);
    }

    fn record_skipped(&mut self, ids: Vec<NodeId>, reason: &str) {
        for id in ids {
            debug!("Skipping node '{}': {}", id, reason);
            self.timeline.add_event(id.as_str(), EventType::Skipped);
            self.release(&id);
        }
    }

    /// Destroys resources whose last consumer is `id`.
    ///
    /// Returns the number of destroys started on its behalf.
    fn release(&mut self, id: &NodeId) -> usize {
        let mut started = 0;
        for released in self.resources.release(id) {
            if self.spawn_destroy(released, Some(id.clone())) {
                started += 1;
            }
        }
        started
    }

    fn spawn_destroy(&mut self, released: Released, owner: Option<NodeId>) -> bool {
        let Some(entry) = self.engine.registry.resource_kind(&released.kind) else {
            self.destroy_errors.push(DestroyError {
                source: format!("no handler registered for kind '{}'", released.kind).into(),
                resource: released.name,
            });
            return false;
        };

        info!("Destroying resource '{}'", released.name);
        let destroy = entry.destroy.clone();
        self.destroys.spawn(async move {
            let result = match tokio::spawn(destroy(released.instance)).await {
                Ok(result) => result,
                Err(join_err) => Err(join_err.to_string().into()),
            };
            DestroyResult {
                name: released.name,
                owner,
                result,
                finished: Instant::now(),
            }
        });
        true
    }

    fn record_destroy(&mut self, joined: Result<DestroyResult, JoinError>) {
        let done = match joined {
            Ok(done) => done,
            Err(join_err) => {
                warn!("Destroy task failed: {}", join_err);
                return;
            }
        };

        let id = NodeId::resource(&done.name);
        self.timeline
            .add_event_at(id.as_str(), EventType::Destroyed, done.finished);
        match done.result {
            Ok(()) => debug!("Resource '{}' destroyed", done.name),
            Err(source) => {
                warn!("Destroy of resource '{}' failed: {}", done.name, source);
                self.destroy_errors.push(DestroyError {
                    resource: done.name,
                    source,
                });
            }
        }
        if let Some(owner) = done.owner {
            self.destroy_done(owner);
        }
    }

    /// Destroys every instance still alive and waits for all destroys.
    async fn teardown(&mut self) {
        let live = self.resources.drain_live();
        if !live.is_empty() {
            info!("Destroying {} remaining resources", live.len());
        }
        for released in live {
            self.spawn_destroy(released, None);
        }
        while let Some(joined) = self.destroys.join_next().await {
            self.record_destroy(joined);
        }
        if !self.deferred.is_empty() {
            self.settle_deferred();
        }
    }

    fn finish(mut self, started_at: DateTime<Local>, duration: Duration) -> Result<RunReport, ExecuteError> {
        let report = RunReport {
            statuses: self.planner.statuses(),
            results: self.planner.take_results(),
            timeline: self.timeline,
            destroy_errors: self.destroy_errors,
            started_at,
            duration,
        };
        info!("Execution finished: {}", report.summary());

        match self.failure {
            Some((node, source)) => Err(ExecuteError::Failed {
                node,
                source,
                report: Box::new(report),
            }),
            None if self.cancelled => Err(ExecuteError::Cancelled {
                report: Box::new(report),
            }),
            None if !self.stalled.is_empty() => Err(ExecuteError::Stalled {
                pending: self.stalled,
                report: Box::new(report),
            }),
            None => Ok(report),
        }
    }
}

/// Outcome of a run.
#[derive(Debug)]
pub struct RunReport {
    /// Final status of every node, including spliced instances
    pub statuses: BTreeMap<NodeId, NodeStatus>,
    /// Outputs of successful steps
    pub results: BTreeMap<NodeId, Value>,
    pub timeline: ExecutionTimeline,
    /// Teardown failures; these never fail the run
    pub destroy_errors: Vec<DestroyError>,
    pub started_at: DateTime<Local>,
    pub duration: Duration,
}

impl RunReport {
    pub fn status(&self, id: &str) -> Option<&NodeStatus> {
        self.statuses.get(id)
    }

    pub fn result(&self, id: &str) -> Option<&Value> {
        self.results.get(id)
    }

    /// True if the node was started.
    pub fn ran(&self, id: &str) -> bool {
        self.timeline.was_started(id)
    }

    fn count(&self, pred: impl Fn(&NodeStatus) -> bool) -> usize {
        self.statuses.values().filter(|s| pred(s)).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped in {:.2?}",
            self.count(|s| matches!(s, NodeStatus::Succeeded)),
            self.count(|s| matches!(s, NodeStatus::Failed(_))),
            self.count(|s| matches!(s, NodeStatus::Skipped(_))),
            self.duration
        )
    }
}
