//! Step-wise execution of a compiled graph.
//!
//! Each step runs the current frontier concurrently against a snapshot of
//! the state, folds the updates in through the schema reducers and then
//! follows static and conditional edges. A node may interrupt the run; the
//! executor then saves a [`Checkpoint`] under the run's lineage id and
//! returns. [`Executor::resume`] picks the run up again from that
//! checkpoint, handing the resume value to the interrupted node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trellis_core::{Context, Event};

use crate::compiler::CompiledGraph;
use crate::error::{DslError, Result};
use crate::runtime::{run_node, ExecutionContext, NodeOutput, ResumeValue};

/// Step guard
pub const DEFAULT_MAX_STEPS: usize = 100;

/// Checkpoints kept per lineage
pub const DEFAULT_MAX_CHECKPOINTS: usize = 100;

/// Why a run stopped early
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptInfo {
    /// Interrupted node
    pub node_id: String,
    /// Interrupt key
    pub key: String,
    /// Shown to whoever resumes
    pub payload: Value,
}

/// Saved state of a suspended run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id
    pub id: String,
    /// Run lineage
    pub lineage_id: String,
    /// State after the last completed step
    pub state: Map<String, Value>,
    /// Nodes to run when resumed
    pub pending: Vec<String>,
    /// Steps taken so far
    pub step: usize,
    /// The interrupt, if the run was suspended by one
    pub interrupt: Option<InterruptInfo>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Stores checkpoints by lineage id
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Save a checkpoint
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Newest checkpoint of a lineage
    async fn latest(&self, lineage_id: &str) -> Result<Option<Checkpoint>>;

    /// Every checkpoint of a lineage, oldest first
    async fn list(&self, lineage_id: &str) -> Result<Vec<Checkpoint>>;

    /// Drop a lineage
    async fn delete_lineage(&self, lineage_id: &str) -> Result<()>;
}

/// Process-local checkpoint store
#[derive(Debug)]
pub struct InMemoryCheckpointSaver {
    lineages: DashMap<String, Vec<Checkpoint>>,
    max_per_lineage: usize,
}

impl InMemoryCheckpointSaver {
    /// Store keeping [`DEFAULT_MAX_CHECKPOINTS`] per lineage
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_CHECKPOINTS)
    }

    /// Store keeping at most `max_per_lineage` checkpoints per lineage
    pub fn with_limit(max_per_lineage: usize) -> Self {
        Self { lineages: DashMap::new(), max_per_lineage: max_per_lineage.max(1) }
    }
}

impl Default for InMemoryCheckpointSaver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut entry = self.lineages.entry(checkpoint.lineage_id.clone()).or_default();
        entry.push(checkpoint);
        if entry.len() > self.max_per_lineage {
            let excess = entry.len() - self.max_per_lineage;
            entry.drain(..excess);
        }
        Ok(())
    }

    async fn latest(&self, lineage_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.lineages.get(lineage_id).and_then(|cps| cps.last().cloned()))
    }

    async fn list(&self, lineage_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.lineages.get(lineage_id).map(|cps| cps.value().clone()).unwrap_or_default())
    }

    async fn delete_lineage(&self, lineage_id: &str) -> Result<()> {
        self.lineages.remove(lineage_id);
        Ok(())
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Reached a finish node or ran out of successors
    Completed {
        /// Final state
        state: Map<String, Value>,
    },
    /// Suspended by a node
    Interrupted {
        /// Checkpoint to resume from
        checkpoint_id: String,
        /// The interrupt
        interrupt: InterruptInfo,
        /// State at suspension
        state: Map<String, Value>,
    },
}

impl RunOutcome {
    /// State at the end of the run
    pub fn state(&self) -> &Map<String, Value> {
        match self {
            RunOutcome::Completed { state } | RunOutcome::Interrupted { state, .. } => state,
        }
    }

    /// The interrupt, if suspended
    pub fn interrupt(&self) -> Option<&InterruptInfo> {
        match self {
            RunOutcome::Interrupted { interrupt, .. } => Some(interrupt),
            RunOutcome::Completed { .. } => None,
        }
    }
}

/// Runs a compiled graph
pub struct Executor {
    graph: Arc<CompiledGraph>,
    checkpoints: Arc<dyn CheckpointSaver>,
    max_steps: usize,
    events: Option<mpsc::Sender<Event>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("graph", &self.graph.name())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Executor with an in-memory checkpoint store
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self {
            graph,
            checkpoints: Arc::new(InMemoryCheckpointSaver::new()),
            max_steps: DEFAULT_MAX_STEPS,
            events: None,
        }
    }

    /// Use another checkpoint store
    pub fn with_checkpoint_saver(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpoints = saver;
        self
    }

    /// Change the step guard
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Forward model events to this channel
    pub fn with_event_sender(mut self, events: mpsc::Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    /// The graph being run
    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Checkpoint store
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointSaver> {
        &self.checkpoints
    }

    /// Start a run from the entry node.
    pub async fn run(&self, ctx: &Context, lineage_id: &str, input: Map<String, Value>) -> Result<RunOutcome> {
        let state = self.graph.schema().initial_state(input);
        info!(graph = %self.graph.name(), lineage_id, "starting graph run");
        self.drive(ctx, lineage_id, state, vec![self.graph.entry().to_string()], 0, None)
            .await
    }

    /// Resume a suspended run, handing `value` to the interrupted node.
    pub async fn resume(&self, ctx: &Context, lineage_id: &str, node_id: &str, value: Value) -> Result<RunOutcome> {
        let checkpoint = self
            .checkpoints
            .latest(lineage_id)
            .await?
            .ok_or_else(|| DslError::CheckpointError(format!("no checkpoint for lineage {}", lineage_id)))?;
        let interrupted = checkpoint.interrupt.as_ref().map(|i| i.node_id.as_str());
        if interrupted != Some(node_id) {
            return Err(DslError::CheckpointError(format!(
                "lineage {} is not waiting on node {} (interrupted: {})",
                lineage_id,
                node_id,
                interrupted.unwrap_or("none")
            )));
        }
        info!(lineage_id, node_id, checkpoint_id = %checkpoint.id, "resuming graph run");
        let resume = ResumeValue { node_id: node_id.to_string(), value };
        self.drive(ctx, lineage_id, checkpoint.state, checkpoint.pending, checkpoint.step, Some(resume))
            .await
    }

    async fn drive(
        &self,
        ctx: &Context,
        lineage_id: &str,
        mut state: Map<String, Value>,
        mut frontier: Vec<String>,
        mut step: usize,
        mut resume: Option<ResumeValue>,
    ) -> Result<RunOutcome> {
        let invocation_id = Uuid::new_v4().to_string();

        while !frontier.is_empty() {
            if ctx.is_cancelled() {
                return Err(DslError::Cancelled);
            }
            if step >= self.max_steps {
                return Err(DslError::MaxStepsExceeded(self.max_steps));
            }
            step += 1;
            debug!(step, frontier = ?frontier, "graph step");

            let exec = ExecutionContext {
                invocation_id: invocation_id.clone(),
                events: self.events.clone(),
                resume: resume.take(),
            };
            let snapshot = state.clone();
            let mut runs = Vec::with_capacity(frontier.len());
            for id in &frontier {
                let node = self
                    .graph
                    .node(id)
                    .ok_or_else(|| DslError::InternalError(format!("node {} missing from compiled graph", id)))?;
                runs.push(run_node(id, &node.kind, ctx, &exec, &snapshot));
            }
            let outputs = join_all(runs).await;

            let mut interrupts = Vec::new();
            let mut completed = Vec::with_capacity(frontier.len());
            for (id, output) in frontier.iter().zip(outputs) {
                match output {
                    Ok(NodeOutput::Update(update)) => {
                        self.graph.schema().apply(&mut state, update);
                        completed.push(id.clone());
                    }
                    Ok(NodeOutput::Interrupt(request)) => interrupts.push(InterruptInfo {
                        node_id: id.clone(),
                        key: request.key,
                        payload: request.payload,
                    }),
                    Err(source) => {
                        warn!(node_id = %id, error = %source, "node failed");
                        return Err(DslError::NodeFailed { node_id: id.clone(), source });
                    }
                }
            }

            let mut next = Vec::new();
            for id in &completed {
                for target in self.next_nodes(id, &state)? {
                    if !next.contains(&target) {
                        next.push(target);
                    }
                }
            }

            if let Some(interrupt) = interrupts.first().cloned() {
                // Completed nodes have already advanced; the interrupted ones run again on resume.
                let mut pending: Vec<String> = interrupts.iter().map(|i| i.node_id.clone()).collect();
                pending.extend(next.into_iter().filter(|n| !interrupts.iter().any(|i| &i.node_id == n)));
                let checkpoint = Checkpoint {
                    id: Uuid::new_v4().to_string(),
                    lineage_id: lineage_id.to_string(),
                    state: state.clone(),
                    pending,
                    step,
                    interrupt: Some(interrupt.clone()),
                    created_at: Utc::now(),
                };
                let checkpoint_id = checkpoint.id.clone();
                self.checkpoints.put(checkpoint).await?;
                info!(lineage_id, node_id = %interrupt.node_id, %checkpoint_id, "graph run interrupted");
                return Ok(RunOutcome::Interrupted { checkpoint_id, interrupt, state });
            }

            frontier = next;
        }

        info!(lineage_id, steps = step, "graph run completed");
        Ok(RunOutcome::Completed { state })
    }

    /// Successors of a completed node: none for finish nodes, otherwise
    /// static edges followed by the routed conditional target.
    fn next_nodes(&self, id: &str, state: &Map<String, Value>) -> Result<Vec<String>> {
        if self.graph.is_finish(id) {
            return Ok(Vec::new());
        }
        let mut out: Vec<String> = self.graph.successors(id).to_vec();
        if let Some(condition) = self.graph.condition(id) {
            let target = condition.route(state)?;
            if !out.contains(&target) {
                out.push(target);
            }
        }
        Ok(out)
    }
}
