//! Staged pipeline on top of the executor facade.
//!
//! Every registered task runs inside the stage harness and owns a request and
//! a publish queue. A single sequencer task walks the stages in order: it
//! seeds stage 1, waits until every member of the current stage has
//! published once, then broadcasts the collected values to every member of
//! the next stage. A stage never starts a cycle before the previous stage
//! finished that cycle.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::harness::{harness_kwargs, STAGE_HARNESS};
use super::queue::{stage_queues, Publication, StageEndpoints, StageMessage, StopSignal};
use crate::config::{BackendKind, CoordinatorConfig, HarnessMode};
use crate::context::ShareContext;
use crate::core::errors::{ConveyorError, Result};
use crate::executor::TaskExecutor;
use crate::function::FunctionRegistry;
use crate::task::model::{TaskId, TaskSpec};

/// Cycle outputs kept for `outputs()`; older ones are dropped
const OUTPUT_HISTORY: usize = 256;

/// How the sequencer ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// The last stage finished its final cycle
    Completed,
    /// The stop signal fired first
    Stopped,
}

/// What the last stage published in one completed cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutput {
    /// 1-based
    pub cycle: usize,
    pub values: Vec<Value>,
}

struct StageMember {
    task_id: TaskId,
    function: String,
    injected: Vec<String>,
    /// Required parameters neither bound, defaulted nor injected
    unbound: Vec<&'static str>,
    requests: mpsc::Sender<StageMessage>,
    publish_tx: mpsc::Sender<Publication>,
    publish_rx: mpsc::Receiver<Publication>,
}

/// Sequencer-side ends of one member's queues
struct StageLink {
    task_id: TaskId,
    requests: mpsc::Sender<StageMessage>,
    publish: mpsc::Receiver<Publication>,
}

/// Queue ends the coordinator keeps so `stop` can push close sentinels
struct Closer {
    requests: mpsc::Sender<StageMessage>,
    publish: mpsc::Sender<Publication>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    executor: TaskExecutor,
    registered: BTreeMap<i64, Vec<StageMember>>,
    layout: Vec<Vec<TaskId>>,
    stop: StopSignal,
    closers: Vec<Closer>,
    sequencer: Option<JoinHandle<PipelineState>>,
    state: Option<PipelineState>,
    outputs: Arc<Mutex<VecDeque<CycleOutput>>>,
    started: bool,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        let executor = TaskExecutor::new(config.executor.clone())?;
        Ok(Self {
            config,
            executor,
            registered: BTreeMap::new(),
            layout: Vec::new(),
            stop: StopSignal::new(),
            closers: Vec::new(),
            sequencer: None,
            state: None,
            outputs: Arc::new(Mutex::new(VecDeque::new())),
            started: false,
        })
    }

    pub fn mode(&self) -> HarnessMode {
        self.config.task_mode
    }

    pub fn bind_share(&mut self, share: ShareContext) -> Result<()> {
        self.executor.bind_share(share)
    }

    /// Register `spec` as a member of stage `order`.
    ///
    /// Arguments are bound against the function's parameters right away and
    /// declared defaults are applied, except to `spec.upstream_keys`, which
    /// stay open for the previous stage's broadcast. Returns the id of the
    /// harness task running the member.
    pub fn submit(&mut self, order: i64, spec: TaskSpec) -> Result<TaskId> {
        if self.started {
            return Err(ConveyorError::registration(
                "stage tasks must be registered before start",
            ));
        }
        let function = FunctionRegistry::global().resolve(&spec.function)?;
        let mut bound = function.bind_partial(&spec.args, &spec.kwargs)?;

        let mut injected = Vec::with_capacity(spec.upstream_keys.len());
        for key in &spec.upstream_keys {
            if function.param(key).is_none() {
                return Err(ConveyorError::binding_param(
                    function.name,
                    "upstream key is not a parameter",
                    key,
                ));
            }
            if bound.contains_key(key) {
                return Err(ConveyorError::binding_param(
                    function.name,
                    "upstream key is already bound",
                    key,
                ));
            }
            if !injected.contains(key) {
                injected.push(key.clone());
            }
        }
        function.apply_defaults(&mut bound, &injected);
        let unbound = function.missing_required(&bound, |name| injected.iter().any(|k| k == name));

        let ((req_tx, req_rx), (pub_tx, pub_rx)) = stage_queues(self.config.queue_capacity);
        let harness = TaskSpec {
            function: STAGE_HARNESS.to_string(),
            args: Vec::new(),
            kwargs: harness_kwargs(function.name, bound, &injected, self.config.task_mode),
            group: spec.group.clone(),
            tags: spec.tags.clone(),
            name: Some(spec.display_name().to_string()),
            upstream_keys: Vec::new(),
        };
        let endpoints = StageEndpoints {
            requests: req_rx,
            publish: pub_tx.clone(),
            stop: self.stop.clone(),
        };
        let task_id = self.executor.submit_staged(harness, endpoints)?;
        debug!(task_id = %task_id, order, function = function.name, "stage task registered");

        self.registered.entry(order).or_default().push(StageMember {
            task_id: task_id.clone(),
            function: function.name.to_string(),
            injected,
            unbound,
            requests: req_tx,
            publish_tx: pub_tx,
            publish_rx: pub_rx,
        });
        Ok(task_id)
    }

    fn validate(&self) -> Result<()> {
        if self.config.executor.mode == BackendKind::Batched {
            return Err(ConveyorError::configuration_field(
                "a pipeline needs every stage running at once",
                "mode",
                "thread | process",
                BackendKind::Batched.as_str(),
            ));
        }
        if self.registered.is_empty() {
            return Err(ConveyorError::registration("no stage tasks registered"));
        }
        let total: usize = self.registered.values().map(Vec::len).sum();
        let workers = self.config.executor.effective_max_workers();
        if total > workers {
            return Err(ConveyorError::configuration_field(
                "every stage task needs its own worker",
                "max_workers",
                format!(">= {}", total),
                workers.to_string(),
            ));
        }

        let mode = self.config.task_mode;
        let share = self.executor.share();
        for (index, members) in self.registered.values().enumerate() {
            for member in members {
                let has_keys = !member.injected.is_empty();
                let problem = match mode {
                    HarnessMode::Custom if has_keys => {
                        Some("custom stages read their request queue directly")
                    }
                    HarnessMode::Once | HarnessMode::Persistent if index == 0 && has_keys => {
                        Some("first-stage tasks have no upstream")
                    }
                    HarnessMode::Once | HarnessMode::Persistent if index > 0 && !has_keys => {
                        Some("later-stage tasks must declare upstream keys")
                    }
                    _ => None,
                };
                if let Some(message) = problem {
                    return Err(ConveyorError::binding(&member.function, message));
                }

                let missing: Vec<&str> = member
                    .unbound
                    .iter()
                    .copied()
                    .filter(|name| {
                        name.starts_with('_') || share.and_then(|s| s.value(name)).is_none()
                    })
                    .collect();
                if let Some(first) = missing.first() {
                    return Err(ConveyorError::binding_param(
                        &member.function,
                        format!("unbound required parameters: {}", missing.join(", ")),
                        *first,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate the registration, start the executor and launch the
    /// sequencer
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(ConveyorError::registration("coordinator already started"));
        }
        self.validate()?;
        self.executor.start().await?;
        self.started = true;

        // Dense 1..K stage numbering in ascending order
        let mut stages = Vec::with_capacity(self.registered.len());
        for (_, members) in std::mem::take(&mut self.registered) {
            let mut links = Vec::with_capacity(members.len());
            let mut ids = Vec::with_capacity(members.len());
            for member in members {
                self.closers.push(Closer {
                    requests: member.requests.clone(),
                    publish: member.publish_tx,
                });
                ids.push(member.task_id.clone());
                links.push(StageLink {
                    task_id: member.task_id,
                    requests: member.requests,
                    publish: member.publish_rx,
                });
            }
            self.layout.push(ids);
            stages.push(links);
        }

        info!(
            stages = stages.len(),
            tasks = self.closers.len(),
            mode = self.config.task_mode.as_str(),
            "pipeline started"
        );
        let sequencer = Sequencer {
            stages,
            stop: self.stop.clone(),
            cycles: self.config.task_mode.cycles(),
            max_cycles: self.config.max_cycles,
            outputs: self.outputs.clone(),
        };
        self.sequencer = Some(tokio::spawn(sequencer.run()));
        Ok(())
    }

    /// Wait for the sequencer to finish
    pub async fn wait(&mut self) -> Result<PipelineState> {
        if let Some(state) = self.state {
            return Ok(state);
        }
        let sequencer = self
            .sequencer
            .take()
            .ok_or_else(|| ConveyorError::registration("coordinator is not started"))?;
        let state = sequencer
            .await
            .map_err(|e| ConveyorError::internal(format!("sequencer failed: {}", e)))?;
        self.state = Some(state);
        Ok(state)
    }

    /// Wait for every stage task to return; see [`TaskExecutor::join`]
    pub async fn join(&mut self) -> Result<Vec<(TaskId, Option<Value>)>> {
        self.executor.join(true).await
    }

    /// Set the stop signal, unblock every queue and stop the executor
    pub async fn stop(&mut self) -> Result<()> {
        self.stop.set();
        for closer in self.closers.drain(..) {
            let _ = closer.requests.try_send(StageMessage::Close);
            let _ = closer.publish.try_send(Publication::Close);
        }
        if let Some(sequencer) = self.sequencer.take() {
            match sequencer.await {
                Ok(state) => self.state = Some(state),
                Err(e) => warn!(error = %e, "sequencer ended abnormally"),
            }
        }
        self.executor.stop().await?;
        info!("pipeline stopped");
        Ok(())
    }

    /// Harness task ids per dense stage index, available after start
    pub fn stages(&self) -> &[Vec<TaskId>] {
        &self.layout
    }

    /// Last-stage publications of each completed cycle, oldest first
    pub fn outputs(&self) -> Vec<CycleOutput> {
        self.outputs.lock().iter().cloned().collect()
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut TaskExecutor {
        &mut self.executor
    }
}

impl Drop for Coordinator {
    /// Dropping a running pipeline closes it like `stop`, minus the executor
    /// teardown, so no harness stays blocked on its request queue
    fn drop(&mut self) {
        if self.closers.is_empty() {
            return;
        }
        warn!("coordinator dropped while running, closing stage queues");
        self.stop.set();
        for closer in self.closers.drain(..) {
            let _ = closer.requests.try_send(StageMessage::Close);
            let _ = closer.publish.try_send(Publication::Close);
        }
    }
}

struct Sequencer {
    stages: Vec<Vec<StageLink>>,
    stop: StopSignal,
    cycles: bool,
    max_cycles: Option<usize>,
    outputs: Arc<Mutex<VecDeque<CycleOutput>>>,
}

impl Sequencer {
    async fn run(mut self) -> PipelineState {
        let last = self.stages.len() - 1;
        let mut cycle = 0usize;
        loop {
            cycle += 1;
            for link in &self.stages[0] {
                if !deliver(link, StageMessage::Proceed, &self.stop).await {
                    return PipelineState::Stopped;
                }
            }

            for index in 0..=last {
                let Some(collected) = barrier(&mut self.stages[index], &self.stop).await else {
                    debug!(cycle, stage = index + 1, "sequencer stopped at barrier");
                    return PipelineState::Stopped;
                };
                debug!(cycle, stage = index + 1, values = collected.len(), "stage complete");

                if index == last {
                    let mut outputs = self.outputs.lock();
                    if outputs.len() == OUTPUT_HISTORY {
                        outputs.pop_front();
                    }
                    outputs.push_back(CycleOutput {
                        cycle,
                        values: collected,
                    });
                    break;
                }
                for link in &self.stages[index + 1] {
                    let message = StageMessage::Payload(collected.clone());
                    if !deliver(link, message, &self.stop).await {
                        return PipelineState::Stopped;
                    }
                }
            }

            if !self.cycles || self.max_cycles.is_some_and(|max| cycle >= max) {
                info!(cycles = cycle, "pipeline completed");
                return PipelineState::Completed;
            }
            if self.stop.is_set() {
                return PipelineState::Stopped;
            }
        }
    }
}

/// Send one request, giving up when the stop signal fires
async fn deliver(link: &StageLink, message: StageMessage, stop: &StopSignal) -> bool {
    tokio::select! {
        biased;
        _ = stop.wait() => false,
        sent = link.requests.send(message) => {
            if sent.is_err() {
                warn!(task_id = %link.task_id, "request queue closed");
            }
            sent.is_ok()
        }
    }
}

/// Full barrier: one publication from every member, in arrival order.
/// `None` when the pipeline stops first.
async fn barrier(links: &mut [StageLink], stop: &StopSignal) -> Option<Vec<Value>> {
    let mut collected = Vec::with_capacity(links.len());
    let mut pending: FuturesUnordered<_> = links
        .iter_mut()
        .map(|link| async move { link.publish.recv().await })
        .collect();

    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => return None,
            next = pending.next() => match next {
                Some(Some(Publication::Value(value))) => collected.push(value),
                Some(Some(Publication::Close)) | Some(None) => return None,
                None => return Some(collected),
            }
        }
    }
}
