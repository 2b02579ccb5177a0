//! Broker evaluation: the central state-advancement function.
//!
//! `evaluate` is a pure function over `(playbook, event history, context)`
//! returning a list of [`BrokerDecision`]s; the [`Broker`] driver loads the
//! snapshot, commits the decisions, and re-evaluates when a committed
//! decision itself completes a step (loop aggregates, control chains).
//!
//! Idempotence: calling evaluation any number of times on the same state
//! commits the same result once. Dedup comes from three places: the
//! `step_completed` existence check before emission, the `step_started`
//! check before dispatch, and the queue's unique `(execution_id, node_id)`
//! constraint.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::db::models::{Event, EventStatus, EventType};
use crate::db::queries;
use crate::db::DbPool;
use crate::engine::context::{build_context, EvalContext};
use crate::engine::loops::{self, LoopMode, LoopSpec};
use crate::engine::transition::{build_task, retry_policy, transition_fires};
use crate::error::{AppError, AppResult};
use crate::playbook::parser::ensure_terminal_step;
use crate::playbook::types::{Playbook, Step};
use crate::playbook::parse_playbook;
use crate::services::event::EventService;
use crate::services::execution::{ChildLink, ExecutionService};
use crate::snowflake::SnowflakeGenerator;
use crate::template::TemplateRenderer;

/// Control-step chains are followed inline up to this depth.
const MAX_CONTROL_DEPTH: usize = 8;

/// Commit/re-evaluate rounds per trigger; aggregates and control chains
/// settle in two or three.
const MAX_ROUNDS: usize = 10;

/// An event the broker wants emitted.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub status: EventStatus,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub node_type: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub context: Option<Value>,
    pub current_index: Option<i32>,
    pub current_item: Option<Value>,
    pub loop_id: Option<String>,
    pub loop_name: Option<String>,
    pub parent_event_id: Option<i64>,
}

impl EventDraft {
    fn new(event_type: EventType, status: EventStatus, node_name: &str) -> Self {
        Self {
            event_type,
            status,
            node_id: None,
            node_name: Some(node_name.to_string()),
            node_type: None,
            result: None,
            error: None,
            context: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            parent_event_id: None,
        }
    }
}

/// A queue insert the broker wants performed.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub node_id: String,
    pub action: Value,
    pub context: Value,
    pub priority: i32,
    pub max_attempts: i32,
    /// "queued" for worker jobs; "leased" for the in-flight iterator guard
    /// entry that fan-in later marks done.
    pub initial_status: &'static str,
}

/// A child execution the broker wants started (sub-playbook iteration).
#[derive(Debug, Clone)]
pub struct ChildExecutionDraft {
    pub playbook_path: String,
    pub playbook_version: Option<String>,
    pub payload: Map<String, Value>,
    pub parent_step: String,
    /// loop_iteration event emitted once the child id is known.
    pub iteration: EventDraft,
}

/// One unit of committed side effect.
#[derive(Debug, Clone)]
pub enum BrokerDecision {
    EmitEvent(EventDraft),
    EnqueueJob(JobDraft),
    StartChildExecution(ChildExecutionDraft),
    FinalizeExecution { result: Option<Value> },
}

/// Immutable view of an execution's event history.
pub struct ExecutionSnapshot<'a> {
    pub execution_id: i64,
    pub catalog_id: i64,
    pub events: &'a [Event],
}

impl<'a> ExecutionSnapshot<'a> {
    pub fn new(execution_id: i64, catalog_id: i64, events: &'a [Event]) -> Self {
        Self {
            execution_id,
            catalog_id,
            events,
        }
    }

    /// Whether a node already has an event of the given type.
    pub fn has_node_event(&self, node_name: &str, event_type: &str) -> bool {
        self.events.iter().any(|e| {
            e.event_type == event_type && e.node_name.as_deref() == Some(node_name)
        })
    }

    /// Distinct step names with a `step_completed` event.
    pub fn completed_steps(&self) -> HashSet<&str> {
        self.events
            .iter()
            .filter(|e| e.event_type == "step_completed")
            .filter_map(|e| e.node_name.as_deref())
            .collect()
    }

    /// Steps with a completion event but no `step_completed` yet.
    ///
    /// Per-iteration completions do not count; an iterator step completes
    /// only through its aggregate (`loop_completed` context flag).
    pub fn newly_completed_steps(&self) -> Vec<String> {
        let completed = self.completed_steps();
        let mut seen = HashSet::new();
        let mut names = Vec::new();

        for event in self.events {
            if !matches!(event.event_type.as_str(), "action_completed" | "step_result") {
                continue;
            }
            let status = event.status.to_uppercase();
            if status != "COMPLETED" && status != "SUCCESS" {
                continue;
            }
            if event.is_iteration_event() {
                continue;
            }
            let Some(name) = event.node_name.as_deref() else {
                continue;
            };
            if completed.contains(name) || !seen.insert(name.to_string()) {
                continue;
            }
            names.push(name.to_string());
        }

        names
    }

    /// Event id of the latest completion event for a node (causal parent
    /// for its `step_completed`).
    pub fn latest_completion_event_id(&self, node_name: &str) -> Option<i64> {
        self.events
            .iter()
            .rev()
            .find(|e| {
                matches!(e.event_type.as_str(), "action_completed" | "step_result")
                    && e.node_name.as_deref() == Some(node_name)
            })
            .map(|e| e.event_id)
    }

    /// The `execution_start` event.
    pub fn start_event(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.event_type == "execution_start")
    }

    /// Parent linkage for child executions: `(parent_execution_id,
    /// parent_step, iteration meta)` from the start event.
    pub fn parent_meta(&self) -> Option<Value> {
        let start = self.start_event()?;
        let parent_execution_id = start.parent_execution_id?;

        let meta = start
            .context
            .as_ref()
            .and_then(|c| c.get("_meta"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        let mut map = match meta {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert(
            "parent_execution_id".to_string(),
            Value::String(parent_execution_id.to_string()),
        );

        Some(Value::Object(map))
    }

    /// Playbook path/version recorded on the start event.
    pub fn path_version(&self) -> (Option<String>, Option<String>) {
        let Some(context) = self.start_event().and_then(|e| e.context.as_ref()) else {
            return (None, None);
        };
        (
            context
                .get("path")
                .and_then(|v| v.as_str())
                .map(String::from),
            context
                .get("version")
                .and_then(|v| v.as_str())
                .map(String::from),
        )
    }

    /// Whether the execution has reached a terminal event.
    pub fn is_terminal(&self) -> bool {
        self.events.iter().any(|e| {
            matches!(
                e.event_type.as_str(),
                "execution_complete" | "execution_failed"
            )
        })
    }
}

/// Pure broker evaluation.
///
/// Errors inside one step's evaluation never stall the others: each step is
/// processed independently and failures are logged and skipped.
pub fn evaluate(
    pb: &Playbook,
    snapshot: &ExecutionSnapshot<'_>,
    ctx: &EvalContext,
    renderer: &TemplateRenderer,
) -> Vec<BrokerDecision> {
    let mut eval = Evaluation {
        pb,
        snapshot,
        ctx,
        renderer,
        decisions: Vec::new(),
        decided_started: HashSet::new(),
        decided_completed: HashSet::new(),
        finalized: false,
    };

    for step_name in snapshot.newly_completed_steps() {
        if let Err(e) = eval.process_completed_step(&step_name) {
            warn!(step = %step_name, error = %e, "Step evaluation failed; continuing");
        }
    }

    eval.decisions
}

struct Evaluation<'a> {
    pb: &'a Playbook,
    snapshot: &'a ExecutionSnapshot<'a>,
    ctx: &'a EvalContext,
    renderer: &'a TemplateRenderer,
    decisions: Vec<BrokerDecision>,
    decided_started: HashSet<String>,
    decided_completed: HashSet<String>,
    finalized: bool,
}

impl<'a> Evaluation<'a> {
    fn process_completed_step(&mut self, step_name: &str) -> AppResult<()> {
        let Some(step) = self.pb.get_step(step_name) else {
            warn!(step = %step_name, "Completed step not found in playbook");
            return Ok(());
        };

        self.decided_completed.insert(step_name.to_string());
        let mut draft = EventDraft::new(EventType::StepCompleted, EventStatus::Completed, step_name);
        draft.node_id = Some(self.node_id(step_name));
        draft.node_type = Some("step".to_string());
        draft.parent_event_id = self.snapshot.latest_completion_event_id(step_name);
        self.decisions.push(BrokerDecision::EmitEvent(draft));

        self.fire_transitions(step, 0)
    }

    fn fire_transitions(&mut self, source: &Step, depth: usize) -> AppResult<()> {
        let transitions = source.transitions();
        if transitions.is_empty() {
            if source.step == "end" {
                self.finalize(source);
            }
            return Ok(());
        }

        let source_result = self.ctx.get(&source.step).cloned();

        for transition in transitions {
            if !transition_fires(transition, source_result.as_ref(), self.ctx, self.renderer) {
                debug!(from = %source.step, to = %transition.step_name(), "Transition condition not met");
                continue;
            }

            let target_name = transition.step_name();
            let Some(target) = self.pb.get_step(target_name) else {
                warn!(from = %source.step, to = %target_name, "Transition target not found");
                continue;
            };

            if self.is_step_seen(target_name) && target_name != "end" {
                debug!(step = %target_name, "Target already started or completed; skipping");
                continue;
            }

            let edge_data = transition.edge_data();

            if !target.is_actionable() {
                self.handle_control_step(target, depth + 1)?;
            } else if target.kind() == "iterator" {
                self.fan_out(target, &edge_data)?;
            } else {
                self.dispatch(target, &edge_data);
            }
        }

        Ok(())
    }

    fn is_step_seen(&self, step_name: &str) -> bool {
        self.decided_started.contains(step_name)
            || self.decided_completed.contains(step_name)
            || self.snapshot.has_node_event(step_name, "step_started")
            || self.snapshot.has_node_event(step_name, "step_completed")
    }

    fn handle_control_step(&mut self, target: &Step, depth: usize) -> AppResult<()> {
        if depth > MAX_CONTROL_DEPTH {
            return Err(AppError::Validation(format!(
                "Control-step chain deeper than {} at '{}'",
                MAX_CONTROL_DEPTH, target.step
            )));
        }

        if target.step == "end" {
            // The end step aggregates: finalize only once every actionable
            // step has a step_completed event.
            let mut completed: HashSet<&str> = self.snapshot.completed_steps();
            for name in &self.decided_completed {
                completed.insert(name.as_str());
            }
            let actionable = self.pb.actionable_step_count();

            if completed.len() >= actionable {
                self.finalize(target);
            } else {
                debug!(
                    completed = completed.len(),
                    actionable, "End step waiting for remaining steps"
                );
            }
            return Ok(());
        }

        if self.decided_completed.contains(&target.step)
            || self.snapshot.has_node_event(&target.step, "step_completed")
        {
            return Ok(());
        }

        self.decided_completed.insert(target.step.clone());
        let mut draft =
            EventDraft::new(EventType::StepCompleted, EventStatus::Completed, &target.step);
        draft.node_id = Some(self.node_id(&target.step));
        draft.node_type = Some("step".to_string());
        self.decisions.push(BrokerDecision::EmitEvent(draft));

        self.fire_transitions(target, depth)
    }

    fn finalize(&mut self, end_step: &Step) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let result = match &end_step.result {
            Some(mapping) => match self.renderer.render_value(mapping, self.ctx) {
                Ok(rendered) => Some(rendered),
                Err(e) => {
                    warn!(error = %e, "Failed to render end result mapping; using raw mapping");
                    Some(mapping.clone())
                }
            },
            None => Some(self.aggregate_results()),
        };

        info!("Workflow reached terminal step; finalizing execution");
        self.decisions.push(BrokerDecision::FinalizeExecution { result });
    }

    /// Collected per-step results for the implicit end step.
    fn aggregate_results(&self) -> Value {
        let mut map = Map::new();
        for step in &self.pb.workflow {
            if let Some(result) = self.ctx.get(&step.step) {
                map.insert(step.step.clone(), result.clone());
            }
        }
        Value::Object(map)
    }

    fn dispatch(&mut self, target: &Step, edge_data: &Map<String, Value>) {
        self.decided_started.insert(target.step.clone());

        let node_id = self.node_id(&target.step);

        let mut started =
            EventDraft::new(EventType::StepStarted, EventStatus::Running, &target.step);
        started.node_id = Some(node_id.clone());
        started.node_type = Some("step".to_string());
        if !edge_data.is_empty() {
            started.context = Some(Value::Object(edge_data.clone()));
        }
        self.decisions.push(BrokerDecision::EmitEvent(started));

        let task = build_task(target, edge_data);
        let (max_attempts, _) = retry_policy(&task);
        let context = self.job_context(&target.step, edge_data, None);

        self.decisions.push(BrokerDecision::EnqueueJob(JobDraft {
            node_id,
            action: task,
            context,
            priority: 5,
            max_attempts,
            initial_status: "queued",
        }));
    }

    fn fan_out(&mut self, target: &Step, edge_data: &Map<String, Value>) -> AppResult<()> {
        let spec = LoopSpec::from_step(target)?;
        if spec.task.is_none() {
            return Err(AppError::InvalidPlaybook(format!(
                "Iterator step '{}' has no nested task",
                target.step
            )));
        }

        self.decided_started.insert(target.step.clone());

        let guard_node_id = self.node_id(&target.step);
        let loop_id = loops::loop_id(self.snapshot.execution_id, &target.step);
        let step_index = self.pb.step_index(&target.step).unwrap_or(0);

        let mut started =
            EventDraft::new(EventType::StepStarted, EventStatus::Running, &target.step);
        started.node_id = Some(guard_node_id.clone());
        started.node_type = Some("loop".to_string());
        self.decisions.push(BrokerDecision::EmitEvent(started));

        let mut ctx = self.ctx.clone();
        for (k, v) in edge_data {
            ctx.insert(k.clone(), v.clone());
        }
        let items = spec.resolve_items(&ctx, self.renderer)?;

        let guard_task = build_task(target, edge_data);
        let (max_attempts, _) = retry_policy(&guard_task);

        let guard_context = self.job_context(&target.step, edge_data, None);

        if items.is_empty() {
            // Zero iterations: aggregate immediately so the parent
            // transition fires on the next evaluation round.
            self.decisions.push(BrokerDecision::EnqueueJob(JobDraft {
                node_id: guard_node_id.clone(),
                action: guard_task,
                context: guard_context,
                priority: 5,
                max_attempts,
                initial_status: "done",
            }));
            self.push_aggregate_events(&target.step, &guard_node_id, &loop_id, &[]);
            return Ok(());
        }

        self.decisions.push(BrokerDecision::EnqueueJob(JobDraft {
            node_id: guard_node_id,
            action: guard_task,
            context: guard_context,
            priority: 5,
            max_attempts,
            initial_status: "leased",
        }));

        for (k, item) in items.iter().enumerate() {
            let iter_node_id =
                loops::iteration_node_id(self.snapshot.execution_id, step_index, k);

            let mut iteration = EventDraft::new(
                EventType::LoopIteration,
                EventStatus::Running,
                &target.step,
            );
            iteration.node_id = Some(iter_node_id.clone());
            iteration.node_type = Some("loop".to_string());
            iteration.current_index = Some(k as i32);
            iteration.current_item = Some(item.clone());
            iteration.loop_id = Some(loop_id.clone());
            iteration.loop_name = Some(target.step.clone());
            iteration.context = Some(serde_json::json!({ "element": spec.element }));

            let dispatch_now = spec.mode == LoopMode::Async || k == 0;

            if spec.is_sub_playbook() {
                if dispatch_now {
                    let task = spec.task.as_ref().unwrap();
                    self.decisions
                        .push(BrokerDecision::StartChildExecution(ChildExecutionDraft {
                            playbook_path: task
                                .get("path")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            playbook_version: task
                                .get("version")
                                .and_then(|v| v.as_str())
                                .map(String::from),
                            payload: loops::child_payload(&spec, item, self.renderer, &ctx),
                            parent_step: target.step.clone(),
                            iteration,
                        }));
                } else {
                    // Deferred sync iteration: the iteration event is still
                    // recorded now so the expected count is stable.
                    self.decisions.push(BrokerDecision::EmitEvent(iteration));
                }
            } else {
                self.decisions.push(BrokerDecision::EmitEvent(iteration));
                if dispatch_now {
                    let job =
                        self.iteration_job(&spec, target, &iter_node_id, &loop_id, k, item);
                    self.decisions.push(BrokerDecision::EnqueueJob(job));
                }
            }
        }

        Ok(())
    }

    fn iteration_job(
        &self,
        spec: &LoopSpec,
        target: &Step,
        iter_node_id: &str,
        loop_id: &str,
        k: usize,
        item: &Value,
    ) -> JobDraft {
        let action = crate::playbook::normalize::normalize_task(spec.task.as_ref().unwrap());
        let (max_attempts, _) = retry_policy(&action);

        let iteration_meta = loops::iteration_meta(
            iter_node_id,
            loop_id,
            &target.step,
            k,
            item,
            &spec.element,
        );

        let mut edge = Map::new();
        edge.insert(spec.element.clone(), item.clone());

        JobDraft {
            node_id: iter_node_id.to_string(),
            action,
            context: self.job_context(&target.step, &edge, Some(iteration_meta)),
            priority: 5,
            max_attempts,
            initial_status: "queued",
        }
    }

    /// Worker-facing context for a job.
    fn job_context(
        &self,
        step_name: &str,
        edge_data: &Map<String, Value>,
        iteration: Option<Value>,
    ) -> Value {
        let (path, version) = self.snapshot.path_version();

        let mut context = Map::new();
        context.insert(
            "workload".to_string(),
            self.ctx
                .get("workload")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        );
        context.insert("step_name".to_string(), Value::String(step_name.to_string()));
        if let Some(path) = path {
            context.insert("path".to_string(), Value::String(path));
        }
        if let Some(version) = version {
            context.insert("version".to_string(), Value::String(version));
        }
        context.insert(
            "catalog_id".to_string(),
            Value::String(self.snapshot.catalog_id.to_string()),
        );

        for (k, v) in edge_data {
            context.insert(k.clone(), v.clone());
        }

        let mut meta = match self.snapshot.parent_meta() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if let Some(iteration) = iteration {
            meta.insert("iteration".to_string(), iteration);
        }
        if !meta.is_empty() {
            context.insert("_meta".to_string(), Value::Object(meta));
        }

        Value::Object(context)
    }

    fn node_id(&self, step_name: &str) -> String {
        format!("{}:{}", self.snapshot.execution_id, step_name)
    }

    fn push_aggregate_events(
        &mut self,
        step_name: &str,
        node_id: &str,
        loop_id: &str,
        results: &[Value],
    ) {
        let envelope = loops::aggregate_envelope(results);
        let context = loops::aggregate_context(results.len());

        for event_type in [EventType::ActionCompleted, EventType::Result, EventType::LoopCompleted]
        {
            let mut draft = EventDraft::new(event_type, EventStatus::Completed, step_name);
            draft.node_id = Some(node_id.to_string());
            draft.node_type = Some("loop".to_string());
            draft.result = Some(envelope.clone());
            draft.context = Some(context.clone());
            draft.loop_id = Some(loop_id.to_string());
            draft.loop_name = Some(step_name.to_string());
            self.decisions.push(BrokerDecision::EmitEvent(draft));
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Async driver that loads execution state, runs the pure evaluation, and
/// commits the resulting decisions.
#[derive(Clone)]
pub struct Broker {
    pool: DbPool,
    events: EventService,
    executions: ExecutionService,
}

impl Broker {
    pub fn new(pool: DbPool, ids: SnowflakeGenerator, executions: ExecutionService) -> Self {
        let events = EventService::new(pool.clone(), ids);
        Self {
            pool,
            events,
            executions,
        }
    }

    /// Load the playbook for a catalog entry, preferring the parsed payload
    /// (which carries the implicit terminal step).
    pub async fn load_playbook(&self, catalog_id: i64) -> AppResult<Playbook> {
        let entry = queries::catalog::get_catalog_by_id(&self.pool, catalog_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Catalog entry not found: {}", catalog_id))
            })?;

        if let Some(payload) = entry.payload {
            if let Ok(pb) = serde_json::from_value::<Playbook>(payload) {
                return Ok(ensure_terminal_step(pb));
            }
        }

        Ok(ensure_terminal_step(parse_playbook(&entry.content)?))
    }

    /// Evaluate an execution and commit the resulting decisions.
    ///
    /// Safe to invoke on every completion event and from any number of
    /// replicas concurrently.
    pub async fn evaluate_execution(&self, execution_id: i64) -> AppResult<()> {
        let renderer = TemplateRenderer::new();

        for round in 0..MAX_ROUNDS {
            if queries::event::is_execution_terminal(&self.pool, execution_id).await? {
                return Ok(());
            }

            let events =
                queries::event::get_events_by_execution(&self.pool, execution_id, None, None)
                    .await?;
            if events.is_empty() {
                return Ok(());
            }

            let catalog_id = events[0].catalog_id;
            let pb = self.load_playbook(catalog_id).await?;

            let workload = queries::workload::get_workload(&self.pool, execution_id).await?;
            let node_results =
                queries::event::get_all_node_results(&self.pool, execution_id).await?;
            let ctx = build_context(execution_id, workload.as_ref(), &node_results);

            let snapshot = ExecutionSnapshot::new(execution_id, catalog_id, &events);
            let decisions = evaluate(&pb, &snapshot, &ctx, &renderer);

            if decisions.is_empty() {
                return Ok(());
            }

            debug!(
                execution_id,
                round,
                decisions = decisions.len(),
                "Committing broker decisions"
            );

            let re_evaluate = self.commit(execution_id, catalog_id, decisions).await?;
            if !re_evaluate {
                return Ok(());
            }
        }

        warn!(execution_id, "Broker evaluation did not settle; leaving for the next trigger");
        Ok(())
    }

    /// Commit a decision batch. Returns true when a committed event is
    /// itself a completion that warrants immediate re-evaluation.
    async fn commit(
        &self,
        execution_id: i64,
        catalog_id: i64,
        decisions: Vec<BrokerDecision>,
    ) -> AppResult<bool> {
        let mut re_evaluate = false;
        let mut last_emitted: Option<i64> = None;

        for decision in decisions {
            match decision {
                BrokerDecision::EmitEvent(mut draft) => {
                    if draft.parent_event_id.is_none() {
                        draft.parent_event_id = last_emitted;
                    }
                    if matches!(draft.event_type, EventType::ActionCompleted) {
                        re_evaluate = true;
                    }
                    if let Some(event_id) = self
                        .events
                        .emit_draft(execution_id, catalog_id, &draft)
                        .await?
                    {
                        last_emitted = Some(event_id);
                    }
                }
                BrokerDecision::EnqueueJob(job) => {
                    let queued = queries::queue::enqueue(
                        &self.pool,
                        execution_id,
                        catalog_id,
                        &job.node_id,
                        &job.action,
                        &job.context,
                        job.priority,
                        job.max_attempts,
                        job.initial_status,
                        None,
                    )
                    .await?;

                    match queued {
                        Some(queue_id) => {
                            info!(execution_id, node_id = %job.node_id, queue_id, "Job enqueued")
                        }
                        None => debug!(node_id = %job.node_id, "Job already queued"),
                    }
                }
                BrokerDecision::StartChildExecution(draft) => {
                    self.start_child(execution_id, catalog_id, draft, last_emitted)
                        .await?;
                }
                BrokerDecision::FinalizeExecution { result } => {
                    self.finalize_execution(execution_id, catalog_id, result, last_emitted)
                        .await?;
                    return Ok(false);
                }
            }
        }

        Ok(re_evaluate)
    }

    /// Start a sub-playbook child execution for one loop iteration and
    /// record its `loop_iteration` event.
    async fn start_child(
        &self,
        execution_id: i64,
        catalog_id: i64,
        draft: ChildExecutionDraft,
        parent_event_id: Option<i64>,
    ) -> AppResult<()> {
        let iteration = &draft.iteration;

        let link = ChildLink {
            parent_execution_id: execution_id,
            parent_event_id,
            parent_step: draft.parent_step.clone(),
            iteration: Some(serde_json::json!({
                "node_id": iteration.node_id,
                "loop_id": iteration.loop_id,
                "loop_name": iteration.loop_name,
                "current_index": iteration.current_index,
                "current_item": iteration.current_item,
            })),
        };

        let child_execution_id = self
            .executions
            .execute_path(
                &draft.playbook_path,
                draft.playbook_version.as_deref(),
                Value::Object(draft.payload),
                Some(link),
            )
            .await?;

        let mut iteration = draft.iteration;
        let mut context = match iteration.context.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        context.insert(
            "child_execution_id".to_string(),
            Value::String(child_execution_id.to_string()),
        );
        iteration.context = Some(Value::Object(context));

        self.events
            .emit_draft(execution_id, catalog_id, &iteration)
            .await?;

        // A child whose entry point is control-flow-only needs its own
        // evaluation pass to get moving. Boxed: this recurses into the
        // evaluator.
        Box::pin(self.evaluate_execution(child_execution_id)).await?;

        Ok(())
    }

    async fn finalize_execution(
        &self,
        execution_id: i64,
        catalog_id: i64,
        result: Option<Value>,
        parent_event_id: Option<i64>,
    ) -> AppResult<()> {
        let mut draft =
            EventDraft::new(EventType::ExecutionComplete, EventStatus::Completed, "end");
        draft.node_id = Some(execution_id.to_string());
        draft.node_type = Some("playbook".to_string());
        draft.result = result;
        draft.parent_event_id = parent_event_id;

        if self
            .events
            .emit_draft(execution_id, catalog_id, &draft)
            .await?
            .is_some()
        {
            info!(execution_id, "Execution complete");
        }

        Ok(())
    }

    /// Dispatch one loop iteration (sync-mode continuation).
    pub async fn dispatch_iteration(
        &self,
        execution_id: i64,
        catalog_id: i64,
        step_name: &str,
        index: usize,
        item: &Value,
    ) -> AppResult<()> {
        let pb = self.load_playbook(catalog_id).await?;
        let step = pb
            .get_step(step_name)
            .ok_or_else(|| AppError::NotFound(format!("Step not found: {}", step_name)))?;
        let spec = LoopSpec::from_step(step)?;

        let workload = queries::workload::get_workload(&self.pool, execution_id).await?;
        let node_results = queries::event::get_all_node_results(&self.pool, execution_id).await?;
        let ctx = build_context(execution_id, workload.as_ref(), &node_results);

        let step_index = pb.step_index(step_name).unwrap_or(0);
        let iter_node_id = loops::iteration_node_id(execution_id, step_index, index);
        let loop_id = loops::loop_id(execution_id, step_name);

        if spec.is_sub_playbook() {
            let task = spec.task.as_ref().ok_or_else(|| {
                AppError::InvalidPlaybook(format!("Iterator step '{}' has no nested task", step_name))
            })?;

            let renderer = TemplateRenderer::new();
            let link = ChildLink {
                parent_execution_id: execution_id,
                parent_event_id: None,
                parent_step: step_name.to_string(),
                iteration: Some(serde_json::json!({
                    "node_id": iter_node_id,
                    "loop_id": loop_id,
                    "loop_name": step_name,
                    "current_index": index,
                    "current_item": item,
                })),
            };

            let child_execution_id = self
                .executions
                .execute_path(
                    task.get("path").and_then(|v| v.as_str()).unwrap_or_default(),
                    task.get("version").and_then(|v| v.as_str()),
                    Value::Object(loops::child_payload(&spec, item, &renderer, &ctx)),
                    Some(link),
                )
                .await?;
            Box::pin(self.evaluate_execution(child_execution_id)).await?;
            return Ok(());
        }

        let action = crate::playbook::normalize::normalize_task(spec.task.as_ref().ok_or_else(
            || AppError::InvalidPlaybook(format!("Iterator step '{}' has no nested task", step_name)),
        )?);
        let (max_attempts, _) = retry_policy(&action);

        let iteration_meta =
            loops::iteration_meta(&iter_node_id, &loop_id, step_name, index, item, &spec.element);

        let mut context = Map::new();
        context.insert(
            "workload".to_string(),
            ctx.get("workload")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
        );
        context.insert("step_name".to_string(), Value::String(step_name.to_string()));
        context.insert(spec.element.clone(), item.clone());
        context.insert(
            "_meta".to_string(),
            serde_json::json!({ "iteration": iteration_meta }),
        );

        queries::queue::enqueue(
            &self.pool,
            execution_id,
            catalog_id,
            &iter_node_id,
            &action,
            &Value::Object(context),
            5,
            max_attempts,
            "queued",
            None,
        )
        .await?;

        Ok(())
    }

    /// Fan-in check for a loop step: when every iteration has a recorded
    /// result, emit the aggregate events, mark the iterator guard entry
    /// done, and report `true` so the caller triggers re-evaluation. In
    /// sync mode the next pending iteration is dispatched instead.
    pub async fn check_loop_aggregation(
        &self,
        execution_id: i64,
        step_name: &str,
    ) -> AppResult<bool> {
        let iterations =
            queries::event::get_loop_iterations(&self.pool, execution_id, step_name).await?;
        let expected = iterations.len() as i64;
        if expected == 0 {
            return Ok(false);
        }

        if queries::event::has_loop_aggregate(&self.pool, execution_id, step_name).await? {
            return Ok(false);
        }

        let done =
            queries::event::count_iteration_results(&self.pool, execution_id, step_name).await?;

        let catalog_id = queries::event::get_catalog_id(&self.pool, execution_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("No events for execution {}", execution_id))
            })?;

        if done < expected {
            // Sync mode: dispatch the next pending iteration.
            let pb = self.load_playbook(catalog_id).await?;
            if let Some(step) = pb.get_step(step_name) {
                if let Ok(spec) = LoopSpec::from_step(step) {
                    if spec.mode == LoopMode::Sync {
                        let next_index = done as usize;
                        if let Some(event) =
                            iterations.iter().find(|e| e.current_index == Some(next_index as i32))
                        {
                            let item = event
                                .current_item
                                .clone()
                                .unwrap_or(Value::Null);
                            self.dispatch_iteration(
                                execution_id,
                                catalog_id,
                                step_name,
                                next_index,
                                &item,
                            )
                            .await?;
                        }
                    }
                }
            }
            return Ok(false);
        }

        // All iterations reported: collect results in index order and emit
        // the single synthetic completion for the parent step.
        let results: Vec<Value> =
            queries::event::get_iteration_results(&self.pool, execution_id, step_name)
                .await?
                .into_iter()
                .map(|(_, r)| crate::engine::context::flatten_result_envelope(&r))
                .collect();

        let node_id = format!("{}:{}", execution_id, step_name);
        let loop_id = loops::loop_id(execution_id, step_name);
        let envelope = loops::aggregate_envelope(&results);
        let context = loops::aggregate_context(expected as usize);

        for event_type in [EventType::ActionCompleted, EventType::Result, EventType::LoopCompleted]
        {
            let mut draft = EventDraft::new(event_type, EventStatus::Completed, step_name);
            draft.node_id = Some(node_id.clone());
            draft.node_type = Some("loop".to_string());
            draft.result = Some(envelope.clone());
            draft.context = Some(context.clone());
            draft.loop_id = Some(loop_id.clone());
            draft.loop_name = Some(step_name.to_string());
            self.events
                .emit_draft(execution_id, catalog_id, &draft)
                .await?;
        }

        queries::queue::mark_iterator_done(&self.pool, execution_id, &node_id).await?;

        info!(
            execution_id,
            step = %step_name,
            iterations = expected,
            "Loop aggregation complete"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn make_event(
        execution_id: i64,
        event_id: i64,
        event_type: &str,
        node_name: Option<&str>,
        status: &str,
        result: Option<Value>,
    ) -> Event {
        Event {
            execution_id,
            event_id,
            catalog_id: 99,
            parent_event_id: None,
            parent_execution_id: None,
            event_type: event_type.to_string(),
            node_id: node_name.map(|n| format!("{}:{}", execution_id, n)),
            node_name: node_name.map(String::from),
            node_type: Some("step".to_string()),
            status: status.to_string(),
            result,
            error: None,
            context: None,
            meta: None,
            current_index: None,
            current_item: None,
            loop_id: None,
            loop_name: None,
            worker_id: None,
            duration: None,
            created_at: Utc::now(),
        }
    }

    fn start_event(execution_id: i64) -> Event {
        let mut e = make_event(execution_id, 1, "execution_start", None, "STARTED", None);
        e.context = Some(json!({
            "path": "tests/linear",
            "version": "1",
            "workload": {}
        }));
        e
    }

    fn linear_playbook() -> Playbook {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: linear
workflow:
  - step: start
    next:
      - step: a
  - step: a
    type: python
    code: "def main(): return 1"
    next:
      - step: end
  - step: end
    result:
      v: "{{ a }}"
"#;
        parse_playbook(yaml).unwrap()
    }

    fn branching_playbook() -> Playbook {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: branching
workflow:
  - step: start
    next:
      - step: classify
  - step: classify
    type: python
    code: "def main(): return {'t': 25}"
    next:
      - step: hot
        when: "{{ result.t > 20 }}"
      - step: cold
        when: "{{ result.t <= 20 }}"
  - step: hot
    type: python
    code: "def main(): return 'hot'"
  - step: cold
    type: python
    code: "def main(): return 'cold'"
"#;
        parse_playbook(yaml).unwrap()
    }

    fn loop_playbook() -> Playbook {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: loops
workflow:
  - step: start
    next:
      - step: seed
  - step: seed
    type: python
    code: "def main(): return [1, 2, 3]"
    next:
      - step: f
  - step: f
    type: iterator
    collection: [1, 2, 3]
    element: x
    mode: async
    task:
      type: python
      code: "def main(x): return x * 10"
    next:
      - step: end
  - step: end
"#;
        parse_playbook(yaml).unwrap()
    }

    fn decisions_for(
        pb: &Playbook,
        events: &[Event],
        results: &[(String, Value)],
    ) -> Vec<BrokerDecision> {
        let snapshot = ExecutionSnapshot::new(10, 99, events);
        let ctx = build_context(10, Some(&json!({})), results);
        evaluate(pb, &snapshot, &ctx, &TemplateRenderer::new())
    }

    fn emitted_types(decisions: &[BrokerDecision]) -> Vec<(String, String)> {
        decisions
            .iter()
            .filter_map(|d| match d {
                BrokerDecision::EmitEvent(draft) => Some((
                    draft.event_type.as_str().to_string(),
                    draft.node_name.clone().unwrap_or_default(),
                )),
                _ => None,
            })
            .collect()
    }

    fn enqueued_nodes(decisions: &[BrokerDecision]) -> Vec<String> {
        decisions
            .iter()
            .filter_map(|d| match d {
                BrokerDecision::EnqueueJob(job) => Some(job.node_id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_completed_step_emits_step_completed_and_dispatches_next() {
        let pb = linear_playbook();
        let events = vec![
            start_event(10),
            make_event(10, 2, "step_started", Some("a"), "RUNNING", None),
            make_event(
                10,
                3,
                "action_completed",
                Some("a"),
                "COMPLETED",
                Some(json!(1)),
            ),
        ];
        let results = vec![("a".to_string(), json!(1))];

        let decisions = decisions_for(&pb, &events, &results);

        let types = emitted_types(&decisions);
        assert!(types.contains(&("step_completed".to_string(), "a".to_string())));

        // a -> end with every actionable step complete: finalize
        let finalize = decisions.iter().any(|d| {
            matches!(d, BrokerDecision::FinalizeExecution { result: Some(r) } if r["v"] == json!(1))
        });
        assert!(finalize, "expected finalization with rendered end result");
    }

    #[test]
    fn test_broker_is_idempotent_after_step_completed() {
        let pb = linear_playbook();
        let events = vec![
            start_event(10),
            make_event(10, 2, "step_started", Some("a"), "RUNNING", None),
            make_event(
                10,
                3,
                "action_completed",
                Some("a"),
                "COMPLETED",
                Some(json!(1)),
            ),
            make_event(10, 4, "step_completed", Some("a"), "COMPLETED", None),
        ];
        let results = vec![("a".to_string(), json!(1))];

        let decisions = decisions_for(&pb, &events, &results);
        assert!(
            decisions.is_empty(),
            "no newly completed steps means no decisions"
        );
    }

    #[test]
    fn test_conditional_branching_enqueues_only_matching_target() {
        let pb = branching_playbook();
        let events = vec![
            start_event(10),
            make_event(10, 2, "step_started", Some("classify"), "RUNNING", None),
            make_event(
                10,
                3,
                "action_completed",
                Some("classify"),
                "COMPLETED",
                Some(json!({"t": 25})),
            ),
        ];
        let results = vec![("classify".to_string(), json!({"t": 25}))];

        let decisions = decisions_for(&pb, &events, &results);
        let nodes = enqueued_nodes(&decisions);

        assert_eq!(nodes, vec!["10:hot".to_string()]);

        let types = emitted_types(&decisions);
        assert!(types.contains(&("step_started".to_string(), "hot".to_string())));
        assert!(!types.contains(&("step_started".to_string(), "cold".to_string())));
    }

    #[test]
    fn test_loop_fan_out_emits_iterations_and_jobs() {
        let pb = loop_playbook();
        let events = vec![
            start_event(10),
            make_event(10, 2, "step_started", Some("seed"), "RUNNING", None),
            make_event(
                10,
                3,
                "action_completed",
                Some("seed"),
                "COMPLETED",
                Some(json!([1, 2, 3])),
            ),
        ];
        let results = vec![("seed".to_string(), json!([1, 2, 3]))];

        let decisions = decisions_for(&pb, &events, &results);

        let iterations: Vec<_> = decisions
            .iter()
            .filter_map(|d| match d {
                BrokerDecision::EmitEvent(draft)
                    if draft.event_type == EventType::LoopIteration =>
                {
                    Some((draft.current_index, draft.current_item.clone()))
                }
                _ => None,
            })
            .collect();

        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[0], (Some(0), Some(json!(1))));
        assert_eq!(iterations[2], (Some(2), Some(json!(3))));

        // Guard entry + one job per iteration (async mode)
        let nodes = enqueued_nodes(&decisions);
        assert_eq!(nodes.len(), 4);
        assert!(nodes.contains(&"10:f".to_string()));
        assert!(nodes.contains(&"10-step-2-iter-0".to_string()));
        assert!(nodes.contains(&"10-step-2-iter-2".to_string()));

        // The guard entry is held in-flight, not leased to workers
        let guard = decisions.iter().find_map(|d| match d {
            BrokerDecision::EnqueueJob(job) if job.node_id == "10:f" => Some(job),
            _ => None,
        });
        assert_eq!(guard.unwrap().initial_status, "leased");
    }

    #[test]
    fn test_empty_collection_aggregates_immediately() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: empty-loop
workflow:
  - step: start
    next:
      - step: seed
  - step: seed
    type: python
    code: "def main(): return []"
    next:
      - step: f
  - step: f
    type: iterator
    collection: []
    element: x
    task:
      type: python
      code: "def main(x): return x"
    next:
      - step: end
  - step: end
"#;
        let pb = parse_playbook(yaml).unwrap();
        let events = vec![
            start_event(10),
            make_event(
                10,
                2,
                "action_completed",
                Some("seed"),
                "COMPLETED",
                Some(json!([])),
            ),
        ];
        let results = vec![("seed".to_string(), json!([]))];

        let decisions = decisions_for(&pb, &events, &results);

        let types = emitted_types(&decisions);
        assert!(!types.iter().any(|(t, _)| t == "loop_iteration"));
        assert!(types.contains(&("action_completed".to_string(), "f".to_string())));
        assert!(types.contains(&("loop_completed".to_string(), "f".to_string())));

        let aggregate = decisions.iter().find_map(|d| match d {
            BrokerDecision::EmitEvent(draft)
                if draft.event_type == EventType::ActionCompleted =>
            {
                draft.result.clone()
            }
            _ => None,
        });
        let aggregate = aggregate.unwrap();
        assert_eq!(aggregate["results"], json!([]));
        assert_eq!(aggregate["count"], 0);
    }

    #[test]
    fn test_iteration_completions_do_not_complete_the_step() {
        let pb = loop_playbook();
        let mut iter_done = make_event(
            10,
            5,
            "action_completed",
            Some("f"),
            "COMPLETED",
            Some(json!(10)),
        );
        iter_done.node_id = Some("10-step-2-iter-0".to_string());

        let events = vec![
            start_event(10),
            make_event(10, 2, "action_completed", Some("seed"), "COMPLETED", Some(json!([1]))),
            make_event(10, 3, "step_completed", Some("seed"), "COMPLETED", None),
            make_event(10, 4, "step_started", Some("f"), "RUNNING", None),
            iter_done,
        ];
        let results = vec![("seed".to_string(), json!([1]))];

        let decisions = decisions_for(&pb, &events, &results);
        let types = emitted_types(&decisions);
        assert!(
            !types.contains(&("step_completed".to_string(), "f".to_string())),
            "iteration results must not complete the iterator step"
        );
    }

    #[test]
    fn test_empty_next_stalls_cleanly() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: stall
workflow:
  - step: start
    next:
      - step: a
  - step: a
    type: python
    code: "def main(): return 1"
  - step: end
"#;
        let pb = parse_playbook(yaml).unwrap();
        let events = vec![
            start_event(10),
            make_event(
                10,
                2,
                "action_completed",
                Some("a"),
                "COMPLETED",
                Some(json!(1)),
            ),
        ];
        let results = vec![("a".to_string(), json!(1))];

        let decisions = decisions_for(&pb, &events, &results);

        // step_completed for a, nothing else: no jobs, no finalization
        let types = emitted_types(&decisions);
        assert_eq!(types, vec![("step_completed".to_string(), "a".to_string())]);
        assert!(enqueued_nodes(&decisions).is_empty());
        assert!(!decisions
            .iter()
            .any(|d| matches!(d, BrokerDecision::FinalizeExecution { .. })));
    }

    #[test]
    fn test_end_waits_for_remaining_actionable_steps() {
        let yaml = r#"
apiVersion: noetl.io/v1
kind: Playbook
metadata:
  name: join
workflow:
  - step: start
    next:
      - step: a
      - step: b
  - step: a
    type: python
    code: "def main(): return 'a'"
    next:
      - step: end
  - step: b
    type: python
    code: "def main(): return 'b'"
    next:
      - step: end
  - step: end
"#;
        let pb = parse_playbook(yaml).unwrap();

        // Only a has completed; b is still outstanding
        let events = vec![
            start_event(10),
            make_event(10, 2, "step_started", Some("a"), "RUNNING", None),
            make_event(10, 3, "step_started", Some("b"), "RUNNING", None),
            make_event(
                10,
                4,
                "action_completed",
                Some("a"),
                "COMPLETED",
                Some(json!("a")),
            ),
        ];
        let results = vec![("a".to_string(), json!("a"))];

        let decisions = decisions_for(&pb, &events, &results);
        assert!(!decisions
            .iter()
            .any(|d| matches!(d, BrokerDecision::FinalizeExecution { .. })));

        // Both completed: finalize fires
        let mut events = events;
        events.push(make_event(10, 5, "step_completed", Some("a"), "COMPLETED", None));
        events.push(make_event(
            10,
            6,
            "action_completed",
            Some("b"),
            "COMPLETED",
            Some(json!("b")),
        ));
        let results = vec![
            ("a".to_string(), json!("a")),
            ("b".to_string(), json!("b")),
        ];

        let decisions = decisions_for(&pb, &events, &results);
        assert!(decisions
            .iter()
            .any(|d| matches!(d, BrokerDecision::FinalizeExecution { .. })));
    }

    #[test]
    fn test_snapshot_newly_completed_ignores_iterations() {
        let mut iter_event = make_event(
            10,
            3,
            "action_completed",
            Some("f"),
            "COMPLETED",
            Some(json!(10)),
        );
        iter_event.node_id = Some("10-step-2-iter-1".to_string());

        let events = vec![start_event(10), iter_event];
        let snapshot = ExecutionSnapshot::new(10, 99, &events);
        assert!(snapshot.newly_completed_steps().is_empty());
    }

    #[test]
    fn test_snapshot_terminal_detection() {
        let events = vec![
            start_event(10),
            make_event(10, 2, "execution_complete", None, "COMPLETED", None),
        ];
        let snapshot = ExecutionSnapshot::new(10, 99, &events);
        assert!(snapshot.is_terminal());
    }
}
