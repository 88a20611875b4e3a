//! The dispatch loop: spawns ready tasks up to a concurrency limit,
//! routes each to a worker, runs the resulting completion through the
//! resilience layer, and folds the outcome back into the queue --
//! mirroring the spawn/semaphore/mpsc shape used for agent dispatch
//! elsewhere in this codebase, generalized from a DAG-of-database-rows
//! to an in-memory wave-scheduled queue.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::blackboard::Blackboard;
use crate::cancel::{CancellationSource, CancellationToken, ProgressAwareTimeout, ProgressEvent};
use crate::config::SwarmConfig;
use crate::economics::{canonical_fingerprint, sha256_fingerprint, BudgetDecision, EconomicsManager, Phase};
use crate::events::{Event, EventBus, ResilienceStrategy};
use crate::health::ModelHealthTracker;
use crate::provider::{ChatOptions, Message, Provider};
use crate::queue::{Decomposition, QueueError, TaskQueue};
use crate::resilience::ResilienceEngine;
use crate::types::{FailureMode, ModelId, Subtask, SubtaskId, SubtaskType, WorkerSpec};
use crate::workers::WorkerPool;

#[derive(Debug, Deserialize)]
struct JudgeChild {
    description: String,
    #[serde(rename = "type")]
    task_type: SubtaskType,
    #[serde(default = "default_child_complexity")]
    complexity: u8,
}

fn default_child_complexity() -> u8 {
    5
}

/// Pull the first balanced `[...]` substring out of a judge response, so
/// a model that wraps its answer in prose ("Here is the split: [...]")
/// still parses.
fn extract_json_array(content: &str) -> Option<&str> {
    let start = content.find('[')?;
    let end = content.rfind(']')?;
    (end >= start).then(|| &content[start..=end])
}

/// Ask the judge provider whether `subtask` should be split before
/// dispatch. Returns `None` when the judge declines to split, fails to
/// respond, or returns something unparseable -- auto-split is advisory,
/// never a hard requirement for dispatch to proceed.
async fn judge_split(judge: &dyn Provider, subtask: &Subtask, max_children: usize) -> Option<Vec<Subtask>> {
    let prompt = format!(
        "Decide whether this subtask should be split into smaller independent pieces before execution.\n\n\
         Task: {}\nType: {}\nComplexity: {}/10\nDescription: {}\n\n\
         If it should be split, respond with a JSON array of child tasks, each an object with \
         \"description\", \"type\", and \"complexity\" fields, using the type vocabulary \
         research/implement/test/review/document/refactor/verify. If it should not be split, \
         respond with exactly: []",
        subtask.id, subtask.task_type, subtask.complexity, subtask.description
    );
    let messages = [Message::user(prompt)];
    let response = judge.chat(&messages, &ChatOptions::default()).await.ok()?;
    let raw = extract_json_array(&response.content)?;
    let parsed: Vec<JudgeChild> = serde_json::from_str(raw).ok()?;
    if parsed.is_empty() {
        return None;
    }
    let children: Vec<Subtask> = parsed
        .into_iter()
        .take(max_children.max(1))
        .enumerate()
        .map(|(i, child)| {
            Subtask::new(format!("{}-{}", subtask.id, i + 1), child.description, child.task_type)
                .with_complexity(child.complexity.max(3))
                .depends_on(subtask.dependencies.iter().cloned())
        })
        .collect();
    Some(children)
}

/// Offer every subtask at or above the configured complexity floor (and
/// of a splittable type) to the judge provider before the decomposition
/// is loaded into the queue. A subtask the judge splits is replaced by
/// its children; every other subtask that depended on it now depends on
/// all of them instead. A no-op when auto-split is disabled or no judge
/// provider was supplied.
async fn auto_split_oversized(
    mut decomposition: Decomposition,
    config: &SwarmConfig,
    judge_provider: Option<&Arc<dyn Provider>>,
) -> Decomposition {
    let Some(judge) = judge_provider else { return decomposition };
    if !config.auto_split_enabled {
        return decomposition;
    }

    let mut kept = Vec::new();
    let mut replaced: HashMap<SubtaskId, Vec<SubtaskId>> = HashMap::new();

    for subtask in decomposition.subtasks.drain(..) {
        let eligible =
            subtask.complexity >= config.auto_split_complexity_floor && config.auto_split_splittable_types.contains(&subtask.task_type);
        if !eligible {
            kept.push(subtask);
            continue;
        }
        match judge_split(judge.as_ref(), &subtask, config.auto_split_max_subtasks).await {
            Some(children) => {
                replaced.insert(subtask.id.clone(), children.iter().map(|c| c.id.clone()).collect());
                kept.extend(children);
            }
            None => kept.push(subtask),
        }
    }

    for subtask in &mut kept {
        if subtask.dependencies.iter().any(|d| replaced.contains_key(d)) {
            let mut rewired: BTreeSet<SubtaskId> = BTreeSet::new();
            for dep in &subtask.dependencies {
                match replaced.get(dep) {
                    Some(children) => rewired.extend(children.iter().cloned()),
                    None => {
                        rewired.insert(dep.clone());
                    }
                }
            }
            subtask.dependencies = rewired;
        }
    }

    decomposition.subtasks = kept;
    decomposition
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwarmOutcome {
    Completed,
    BudgetExceeded,
    Interrupted,
}

struct DispatchDone {
    task_id: SubtaskId,
    worker: WorkerSpec,
    outcome: Result<DispatchSuccess>,
}

struct DispatchSuccess {
    content: String,
    tool_calls: i64,
    cumulative_tokens: u64,
    latency: Duration,
}

pub struct SwarmOrchestrator {
    config: SwarmConfig,
    queue: TaskQueue,
    workers: Arc<Mutex<WorkerPool>>,
    health: Arc<Mutex<ModelHealthTracker>>,
    economics: Arc<Mutex<EconomicsManager>>,
    blackboard: Arc<Mutex<Blackboard>>,
    resilience: Arc<ResilienceEngine>,
    providers: Arc<HashMap<ModelId, Arc<dyn Provider>>>,
    events: EventBus,
    cancel: CancellationSource,
    max_concurrency: usize,
    /// The model each task most recently failed against, consulted by
    /// `enable_model_failover` so the next dispatch steers away from it
    /// rather than immediately retrying the same backend.
    last_failed_model: Arc<Mutex<HashMap<SubtaskId, ModelId>>>,
}

impl SwarmOrchestrator {
    pub async fn new(
        config: SwarmConfig,
        decomposition: Decomposition,
        workers: Vec<WorkerSpec>,
        providers: HashMap<ModelId, Arc<dyn Provider>>,
        judge_provider: Option<Arc<dyn Provider>>,
        events: EventBus,
        max_concurrency: usize,
    ) -> Result<Self, QueueError> {
        let decomposition = auto_split_oversized(decomposition, &config, judge_provider.as_ref()).await;
        let queue = TaskQueue::load_from_decomposition(decomposition, config.queue_config())?;
        let events_for_economics = events.clone();
        let economics = EconomicsManager::new(
            config.budget_config(),
            Box::new(move |event| events_for_economics.emit(event)),
        );

        Ok(Self {
            resilience: Arc::new(ResilienceEngine::new(config.resilience_config())),
            health: Arc::new(Mutex::new(ModelHealthTracker::new(config.health_thresholds()))),
            workers: Arc::new(Mutex::new(WorkerPool::new(workers))),
            economics: Arc::new(Mutex::new(economics)),
            blackboard: Arc::new(Mutex::new(Blackboard::new())),
            providers: Arc::new(providers),
            config,
            queue,
            events,
            cancel: CancellationSource::new(),
            max_concurrency,
            last_failed_model: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.token()
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    pub async fn run(&mut self) -> Result<SwarmOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<DispatchDone>(self.max_concurrency.max(1) * 2);
        let mut in_flight: usize = 0;

        self.events.emit(Event::WaveStart { wave: self.queue.current_wave() });

        loop {
            if self.cancel.is_cancelled() {
                let drain_deadline = Instant::now() + Duration::from_secs(10);
                while in_flight > 0 && Instant::now() < drain_deadline {
                    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            self.handle_dispatch_done(done).await?;
                        }
                        _ => break,
                    }
                }
                return Ok(SwarmOutcome::Interrupted);
            }

            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                self.handle_dispatch_done(done).await?;
            }

            if self.queue.is_complete() {
                self.events.emit(Event::SwarmComplete);
                return Ok(SwarmOutcome::Completed);
            }

            {
                let economics = self.economics.lock().await;
                if economics.percent_used() >= 1.0 && in_flight == 0 {
                    drop(economics);
                    let ready = self.queue.get_ready_tasks();
                    if ready.is_empty() {
                        self.events.emit(Event::SwarmComplete);
                        return Ok(SwarmOutcome::BudgetExceeded);
                    }
                }
            }

            if self.queue.all_terminal_in_wave(self.queue.current_wave()) && in_flight == 0 {
                let completed_wave = self.queue.current_wave();
                if completed_wave + 1 < self.queue.total_waves() || !self.queue.get_ready_tasks().is_empty() {
                    self.events.emit(Event::WaveComplete { wave: completed_wave });
                    self.queue.advance_wave();
                    self.events.emit(Event::WaveStart { wave: self.queue.current_wave() });
                    continue;
                }
            }

            let ready_ids: Vec<SubtaskId> = self.queue.get_ready_tasks().iter().map(|t| t.subtask.id.clone()).collect();
            let spawned_any = !ready_ids.is_empty();
            let mut dispatched_this_round = false;

            for task_id in ready_ids {
                let (near_completion, global_doom_loop) = {
                    let economics = self.economics.lock().await;
                    let near_completion = economics.phase_of(&task_id) == Phase::Verifying;
                    drop(economics);
                    let board = self.blackboard.lock().await;
                    (near_completion, board.is_global_doom_loop(&task_id))
                };
                let decision = {
                    let mut economics = self.economics.lock().await;
                    economics.evaluate_budget(&task_id, near_completion, global_doom_loop)
                };
                match decision {
                    BudgetDecision::Deny(reason) => {
                        tracing::warn!(task_id = %task_id, reason, "dispatch denied by budget/loop guard");
                        continue;
                    }
                    BudgetDecision::ForceComplete(reason) => {
                        tracing::warn!(task_id = %task_id, reason, "forcing swarm completion under budget pressure");
                        self.events.emit(Event::BudgetExceeded { reason: reason.to_string() });
                        return Ok(SwarmOutcome::BudgetExceeded);
                    }
                    BudgetDecision::Throttle(reason) | BudgetDecision::Warn(reason) => {
                        tracing::info!(task_id = %task_id, reason, "budget pressure noted, continuing dispatch");
                    }
                    BudgetDecision::GrantExtension { additional_tokens } => {
                        tracing::info!(task_id = %task_id, additional_tokens, "extension granted under budget pressure");
                    }
                    BudgetDecision::Continue => {}
                }

                // Stagger successive dispatches in a round so a burst of
                // concurrent calls against the same provider doesn't
                // immediately trip its rate limiter.
                if dispatched_this_round && self.config.dispatch_stagger_ms > 0 {
                    let cancel_token = self.cancel.token();
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.config.dispatch_stagger_ms)) => {}
                        _ = cancel_token.cancelled() => break,
                    }
                }

                let permit = semaphore.clone().acquire_owned().await.context("semaphore closed")?;
                let task = self.queue.task(&task_id).context("ready task vanished from queue")?.subtask.clone();

                let avoid_model = if self.config.enable_model_failover {
                    self.last_failed_model.lock().await.get(&task_id).cloned()
                } else {
                    None
                };

                let worker = {
                    let mut workers = self.workers.lock().await;
                    let mut health = self.health.lock().await;
                    workers.select_worker(task.task_type, &mut health, Instant::now(), avoid_model.as_ref())
                };

                let worker = match worker {
                    Ok(w) => w,
                    Err(_) => {
                        drop(permit);
                        self.queue.fail_ready_task(&task_id, FailureMode::Error)?;
                        let attempts = self.queue.task(&task_id).map(|t| t.attempts).unwrap_or(0);
                        self.events.emit(Event::TaskAttempt { task_id: task_id.clone(), attempt: attempts });
                        self.events.emit(Event::TaskFailed { task_id: task_id.clone(), failure_mode: FailureMode::Error });
                        self.queue.trigger_cascade_skip(&task_id)?;
                        continue;
                    }
                };

                self.last_failed_model.lock().await.remove(&task_id);
                self.queue.mark_dispatched(&task_id, worker.model.clone())?;
                self.events.emit(Event::TaskDispatched {
                    task_id: task_id.clone(),
                    model: worker.model.clone(),
                    wave: self.queue.current_wave(),
                });

                let provider = self.providers.get(&worker.model).cloned();
                let tx = tx.clone();
                let cancel_token = self.cancel.token();
                let economics = self.economics.clone();
                let blackboard = self.blackboard.clone();
                let events = self.events.clone();
                let worker_for_task = worker.clone();
                let task_for_spawn = task.clone();

                let max_duration = Duration::from_secs(self.config.max_task_duration_secs);
                let idle_duration = Duration::from_secs(self.config.max_idle_duration_secs);

                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = run_one_dispatch(
                        &task_for_spawn,
                        provider,
                        &cancel_token,
                        &economics,
                        &blackboard,
                        &events,
                        max_duration,
                        idle_duration,
                    )
                    .await;
                    let _ = tx.send(DispatchDone { task_id: task_for_spawn.id.clone(), worker: worker_for_task, outcome }).await;
                });

                in_flight += 1;
                dispatched_this_round = true;
            }

            if in_flight > 0 {
                let cancel_token = self.cancel.token();
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight -= 1;
                            self.handle_dispatch_done(done).await?;
                        }
                    }
                    _ = cancel_token.cancelled() => continue,
                }
            } else if !spawned_any {
                let cancel_token = self.cancel.token();
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = cancel_token.cancelled() => continue,
                }
            }
        }
    }

    async fn handle_dispatch_done(&mut self, done: DispatchDone) -> Result<()> {
        let attempts = self.queue.task(&done.task_id).map(|t| t.attempts).unwrap_or(1);
        self.events.emit(Event::TaskAttempt { task_id: done.task_id.clone(), attempt: attempts });

        let mut health = self.health.lock().await;
        match done.outcome {
            Ok(success) => {
                health.record_success(&done.worker.model, success.latency);
                drop(health);

                let mut economics = self.economics.lock().await;
                economics.record_token_usage(&done.task_id, success.cumulative_tokens);
                economics.record_iteration();
                drop(economics);

                let task = self.queue.task(&done.task_id).context("completed task vanished from queue")?.subtask.clone();

                let outcome = self.resilience.decide(
                    &task,
                    &success.content,
                    success.tool_calls,
                    success.tool_calls > 0,
                    attempts,
                    self.config.max_dispatches_per_task,
                );

                self.events.emit(Event::TaskResilience {
                    task_id: done.task_id.clone(),
                    strategy: outcome.strategy,
                    succeeded: outcome.succeeded,
                    reason: outcome.reason.clone(),
                    artifacts_found: outcome.artifacts_found,
                    tool_calls: outcome.tool_calls,
                });

                if outcome.retry {
                    let mut health = self.health.lock().await;
                    health.record_hollow(&done.worker.model);
                    drop(health);
                    self.queue.mark_failed(&done.task_id, FailureMode::Hollow)?;
                    self.events.emit(Event::TaskFailed { task_id: done.task_id.clone(), failure_mode: FailureMode::Hollow });
                    self.queue.requeue(&done.task_id)?;
                    return Ok(());
                }

                match outcome.strategy {
                    ResilienceStrategy::MicroDecompose => {
                        let mut health = self.health.lock().await;
                        health.record_hollow(&done.worker.model);
                        drop(health);
                        self.queue.mark_failed(&done.task_id, FailureMode::Hollow)?;
                        self.events.emit(Event::TaskFailed { task_id: done.task_id.clone(), failure_mode: FailureMode::Hollow });
                        self.queue.trigger_cascade_skip(&done.task_id)?;
                        // TODO: outcome.replacement_subtasks isn't inserted anywhere --
                        // TaskQueue has no API to admit tasks past initial load.
                    }
                    _ if outcome.succeeded => {
                        self.queue.mark_completed(&done.task_id)?;
                        self.events.emit(Event::TaskCompleted { task_id: done.task_id.clone() });
                    }
                    _ => {
                        let mut health = self.health.lock().await;
                        health.record_hollow(&done.worker.model);
                        drop(health);
                        self.queue.mark_failed(&done.task_id, FailureMode::Hollow)?;
                        self.events.emit(Event::TaskFailed { task_id: done.task_id.clone(), failure_mode: FailureMode::Hollow });
                        self.queue.trigger_cascade_skip(&done.task_id)?;
                    }
                }
            }
            Err(err) => {
                let failure_mode = classify_failure(&err);
                health.record_failure(&done.worker.model);
                if failure_mode == FailureMode::RateLimit {
                    health.record_rate_limit(&done.worker.model, Instant::now());
                }
                drop(health);

                let can_retry = self.queue.mark_failed(&done.task_id, failure_mode)?;
                self.events.emit(Event::TaskFailed { task_id: done.task_id.clone(), failure_mode });
                if can_retry {
                    if self.config.enable_model_failover {
                        self.last_failed_model.lock().await.insert(done.task_id.clone(), done.worker.model.clone());
                    }
                    self.queue.requeue(&done.task_id)?;
                } else {
                    self.queue.trigger_cascade_skip(&done.task_id)?;
                }
            }
        }
        Ok(())
    }
}

fn classify_failure(err: &anyhow::Error) -> FailureMode {
    let message = err.to_string().to_lowercase();
    if message.contains("rate limit") || message.contains("429") {
        FailureMode::RateLimit
    } else if message.contains("timeout") || message.contains("timed out") {
        FailureMode::Timeout
    } else {
        FailureMode::Error
    }
}

async fn run_one_dispatch(
    task: &Subtask,
    provider: Option<Arc<dyn Provider>>,
    cancel_token: &CancellationToken,
    economics: &Arc<Mutex<EconomicsManager>>,
    blackboard: &Arc<Mutex<Blackboard>>,
    events: &EventBus,
    max_duration: Duration,
    idle_duration: Duration,
) -> Result<DispatchSuccess> {
    let provider = provider.context("no provider registered for the selected model")?;

    {
        let mut economics = economics.lock().await;
        let _ = economics.transition_phase(&task.id, Phase::Acting);
        economics.record_tool_call(&task.id);
    }

    let findings = {
        let board = blackboard.lock().await;
        board
            .findings_excluding(&task.id)
            .iter()
            .map(|f| f.content.clone())
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut messages = vec![Message::system(format!(
        "You are completing a subtask as part of a larger swarm. Shared findings so far:\n{findings}"
    ))];
    messages.push(Message::user(task.description.clone()));

    let mut timeout = ProgressAwareTimeout::new(max_duration, idle_duration);
    timeout.record_progress(ProgressEvent::LlmStart);

    let start = Instant::now();
    let chat_options = ChatOptions::default();
    let chat_future = provider.chat(&messages, &chat_options);
    tokio::pin!(chat_future);
    let response = tokio::select! {
        biased;
        _ = cancel_token.cancelled() => anyhow::bail!("dispatch cancelled: {:?}", cancel_token.reason()),
        reason = timeout.wait_until_next_deadline() => anyhow::bail!("dispatch timed out: {}", timeout.reason_message(reason)),
        result = &mut chat_future => result?,
    };
    timeout.record_progress(ProgressEvent::LlmComplete);
    let latency = start.elapsed();

    {
        let mut economics = economics.lock().await;
        let action_fingerprint = serde_json::json!({
            "task": task.id.to_string(),
            "tool_calls": response.tool_calls.iter().map(|t| &t.name).collect::<Vec<_>>(),
        });
        economics.record_action(&task.id, &action_fingerprint);

        let fingerprint_hash = sha256_fingerprint(&canonical_fingerprint(&action_fingerprint));
        let mut board = blackboard.lock().await;
        if board.record_global_fingerprint(fingerprint_hash.clone(), task.id.clone()) {
            events.emit(Event::DoomLoopDetected { task_id: task.id.clone(), fingerprint: fingerprint_hash, global: true });
        }
    }

    Ok(DispatchSuccess {
        content: response.content,
        tool_calls: response.tool_calls.len() as i64,
        cumulative_tokens: response.usage.cumulative_total_tokens,
        latency,
    })
}
