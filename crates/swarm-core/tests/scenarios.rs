//! End-to-end scenario tests, one per seed scenario: a three-wave
//! dependency chain, partial-dependency leniency, idle/max timeout
//! behavior, graceful wrapup, file-conflict serialization, and hollow
//! detection driving a full dispatch through [`SwarmOrchestrator`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use swarm_core::cancel::{CancellationSource, GracefulPhase, GracefulTimeout, ProgressAwareTimeout, ProgressEvent};
use swarm_core::config::SwarmConfig;
use swarm_core::events::{Event, ResilienceStrategy};
use swarm_core::queue::{Conflict, ConflictStrategy, QueueConfig, TaskQueue};
use swarm_core::types::{FailureMode, ModelId, SubtaskId, SubtaskType};
use swarm_core::{SwarmOrchestrator, SwarmOutcome};

use swarm_test_utils::{decomposition, genuine_completion, hollow_completion, subtask, worker, ScriptedProvider};

// S1. Three-wave dependency chain.
#[test]
fn s1_three_wave_dependency_chain() {
    let plan = decomposition(vec![
        subtask("a", SubtaskType::Implement, 5, &[]),
        subtask("b", SubtaskType::Implement, 5, &["a"]),
        subtask("c", SubtaskType::Implement, 5, &["b"]),
    ]);
    let mut queue = TaskQueue::load_from_decomposition(plan, QueueConfig::default()).unwrap();

    assert_eq!(queue.total_waves(), 3);
    let ready: Vec<_> = queue.get_ready_tasks().iter().map(|t| t.subtask.id.clone()).collect();
    assert_eq!(ready, vec![SubtaskId::new("a")]);

    queue.mark_dispatched(&SubtaskId::new("a"), ModelId::new("m")).unwrap();
    queue.mark_completed(&SubtaskId::new("a")).unwrap();
    queue.advance_wave();
    let ready: Vec<_> = queue.get_ready_tasks().iter().map(|t| t.subtask.id.clone()).collect();
    assert_eq!(ready, vec![SubtaskId::new("b")]);

    queue.mark_dispatched(&SubtaskId::new("b"), ModelId::new("m")).unwrap();
    queue.mark_completed(&SubtaskId::new("b")).unwrap();
    queue.advance_wave();
    let ready: Vec<_> = queue.get_ready_tasks().iter().map(|t| t.subtask.id.clone()).collect();
    assert_eq!(ready, vec![SubtaskId::new("c")]);
}

// S2. Partial dependency, lenient mode.
#[test]
fn s2_partial_dependency_lenient_mode() {
    let plan = decomposition(vec![
        subtask("a", SubtaskType::Implement, 5, &[]),
        subtask("b", SubtaskType::Implement, 5, &[]),
        subtask("merge", SubtaskType::Implement, 5, &["a", "b"]),
    ]);
    // max_dispatches_per_task=1 so a single failure exhausts b's retries
    // and it becomes terminal in this same wave, without a requeue loop.
    let config = QueueConfig { max_dispatches_per_task: 1, partial_dependency_threshold: 0.5, ..QueueConfig::default() };
    let mut queue = TaskQueue::load_from_decomposition(plan, config).unwrap();

    queue.mark_dispatched(&SubtaskId::new("a"), ModelId::new("m")).unwrap();
    queue.mark_completed(&SubtaskId::new("a")).unwrap();
    queue.mark_dispatched(&SubtaskId::new("b"), ModelId::new("m")).unwrap();
    let can_retry = queue.mark_failed(&SubtaskId::new("b"), FailureMode::Timeout).unwrap();
    assert!(!can_retry, "b's single attempt should exhaust its retries");

    queue.advance_wave();
    let merge = queue.task(&SubtaskId::new("merge")).unwrap();
    assert_eq!(merge.status, swarm_core::types::TaskStatus::Ready);
    let ctx = merge.partial_context.as_ref().expect("merge should carry partial context");
    assert_eq!(ctx.succeeded, vec![SubtaskId::new("a")]);
    assert_eq!(ctx.failed, vec![(SubtaskId::new("b"), FailureMode::Timeout)]);
}

// S3. Idle timeout with correct event stream.
#[tokio::test(start_paused = true)]
async fn s3_idle_timeout_fires_independent_of_non_progress_events() {
    let mut timeout = ProgressAwareTimeout::new(Duration::from_secs(300), Duration::from_secs(10));
    timeout.record_progress(ProgressEvent::ToolComplete);
    tokio::time::advance(Duration::from_secs(11)).await;
    let reason = timeout.check(Instant::now());
    assert_eq!(reason, Some(swarm_core::cancel::TimeoutReason::IdleExceeded));

    // Firing a non-progress "event" (here: just not calling record_progress)
    // every 5s for 40s does not push the idle deadline out; it is still
    // exceeded well before 40s elapses.
    let mut timeout2 = ProgressAwareTimeout::new(Duration::from_secs(300), Duration::from_secs(10));
    for _ in 0..8 {
        tokio::time::advance(Duration::from_secs(5)).await;
    }
    assert_eq!(timeout2.check(Instant::now()), Some(swarm_core::cancel::TimeoutReason::IdleExceeded));
}

// S4. Graceful wrapup fires then hard-cancels.
#[tokio::test(start_paused = true)]
async fn s4_graceful_wrapup_then_hard_cancel() {
    let mut timeout = GracefulTimeout::new(Duration::from_secs(60), Duration::from_secs(10), Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(timeout.poll(Instant::now()), GracefulPhase::WrapUp);

    // Progress reported during wrapup does not extend the deadline.
    timeout.record_progress(ProgressEvent::ToolStart);
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(timeout.poll(Instant::now()), GracefulPhase::WrapUp);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(timeout.poll(Instant::now()), GracefulPhase::Expired);
}

// S5. File-conflict serialization.
#[test]
fn s5_file_conflict_serialization() {
    let plan = swarm_core::queue::Decomposition {
        subtasks: vec![
            subtask("a", SubtaskType::Implement, 5, &[]),
            subtask("b", SubtaskType::Implement, 5, &[]),
            subtask("c", SubtaskType::Implement, 5, &[]),
        ],
        parallel_groups: vec![],
        conflicts: vec![Conflict {
            resource: "shared.ts".to_string(),
            tasks: vec![SubtaskId::new("a"), SubtaskId::new("b"), SubtaskId::new("c")],
            strategy: Some(ConflictStrategy::Serialize),
        }],
    };
    let queue = TaskQueue::load_from_decomposition(plan, QueueConfig::default()).unwrap();

    assert_eq!(queue.task(&SubtaskId::new("a")).unwrap().wave, 0);
    assert_eq!(queue.task(&SubtaskId::new("b")).unwrap().wave, 1);
    assert_eq!(queue.task(&SubtaskId::new("c")).unwrap().wave, 2);
    assert_eq!(queue.total_waves(), 3);
}

// S6. Hollow detection on an implement task, driven through the full
// orchestrator: a worker that always claims completion with zero tool
// calls should fail with `FailureMode::Hollow`, retry once, then land
// terminal (skipped) once retries are exhausted, and the run should
// still reach `SwarmComplete`.
#[tokio::test(flavor = "multi_thread")]
async fn s6_hollow_completion_drives_failure_then_terminal_skip() {
    let plan = decomposition(vec![subtask("impl", SubtaskType::Implement, 2, &[])]);

    let mut config = SwarmConfig::default();
    config.max_dispatches_per_task = 2;

    let workers = vec![worker("w1", &[SubtaskType::Implement])];
    let model = workers[0].model.clone();

    let provider = Arc::new(ScriptedProvider::new(model.clone(), vec![hollow_completion(100), hollow_completion(100)]));
    let mut providers: HashMap<ModelId, Arc<dyn swarm_core::provider::Provider>> = HashMap::new();
    providers.insert(model, provider);

    let events = swarm_core::EventBus::new(64);
    let mut rx = events.subscribe();

    let mut orchestrator = SwarmOrchestrator::new(config, plan, workers, providers, None, events, 2).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.run()).await.expect("run should not hang").unwrap();

    assert_eq!(outcome, SwarmOutcome::Completed);

    let mut saw_hollow_failure = false;
    let mut saw_resilience_none = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::TaskFailed { failure_mode: FailureMode::Hollow, .. } => saw_hollow_failure = true,
            Event::TaskResilience { strategy: ResilienceStrategy::None, succeeded: false, .. } => saw_resilience_none = true,
            _ => {}
        }
    }
    assert!(saw_hollow_failure, "expected at least one hollow TaskFailed event");
    assert!(saw_resilience_none, "expected a final non-recovering resilience decision");
}

#[tokio::test(flavor = "multi_thread")]
async fn genuine_completion_runs_to_swarm_complete() {
    let plan = decomposition(vec![subtask("impl", SubtaskType::Implement, 2, &[])]);
    let config = SwarmConfig::default();
    let workers = vec![worker("w1", &[SubtaskType::Implement])];
    let model = workers[0].model.clone();

    let provider = Arc::new(ScriptedProvider::new(model.clone(), vec![genuine_completion("all done", 2, 500)]));
    let mut providers: HashMap<ModelId, Arc<dyn swarm_core::provider::Provider>> = HashMap::new();
    providers.insert(model, provider);

    let events = swarm_core::EventBus::new(64);
    let mut orchestrator = SwarmOrchestrator::new(config, plan, workers, providers, None, events, 2).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), orchestrator.run()).await.expect("run should not hang").unwrap();
    assert_eq!(outcome, SwarmOutcome::Completed);
}
