//! The tagged event union every component emits, and a broadcast-backed
//! bus that fans events out to subscribers. Emission is fire-and-forget:
//! a full or closed subscriber channel never propagates back to the
//! emitting component, matching the "listener exceptions are swallowed"
//! rule from the concurrency model.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{FailureMode, ModelId, SubtaskId};

/// A tagged record emitted by every component in the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskDispatched { task_id: SubtaskId, model: ModelId, wave: u32 },
    TaskCompleted { task_id: SubtaskId },
    TaskFailed { task_id: SubtaskId, failure_mode: FailureMode },
    TaskAttempt { task_id: SubtaskId, attempt: u32 },
    TaskResilience {
        task_id: SubtaskId,
        strategy: ResilienceStrategy,
        succeeded: bool,
        reason: String,
        artifacts_found: bool,
        tool_calls: i64,
    },
    WaveStart { wave: u32 },
    WaveComplete { wave: u32 },
    BudgetWarning { percent_used: f64, reason: String },
    BudgetExceeded { reason: String },
    DoomLoopDetected { task_id: SubtaskId, fingerprint: String, global: bool },
    PhaseTransition { task_id: SubtaskId, from: String, to: String },
    CacheHit { task_id: SubtaskId },
    ExtensionRequested { task_id: SubtaskId, reason: String },
    ExplorationSaturation { task_id: SubtaskId },
    SwarmComplete,
}

/// Outcome of a resilience decision, mirrored on [`Event::TaskResilience`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResilienceStrategy {
    MicroDecompose,
    DegradedAcceptance,
    None,
}

/// A lazy, fan-out event stream. Cloning an `EventBus` shares the same
/// underlying channel; every [`EventBus::subscribe`] call gets an
/// independent receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events. Events emitted before this call are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers. Fire-and-forget: if
    /// there are no subscribers (or all have dropped their receiver),
    /// the send error is swallowed.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(Event::WaveStart { wave: 0 });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Event::WaveStart { wave: 0 }));
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(Event::SwarmComplete);
    }

    #[tokio::test]
    async fn late_subscriber_after_complete_gets_closed_or_empty_stream() {
        let bus = EventBus::default();
        bus.emit(Event::SwarmComplete);
        let mut rx = bus.subscribe();
        // A fresh subscriber never sees events emitted before it subscribed.
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await;
        assert!(result.is_err(), "late subscriber should not see prior events");
    }
}
