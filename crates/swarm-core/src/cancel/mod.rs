//! Cancellation primitives built on [`tokio_util::sync::CancellationToken`]:
//! linked tokens carrying a reason string, a progress-aware timeout that
//! tracks a hard max deadline alongside an idle deadline only a closed
//! set of progress events may reset, a graceful variant that adds a
//! wrapup window (with a one-shot warning callback) before truly
//! expiring, and a `race` combinator for suspension points.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The only events allowed to reset a [`ProgressAwareTimeout`]'s idle
/// deadline. Closed deliberately: a task that is merely "thinking" with
/// no tool or model call in flight must not be able to stall the idle
/// clock forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    ToolStart,
    ToolComplete,
    LlmStart,
    LlmComplete,
}

/// A cancellation source. Dropping the source does not cancel derived
/// tokens; call [`CancellationSource::cancel`] explicitly.
pub struct CancellationSource {
    inner: tokio_util::sync::CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self { inner: tokio_util::sync::CancellationToken::new(), reason: Arc::new(Mutex::new(None)) }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken { inner: self.inner.clone(), reason: self.reason.clone() }
    }

    /// Cancellation is one-way and monotonic: the first reason wins and
    /// later calls are no-ops.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheaply-cloneable cancellation handle. [`Self::child_token`] derives
/// a linked token: it shares the parent's reason cell (so whichever side
/// cancels first wins the reason, matching a linked-token source) while
/// keeping its own underlying `tokio_util` token, so the child's
/// cancellation never propagates back up to the parent.
#[derive(Clone)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self { inner: tokio_util::sync::CancellationToken::new(), reason: Arc::new(Mutex::new(None)) }
    }

    pub fn child_token(&self) -> CancellationToken {
        CancellationToken { inner: self.inner.child_token(), reason: self.reason.clone() }
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of racing a future against a cancellation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome<T> {
    Completed(T),
    Cancelled(Option<String>),
}

/// Race `fut` against `token`'s cancellation. Used at every suspension
/// point (tool calls, model calls, wave barriers) so cancellation takes
/// effect without needing every future to thread a token through itself.
pub async fn race<F, T>(token: &CancellationToken, fut: F) -> RaceOutcome<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => RaceOutcome::Cancelled(token.reason()),
        out = fut => RaceOutcome::Completed(out),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    MaxDurationExceeded,
    IdleExceeded,
}

/// Tracks a hard max deadline and an idle deadline that only
/// [`ProgressEvent`]s can push out. Whichever elapses first wins.
pub struct ProgressAwareTimeout {
    max_duration: Duration,
    idle_duration: Duration,
    max_deadline: Instant,
    idle_deadline: Instant,
}

impl ProgressAwareTimeout {
    pub fn new(max_duration: Duration, idle_duration: Duration) -> Self {
        let now = Instant::now();
        Self {
            max_duration,
            idle_duration,
            max_deadline: now + max_duration,
            idle_deadline: now + idle_duration,
        }
    }

    /// Push the idle deadline out by `idle_duration` from now. Never
    /// moves the max deadline.
    pub fn record_progress(&mut self, _event: ProgressEvent) {
        self.idle_deadline = Instant::now() + self.idle_duration;
    }

    pub fn next_wakeup(&self) -> Instant {
        self.max_deadline.min(self.idle_deadline)
    }

    pub fn check(&self, now: Instant) -> Option<TimeoutReason> {
        if now >= self.max_deadline {
            Some(TimeoutReason::MaxDurationExceeded)
        } else if now >= self.idle_deadline {
            Some(TimeoutReason::IdleExceeded)
        } else {
            None
        }
    }

    /// The disambiguating reason string a [`CancellationToken`] should
    /// carry when `reason` fired on this timeout.
    pub fn reason_message(&self, reason: TimeoutReason) -> String {
        match reason {
            TimeoutReason::MaxDurationExceeded => format!("Maximum timeout exceeded ({}s)", self.max_duration.as_secs()),
            TimeoutReason::IdleExceeded => format!("Idle timeout ({}s since last progress)", self.idle_duration.as_secs()),
        }
    }

    /// Sleep until whichever deadline is currently soonest, then report
    /// which one fired. Callers loop this, calling [`Self::record_progress`]
    /// between iterations as events arrive.
    pub async fn wait_until_next_deadline(&self) -> TimeoutReason {
        tokio::time::sleep_until(self.next_wakeup().into()).await;
        self.check(Instant::now()).unwrap_or(TimeoutReason::IdleExceeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracefulPhase {
    Running,
    WrapUp,
    Expired,
}

/// A [`ProgressAwareTimeout`] that, on first expiry, does not cancel
/// immediately: it opens a fixed wrapup window giving the worker a last
/// chance to land a clean stopping point before the task is torn down.
pub struct GracefulTimeout {
    inner: ProgressAwareTimeout,
    wrapup_duration: Duration,
    phase: GracefulPhase,
    wrapup_deadline: Option<Instant>,
    wrapup_reason: Option<TimeoutReason>,
    wrapup_callback: Option<Box<dyn FnOnce() + Send>>,
}

impl GracefulTimeout {
    pub fn new(max_duration: Duration, idle_duration: Duration, wrapup_duration: Duration) -> Self {
        Self {
            inner: ProgressAwareTimeout::new(max_duration, idle_duration),
            wrapup_duration,
            phase: GracefulPhase::Running,
            wrapup_deadline: None,
            wrapup_reason: None,
            wrapup_callback: None,
        }
    }

    pub fn phase(&self) -> GracefulPhase {
        self.phase
    }

    pub fn is_in_wrapup_phase(&self) -> bool {
        self.phase == GracefulPhase::WrapUp
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.phase == GracefulPhase::Expired
    }

    /// The reason the wrapup phase was entered, once it has been.
    pub fn wrapup_reason(&self) -> Option<TimeoutReason> {
        self.wrapup_reason
    }

    /// Register a callback to fire exactly once, the instant wrapup
    /// begins. If wrapup has already begun, it fires immediately instead
    /// of waiting for the next `poll`.
    pub fn on_wrapup_warning(&mut self, callback: impl FnOnce() + Send + 'static) {
        if self.phase == GracefulPhase::WrapUp {
            callback();
        } else {
            self.wrapup_callback = Some(Box::new(callback));
        }
    }

    /// Progress only extends the idle deadline while still `Running`;
    /// once wrapup begins, the wrapup window is fixed.
    pub fn record_progress(&mut self, event: ProgressEvent) {
        if self.phase == GracefulPhase::Running {
            self.inner.record_progress(event);
        }
    }

    /// Advance the phase state machine against wall-clock `now`.
    pub fn poll(&mut self, now: Instant) -> GracefulPhase {
        match self.phase {
            GracefulPhase::Running => {
                if let Some(reason) = self.inner.check(now) {
                    self.phase = GracefulPhase::WrapUp;
                    self.wrapup_reason = Some(reason);
                    self.wrapup_deadline = Some(now + self.wrapup_duration);
                    if let Some(cb) = self.wrapup_callback.take() {
                        cb();
                    }
                }
            }
            GracefulPhase::WrapUp => {
                if now >= self.wrapup_deadline.expect("wrapup_deadline set on entering WrapUp") {
                    self.phase = GracefulPhase::Expired;
                }
            }
            GracefulPhase::Expired => {}
        }
        self.phase
    }

    pub fn next_wakeup(&self) -> Instant {
        match self.phase {
            GracefulPhase::Running => self.inner.next_wakeup(),
            GracefulPhase::WrapUp => self.wrapup_deadline.unwrap_or_else(Instant::now),
            GracefulPhase::Expired => Instant::now(),
        }
    }

    pub async fn wait_until_next_deadline(&mut self) -> GracefulPhase {
        tokio::time::sleep_until(self.next_wakeup().into()).await;
        self.poll(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn race_reports_cancelled_with_reason_when_token_fires_first() {
        let source = CancellationSource::new();
        let token = source.token();
        source.cancel("user requested cancellation");
        let outcome = race(&token, async { 42 }).await;
        assert_eq!(outcome, RaceOutcome::Cancelled(Some("user requested cancellation".to_string())));
    }

    #[tokio::test]
    async fn race_reports_completed_when_future_wins() {
        let source = CancellationSource::new();
        let token = source.token();
        let outcome = race(&token, async { 42 }).await;
        assert_eq!(outcome, RaceOutcome::Completed(42));
    }

    #[tokio::test]
    async fn child_token_cancelled_by_parent() {
        let source = CancellationSource::new();
        let parent = source.token();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        source.cancel("shutting down");
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("shutting down".to_string()));
    }

    #[tokio::test]
    async fn child_token_cancellation_does_not_propagate_to_parent() {
        let source = CancellationSource::new();
        let parent = source.token();
        let child = parent.child_token();
        child.cancel("child gave up");
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn later_cancel_reasons_do_not_overwrite_the_first() {
        let source = CancellationSource::new();
        source.cancel("first reason");
        source.cancel("second reason");
        assert_eq!(source.reason(), Some("first reason".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_fires_before_max_without_progress() {
        let timeout = ProgressAwareTimeout::new(Duration::from_secs(300), Duration::from_secs(10));
        let reason = timeout.wait_until_next_deadline().await;
        assert_eq!(reason, TimeoutReason::IdleExceeded);
        assert_eq!(timeout.reason_message(reason), "Idle timeout (10s since last progress)");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_event_pushes_idle_deadline_out() {
        let mut timeout = ProgressAwareTimeout::new(Duration::from_secs(300), Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        timeout.record_progress(ProgressEvent::ToolStart);
        // Idle deadline reset to +10s from here; max deadline is far away.
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(timeout.check(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn max_deadline_fires_even_with_continuous_progress() {
        let mut timeout = ProgressAwareTimeout::new(Duration::from_secs(20), Duration::from_secs(50));
        tokio::time::advance(Duration::from_secs(19)).await;
        timeout.record_progress(ProgressEvent::LlmComplete);
        tokio::time::advance(Duration::from_secs(2)).await;
        let reason = timeout.check(Instant::now());
        assert_eq!(reason, Some(TimeoutReason::MaxDurationExceeded));
        assert_eq!(timeout.reason_message(reason.unwrap()), "Maximum timeout exceeded (20s)");
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_timeout_enters_wrapup_then_expires() {
        let mut timeout = GracefulTimeout::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Duration::from_secs(5),
        );
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(timeout.poll(Instant::now()), GracefulPhase::WrapUp);
        assert!(timeout.is_in_wrapup_phase());
        assert!(!timeout.is_cancellation_requested());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(timeout.poll(Instant::now()), GracefulPhase::Expired);
        assert!(timeout.is_cancellation_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn wrapup_callback_fires_exactly_once_on_entry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mut timeout = GracefulTimeout::new(Duration::from_secs(10), Duration::from_secs(10), Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        timeout.on_wrapup_warning(move || {
            calls_for_cb.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(11)).await;
        timeout.poll(Instant::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        timeout.poll(Instant::now());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "callback must not fire again on later polls");
    }

    #[tokio::test]
    async fn wrapup_callback_registered_during_wrapup_fires_immediately() {
        let mut timeout = GracefulTimeout::new(Duration::from_millis(0), Duration::from_millis(0), Duration::from_secs(5));
        timeout.poll(Instant::now() + Duration::from_secs(1));
        assert_eq!(timeout.phase(), GracefulPhase::WrapUp);

        let flag = Arc::new(Mutex::new(false));
        let flag_for_cb = flag.clone();
        timeout.on_wrapup_warning(move || *flag_for_cb.lock().unwrap() = true);
        assert!(*flag.lock().unwrap());
    }
}
