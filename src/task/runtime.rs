use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, JobError};

/// Caller-chosen identity of one listener on one task.
pub type ListenerKey = u64;

/// Lifecycle of a [`BgTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    PreRun,
    Running,
    /// Cancel requested, job not yet returned
    Cancelling,
    PostRunDone,
    Cancelled,
}

/// Terminal result of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Stopped by an explicit cancel
    Cancelled,
    Failed(ErrorKind),
}

impl TaskOutcome {
    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            TaskOutcome::Success => None,
            TaskOutcome::Cancelled => Some(ErrorKind::UserCancelled),
            TaskOutcome::Failed(kind) => Some(kind),
        }
    }
}

/// Notification pushed to every listener of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    PreRun,
    /// Best-effort; listeners may see gaps.
    Progress { done: u64, total: u64 },
    /// Delivered exactly once per listener, after which the channel closes.
    PostRun(TaskOutcome),
}

/// A unit of background work: a channel update or an item download.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> String;

    /// Runs before the task reports `Running`.
    async fn pre_run(&self) {}

    /// The work itself. Must observe `ctx.token()` at its suspension points.
    async fn run(&self, ctx: &TaskContext) -> Result<(), JobError>;
}

/// Handle given to a running job.
pub struct TaskContext {
    task: Arc<BgTask>,
}

impl TaskContext {
    pub fn token(&self) -> &CancellationToken {
        &self.task.token
    }

    pub fn progress(&self, done: u64, total: u64) {
        self.task.broadcast(TaskEvent::Progress { done, total });
    }
}

struct TaskInner {
    phase: Phase,
    outcome: Option<TaskOutcome>,
    consumed: bool,
    listeners: Vec<(ListenerKey, mpsc::UnboundedSender<TaskEvent>)>,
}

/// Runs one [`Job`] on the tokio runtime and fans its events out to
/// listeners.
///
/// The outcome is kept until [`BgTask::consume`], so a listener that
/// attaches after completion still gets one `PostRun`.
pub struct BgTask {
    job: Arc<dyn Job>,
    token: CancellationToken,
    user_cancelled: AtomicBool,
    inner: Mutex<TaskInner>,
    finished: Notify,
}

impl BgTask {
    /// `token` should be a child of the engine's shutdown token: cancelling
    /// it without [`BgTask::cancel`] ends the task as `Interrupted`.
    pub fn new(job: Arc<dyn Job>, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            job,
            token,
            user_cancelled: AtomicBool::new(false),
            inner: Mutex::new(TaskInner {
                phase: Phase::NotStarted,
                outcome: None,
                consumed: false,
                listeners: Vec::new(),
            }),
            finished: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> String {
        self.job.name()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.lock().outcome
    }

    /// True until the job has returned.
    pub fn is_alive(&self) -> bool {
        self.lock().outcome.is_none()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.user_cancelled.load(Ordering::Acquire)
    }

    pub fn is_consumed(&self) -> bool {
        self.lock().consumed
    }

    /// Spawn the job. Call once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let task = Arc::clone(self);
        tokio::spawn(async move { task.execute().await })
    }

    async fn execute(self: Arc<Self>) {
        self.set_phase(Phase::PreRun, Some(TaskEvent::PreRun));
        self.job.pre_run().await;
        {
            let mut inner = self.lock();
            inner.phase = if self.is_cancel_requested() {
                Phase::Cancelling
            } else {
                Phase::Running
            };
        }

        let ctx = TaskContext {
            task: Arc::clone(&self),
        };
        let result = AssertUnwindSafe(self.job.run(&ctx)).catch_unwind().await;

        let outcome = match result {
            Ok(Ok(())) => TaskOutcome::Success,
            Ok(Err(_)) if self.is_cancel_requested() => TaskOutcome::Cancelled,
            Ok(Err(e)) => {
                tracing::warn!(task = %self.job.name(), error = %e, "Task failed");
                TaskOutcome::Failed(e.kind())
            }
            Err(_) => {
                tracing::error!(task = %self.job.name(), "Task panicked");
                TaskOutcome::Failed(ErrorKind::Panicked)
            }
        };
        tracing::debug!(task = %self.job.name(), outcome = ?outcome, "Task finished");
        self.finish(outcome);
    }

    fn set_phase(&self, phase: Phase, event: Option<TaskEvent>) {
        let mut inner = self.lock();
        inner.phase = phase;
        if let Some(event) = event {
            inner.listeners.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    fn broadcast(&self, event: TaskEvent) {
        self.lock()
            .listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn finish(&self, outcome: TaskOutcome) {
        {
            let mut inner = self.lock();
            inner.phase = match outcome {
                TaskOutcome::Cancelled => Phase::Cancelled,
                _ => Phase::PostRunDone,
            };
            inner.outcome = Some(outcome);
            // Dropping the senders closes every receiver after PostRun.
            for (_, tx) in inner.listeners.drain(..) {
                let _ = tx.send(TaskEvent::PostRun(outcome));
            }
        }
        self.finished.notify_waiters();
    }

    /// Request cooperative cancellation. Returns `false` once the job has
    /// returned.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.outcome.is_some() {
            return false;
        }
        self.user_cancelled.store(true, Ordering::Release);
        if matches!(inner.phase, Phase::PreRun | Phase::Running) {
            inner.phase = Phase::Cancelling;
        }
        drop(inner);
        self.token.cancel();
        true
    }

    /// Attach a listener. A listener already registered under `key` is
    /// replaced.
    ///
    /// After completion the receiver yields one synthetic `PostRun` and then
    /// closes; once the outcome is consumed it is closed straight away.
    pub fn subscribe(&self, key: ListenerKey) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        match inner.outcome {
            Some(outcome) if !inner.consumed => {
                let _ = tx.send(TaskEvent::PostRun(outcome));
            }
            Some(_) => {}
            None => {
                inner.listeners.retain(|(k, _)| *k != key);
                inner.listeners.push((key, tx));
            }
        }
        rx
    }

    pub fn remove_listener(&self, key: ListenerKey) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(k, _)| *k != key);
        inner.listeners.len() != before
    }

    /// Mark the outcome as observed. Returns `false` while still running.
    pub fn consume(&self) -> bool {
        let mut inner = self.lock();
        if inner.outcome.is_none() {
            return false;
        }
        inner.consumed = true;
        true
    }

    /// Wait for the job to return.
    pub async fn wait(&self) -> TaskOutcome {
        loop {
            let finished = self.finished.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            finished.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LoadError;
    use pretty_assertions::assert_eq;

    struct StepJob;

    #[async_trait]
    impl Job for StepJob {
        fn name(&self) -> String {
            "steps".to_string()
        }

        async fn run(&self, ctx: &TaskContext) -> Result<(), JobError> {
            ctx.progress(1, 2);
            ctx.progress(2, 2);
            Ok(())
        }
    }

    /// Waits for its token like a stalled network read.
    struct BlockingJob;

    #[async_trait]
    impl Job for BlockingJob {
        fn name(&self) -> String {
            "blocking".to_string()
        }

        async fn run(&self, ctx: &TaskContext) -> Result<(), JobError> {
            ctx.token().cancelled().await;
            Err(LoadError::Cancelled.into())
        }
    }

    struct PanicJob;

    #[async_trait]
    impl Job for PanicJob {
        fn name(&self) -> String {
            "panic".to_string()
        }

        async fn run(&self, _ctx: &TaskContext) -> Result<(), JobError> {
            panic!("job exploded");
        }
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_listener_sees_every_phase_once() {
        let task = BgTask::new(Arc::new(StepJob), CancellationToken::new());
        let rx = task.subscribe(1);
        assert_eq!(task.phase(), Phase::NotStarted);

        task.start();
        assert_eq!(task.wait().await, TaskOutcome::Success);

        assert_eq!(
            drain(rx).await,
            vec![
                TaskEvent::PreRun,
                TaskEvent::Progress { done: 1, total: 2 },
                TaskEvent::Progress { done: 2, total: 2 },
                TaskEvent::PostRun(TaskOutcome::Success),
            ]
        );
        assert_eq!(task.phase(), Phase::PostRunDone);
    }

    #[tokio::test]
    async fn test_user_cancel_yields_cancelled() {
        let task = BgTask::new(Arc::new(BlockingJob), CancellationToken::new());
        let rx = task.subscribe(1);
        task.start();

        assert!(task.cancel());
        let outcome = task.wait().await;
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UserCancelled));
        assert_eq!(task.phase(), Phase::Cancelled);
        assert_eq!(
            drain(rx).await.last(),
            Some(&TaskEvent::PostRun(TaskOutcome::Cancelled))
        );
        assert!(!task.cancel());
    }

    #[tokio::test]
    async fn test_shutdown_without_cancel_is_interrupted() {
        let shutdown = CancellationToken::new();
        let task = BgTask::new(Arc::new(BlockingJob), shutdown.child_token());
        task.start();

        shutdown.cancel();
        assert_eq!(
            task.wait().await,
            TaskOutcome::Failed(ErrorKind::Interrupted)
        );
    }

    #[tokio::test]
    async fn test_panicking_job_fails() {
        let task = BgTask::new(Arc::new(PanicJob), CancellationToken::new());
        task.start();
        assert_eq!(task.wait().await, TaskOutcome::Failed(ErrorKind::Panicked));
    }

    #[tokio::test]
    async fn test_late_listener_gets_synthetic_post_run() {
        let task = BgTask::new(Arc::new(StepJob), CancellationToken::new());
        task.start();
        task.wait().await;

        let events = drain(task.subscribe(7)).await;
        assert_eq!(events, vec![TaskEvent::PostRun(TaskOutcome::Success)]);

        assert!(task.consume());
        assert!(drain(task.subscribe(8)).await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_listener_gets_nothing() {
        let task = BgTask::new(Arc::new(StepJob), CancellationToken::new());
        let kept = task.subscribe(1);
        let removed = task.subscribe(2);
        assert!(task.remove_listener(2));
        assert!(!task.remove_listener(2));

        task.start();
        task.wait().await;

        assert!(drain(removed).await.is_empty());
        assert_eq!(drain(kept).await.len(), 4);
    }

    #[tokio::test]
    async fn test_consume_before_finish_is_refused() {
        let task = BgTask::new(Arc::new(BlockingJob), CancellationToken::new());
        task.start();
        assert!(!task.consume());
        assert!(task.is_alive());
        task.cancel();
        task.wait().await;
        assert!(!task.is_alive());
        assert!(task.consume());
    }
}
