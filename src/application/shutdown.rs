//! Graceful shutdown coordination.
//!
//! Components register named teardown tasks as they start. On shutdown the
//! tasks run one at a time in reverse registration order, so a resource is
//! always torn down before the resources it was built on. Every task runs
//! even when an earlier one fails, and the whole sequence shares a single
//! deadline.

use crate::domain::error::BoxError;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline applied when none is configured.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type TeardownFn = Box<dyn FnOnce(ShutdownContext) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

struct ShutdownTask {
    name: String,
    run: TeardownFn,
}

/// Handed to every teardown task.
#[derive(Debug, Clone)]
pub struct ShutdownContext {
    token: CancellationToken,
    deadline: Instant,
}

impl ShutdownContext {
    /// Context for driving a teardown step outside the coordinator.
    pub fn new(token: CancellationToken, deadline: Instant) -> Self {
        Self { token, deadline }
    }

    /// Cancelled when the caller's token is cancelled or the deadline passes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Instant by which the whole shutdown must have finished.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// One teardown task that did not complete cleanly.
#[derive(Debug)]
pub struct TaskFailure {
    pub name: String,
    pub error: BoxError,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("deadline exceeded")]
struct DeadlineExceeded;

/// Error returned by [`ShutdownCoordinator::shutdown`].
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// One or more teardown tasks failed; every failure is listed.
    #[error("shutdown completed with errors: {}", join_failures(.0))]
    TasksFailed(Vec<TaskFailure>),
    /// Shutdown had already been performed.
    #[error("shutdown already performed")]
    AlreadyShutDown,
}

impl ShutdownError {
    /// Failed tasks, in the order they ran.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            ShutdownError::TasksFailed(failures) => failures,
            ShutdownError::AlreadyShutDown => &[],
        }
    }
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered registry of teardown tasks, run exactly once.
///
/// # Example
/// ```
/// use queue_guard::ShutdownCoordinator;
/// use std::sync::{Arc, Mutex};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
/// let order = Arc::new(Mutex::new(Vec::new()));
///
/// for name in ["database", "consumer"] {
///     let order = Arc::clone(&order);
///     coordinator.register(name, move |_ctx| async move {
///         order.lock().unwrap().push(name);
///         Ok(())
///     });
/// }
///
/// coordinator.shutdown(&CancellationToken::new()).await.unwrap();
/// assert_eq!(*order.lock().unwrap(), ["consumer", "database"]);
/// # }
/// ```
pub struct ShutdownCoordinator {
    timeout: Duration,
    tasks: Mutex<Vec<ShutdownTask>>,
    registered: AtomicUsize,
    /// Only flipped while `tasks` is locked.
    done: AtomicBool,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("timeout", &self.timeout)
            .field("tasks", &self.task_count())
            .field("done", &self.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl ShutdownCoordinator {
    /// Coordinator whose shutdown must finish within `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tasks: Mutex::new(Vec::new()),
            registered: AtomicUsize::new(0),
            done: AtomicBool::new(false),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a teardown task.
    ///
    /// Tasks registered after shutdown has started are never run.
    pub fn register<F, Fut>(&self, name: impl Into<String>, teardown: F)
    where
        F: FnOnce(ShutdownContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        let mut tasks = self.lock();
        if self.done.load(Ordering::SeqCst) {
            tracing::warn!(task = %name, "shutdown task registered after shutdown, ignoring");
            return;
        }

        tracing::debug!(task = %name, "registered shutdown task");
        tasks.push(ShutdownTask {
            name,
            run: Box::new(move |ctx| teardown(ctx).boxed()),
        });
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of tasks accepted by [`register`](Self::register), including
    /// those that already ran.
    pub fn task_count(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    /// Whether shutdown has started.
    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Run every registered task, last registered first.
    ///
    /// Tasks run sequentially. Each one is bounded by the shared deadline; a
    /// task still running when it passes is dropped and recorded as failed,
    /// and the remaining tasks still get their turn. Cancelling `parent`
    /// cancels the token every task sees but does not skip tasks.
    pub async fn shutdown(&self, parent: &CancellationToken) -> Result<(), ShutdownError> {
        let tasks = {
            let mut tasks = self.lock();
            if self.done.swap(true, Ordering::SeqCst) {
                return Err(ShutdownError::AlreadyShutDown);
            }
            std::mem::take(&mut *tasks)
        };
        let started = Instant::now();
        let ctx = ShutdownContext {
            token: parent.child_token(),
            deadline: started + self.timeout,
        };

        tracing::info!(
            tasks = tasks.len(),
            timeout_ms = self.timeout.as_millis() as u64,
            "starting graceful shutdown"
        );

        let mut failures = Vec::new();
        for task in tasks.into_iter().rev() {
            let ShutdownTask { name, run } = task;
            tracing::debug!(task = %name, "running shutdown task");

            let outcome = match tokio::time::timeout_at(ctx.deadline, run(ctx.clone())).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    ctx.token.cancel();
                    Err(Box::new(DeadlineExceeded) as BoxError)
                }
            };

            match outcome {
                Ok(()) => tracing::debug!(task = %name, "shutdown task finished"),
                Err(error) => {
                    tracing::error!(task = %name, error = %error, "shutdown task failed");
                    failures.push(TaskFailure { name, error });
                }
            }
        }
        ctx.token.cancel();

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if failures.is_empty() {
            tracing::info!(elapsed_ms, "graceful shutdown completed");
            Ok(())
        } else {
            tracing::warn!(elapsed_ms, failed = failures.len(), "graceful shutdown completed with errors");
            Err(ShutdownError::TasksFailed(failures))
        }
    }

    /// Wait for `trigger`, then shut down.
    pub async fn shutdown_on<T>(&self, trigger: T) -> Result<(), ShutdownError>
    where
        T: Future<Output = ()>,
    {
        trigger.await;
        self.shutdown(&CancellationToken::new()).await
    }

    /// Wait for SIGINT or SIGTERM, then shut down.
    pub async fn wait_for_signal(&self) -> Result<(), ShutdownError> {
        self.shutdown_on(termination_signal()).await
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ShutdownTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves on the first interrupt or terminate signal.
///
/// A signal that cannot be installed is logged and never fires.
pub async fn termination_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => tracing::info!("SIGINT received, initiating graceful shutdown"),
        _ = terminate => tracing::info!("SIGTERM received, initiating graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockCaptureLayer;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::layer::SubscriberExt;

    fn recording(coordinator: &ShutdownCoordinator, names: &[&'static str]) -> Arc<Mutex<Vec<&'static str>>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        for &name in names {
            let order = Arc::clone(&order);
            coordinator.register(name, move |_ctx| async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        order
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = recording(&coordinator, &["A", "B", "C"]);
        assert_eq!(coordinator.task_count(), 3);

        coordinator.shutdown(&CancellationToken::new()).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert_eq!(coordinator.task_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_does_not_short_circuit() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            coordinator.register(name, move |_ctx| async move {
                order.lock().unwrap().push(name);
                if name == "B" {
                    Err(BoxError::from("connection already closed"))
                } else {
                    Ok(())
                }
            });
        }

        let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
        assert_eq!(err.failures().len(), 1);
        assert_eq!(err.failures()[0].name, "B");
        assert_eq!(
            err.to_string(),
            "shutdown completed with errors: B: connection already closed"
        );
    }

    #[tokio::test]
    async fn test_multiple_failures_reported_together() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register("first", |_ctx| async { Err(BoxError::from("a")) });
        coordinator.register("second", |_ctx| async { Err(BoxError::from("b")) });

        let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();
        let names: Vec<&str> = err.failures().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["second", "first"]);
        assert!(err.to_string().contains("second: b; first: a"));
    }

    #[tokio::test]
    async fn test_runs_exactly_once() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let order = recording(&coordinator, &["A"]);

        coordinator.shutdown(&CancellationToken::new()).await.unwrap();
        let second = coordinator.shutdown(&CancellationToken::new()).await;
        assert!(matches!(second, Err(ShutdownError::AlreadyShutDown)));
        assert_eq!(order.lock().unwrap().len(), 1);
        assert!(coordinator.is_shut_down());
    }

    #[tokio::test]
    async fn test_register_after_shutdown_ignored() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.shutdown(&CancellationToken::new()).await.unwrap();

        coordinator.register("late", |_ctx| async { Ok(()) });
        assert_eq!(coordinator.task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_racing_shutdown_is_run_or_refused() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));
        let ran = Arc::new(AtomicUsize::new(0));

        let registrars: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let ran = Arc::clone(&ran);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let ran = Arc::clone(&ran);
                        coordinator.register(format!("task-{i}"), move |_ctx| async move {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        });
                    }
                })
            })
            .collect();

        coordinator.shutdown(&CancellationToken::new()).await.unwrap();
        for registrar in registrars {
            registrar.join().unwrap();
        }

        // Every accepted task ran; the rest were refused.
        assert_eq!(ran.load(Ordering::SeqCst), coordinator.task_count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_slow_task() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let order = Arc::clone(&order);
            coordinator.register("fast", move |ctx| async move {
                order.lock().unwrap().push(("fast", ctx.token().is_cancelled()));
                Ok(())
            });
        }
        coordinator.register("stuck", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        let started = Instant::now();
        let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(err.failures()[0].name, "stuck");
        assert_eq!(err.failures()[0].error.to_string(), "deadline exceeded");
        assert_eq!(*order.lock().unwrap(), vec![("fast", true)]);
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_tasks() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let seen = Arc::new(AtomicBool::new(false));
        {
            let seen = Arc::clone(&seen);
            coordinator.register("observer", move |ctx| async move {
                seen.store(ctx.token().is_cancelled(), Ordering::SeqCst);
                Ok(())
            });
        }

        let parent = CancellationToken::new();
        parent.cancel();
        coordinator.shutdown(&parent).await.unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_on_trigger() {
        let coordinator = Arc::new(ShutdownCoordinator::default());
        let order = recording(&coordinator, &["A"]);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .shutdown_on(async move {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        tokio::task::yield_now().await;
        assert!(order.lock().unwrap().is_empty());

        tx.send(()).unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_failures_are_logged() {
        let capture = MockCaptureLayer::new();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register("broker", |_ctx| async { Err(BoxError::from("channel closed")) });
        let _ = coordinator.shutdown(&CancellationToken::new()).await;

        let failed = capture.matching("shutdown task failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].field("task"), Some("broker"));
    }
}
