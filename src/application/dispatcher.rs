//! Dispatch loop: admission, processing and settlement of inbound messages.
//!
//! Every delivery moves through
//!
//! ```text
//! Received -> (RateLimited | Admitted) -> Processing -> (Acked | Requeued)
//! ```
//!
//! Each admitted message gets its own tracked task; the only backpressure is
//! the per-event-type limiter. Two cancellation tokens govern shutdown: the
//! intake token stops the receive loop and interrupts limiter waits as soon
//! as shutdown starts, while the processing token is only cancelled once the
//! drain deadline has passed.

use crate::application::ports::{
    Delivery, DeliveryOutcome, EventHandler, MessageSource, MetricsRecorder, NoopMetrics,
};
use crate::application::registry::MultiKeyLimiter;
use crate::application::shutdown::{ShutdownContext, ShutdownCoordinator};
use crate::domain::error::BoxError;
use crate::domain::event::event_type_of;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The drain deadline passed with messages still being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("drain deadline exceeded with {in_flight} message(s) still in flight")]
pub struct DrainTimeout {
    pub in_flight: usize,
}

/// Consumes a [`MessageSource`] and settles every delivery.
///
/// Cloning is cheap; clones share tokens, tracker and collaborators.
pub struct Dispatcher<H: EventHandler> {
    handler: Arc<H>,
    limiter: Arc<MultiKeyLimiter>,
    metrics: Arc<dyn MetricsRecorder>,
    intake: CancellationToken,
    processing: CancellationToken,
    tracker: TaskTracker,
    drain: bool,
}

impl<H: EventHandler> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
            intake: self.intake.clone(),
            processing: self.processing.clone(),
            tracker: self.tracker.clone(),
            drain: self.drain,
        }
    }
}

impl<H: EventHandler> fmt::Debug for Dispatcher<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.tracker.len())
            .field("intake_stopped", &self.intake.is_cancelled())
            .field("drain", &self.drain)
            .finish_non_exhaustive()
    }
}

impl<H: EventHandler> Dispatcher<H> {
    /// Dispatcher that drains in-flight work on shutdown.
    pub fn new(handler: Arc<H>, limiter: Arc<MultiKeyLimiter>) -> Self {
        Self {
            handler,
            limiter,
            metrics: Arc::new(NoopMetrics),
            intake: CancellationToken::new(),
            processing: CancellationToken::new(),
            tracker: TaskTracker::new(),
            drain: true,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether shutdown waits for in-flight messages. Enabled by default.
    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    /// Token cancelled when intake stops.
    pub fn intake_token(&self) -> CancellationToken {
        self.intake.clone()
    }

    /// Token handed to the handler; cancelled when the drain deadline passes.
    pub fn processing_token(&self) -> CancellationToken {
        self.processing.clone()
    }

    /// Messages received but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop receiving. In-flight messages keep running.
    pub fn stop(&self) {
        self.intake.cancel();
    }

    /// Receive from `source` until it is exhausted or intake stops.
    ///
    /// Returns without waiting for spawned work; use [`drain`](Self::drain)
    /// or [`register_shutdown`](Self::register_shutdown) for that.
    pub async fn run<S>(&self, mut source: S)
    where
        S: MessageSource,
    {
        tracing::info!("dispatch loop started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.intake.cancelled() => break,
                delivery = source.next_delivery() => delivery,
            };

            match delivery {
                Some(delivery) => self.dispatch(delivery).await,
                None => {
                    tracing::info!("message source closed");
                    break;
                }
            }
        }

        tracing::info!(in_flight = self.tracker.len(), "dispatch loop stopped");
    }

    /// Admit one delivery: requeue it if intake has stopped, otherwise
    /// process it on a tracked task.
    pub async fn dispatch<D>(&self, delivery: D)
    where
        D: Delivery,
    {
        let key = limiter_key(&delivery);

        if self.intake.is_cancelled() {
            tracing::debug!(event_type = %key, "intake stopped, requeueing message");
            let started = Instant::now();
            settle(delivery, &key, DeliveryOutcome::Rejected).await;
            self.metrics
                .event_processed(&key, DeliveryOutcome::Rejected, started.elapsed());
            return;
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            this.process(delivery, key).await;
        });
    }

    async fn process<D>(&self, delivery: D, key: String)
    where
        D: Delivery,
    {
        let started = Instant::now();
        tracing::debug!(event_type = %key, routing_key = delivery.routing_key(), "message received");

        let outcome = match self.limiter.wait(&key, &self.intake).await {
            Err(err) => {
                tracing::debug!(event_type = %key, error = %err, "admission cancelled, requeueing");
                DeliveryOutcome::Requeued
            }
            Ok(()) => match self.handler.handle(&self.processing, delivery.body()).await {
                Ok(()) => DeliveryOutcome::Acked,
                Err(err) => {
                    tracing::warn!(event_type = %key, error = %err, "processing failed, requeueing");
                    DeliveryOutcome::Requeued
                }
            },
        };

        settle(delivery, &key, outcome).await;
        self.metrics.event_processed(&key, outcome, started.elapsed());
    }

    /// Stop intake and, if draining, wait for in-flight messages until the
    /// shutdown deadline.
    ///
    /// On timeout the processing token is cancelled so handlers can bail out,
    /// and [`DrainTimeout`] reports how many messages were abandoned.
    pub async fn drain(&self, ctx: ShutdownContext) -> Result<(), BoxError> {
        self.intake.cancel();
        self.tracker.close();

        if !self.drain {
            tracing::info!(in_flight = self.tracker.len(), "not waiting for in-flight messages");
            return Ok(());
        }

        tracing::info!(in_flight = self.tracker.len(), "waiting for in-flight messages");
        match tokio::time::timeout_at(ctx.deadline(), self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("all in-flight messages settled");
                Ok(())
            }
            Err(_) => {
                let in_flight = self.tracker.len();
                self.processing.cancel();
                tracing::warn!(in_flight, "drain deadline exceeded, abandoning in-flight messages");
                Err(DrainTimeout { in_flight }.into())
            }
        }
    }

    /// Register [`drain`](Self::drain) as a teardown task named `"dispatcher"`.
    pub fn register_shutdown(&self, coordinator: &ShutdownCoordinator) {
        let this = self.clone();
        coordinator.register("dispatcher", move |ctx| async move { this.drain(ctx).await });
    }
}

/// Limiter key for a delivery: the payload's `event_type`, or the routing
/// key when the payload has none.
fn limiter_key<D: Delivery>(delivery: &D) -> String {
    event_type_of(delivery.body()).unwrap_or_else(|_| delivery.routing_key().to_string())
}

async fn settle<D: Delivery>(delivery: D, key: &str, outcome: DeliveryOutcome) {
    let result = match outcome {
        DeliveryOutcome::Acked => delivery.ack().await,
        DeliveryOutcome::Requeued | DeliveryOutcome::Rejected => delivery.nack(true).await,
    };

    match result {
        Ok(()) => tracing::debug!(event_type = %key, outcome = outcome.as_str(), "message settled"),
        Err(err) => tracing::error!(
            event_type = %key,
            outcome = outcome.as_str(),
            error = %err,
            "failed to settle message"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::metrics::Metrics;
    use crate::application::ports::MessageSource;
    use crate::domain::policy::RatePolicy;
    use crate::infrastructure::mocks::{ScriptedHandler, Step};
    use crate::infrastructure::queue::{ChannelQueue, Settlement};
    use std::time::Duration;

    fn body(event_type: &str) -> Vec<u8> {
        format!(r#"{{"event_type":"{}"}}"#, event_type).into_bytes()
    }

    fn dispatcher(handler: ScriptedHandler) -> (Dispatcher<ScriptedHandler>, Arc<ScriptedHandler>) {
        let handler = Arc::new(handler);
        let dispatcher = Dispatcher::new(Arc::clone(&handler), Arc::new(MultiKeyLimiter::unthrottled()));
        (dispatcher, handler)
    }

    fn shutdown_ctx(timeout: Duration) -> ShutdownContext {
        ShutdownContext::new(CancellationToken::new(), tokio::time::Instant::now() + timeout)
    }

    #[tokio::test]
    async fn test_success_acks_and_failure_requeues() {
        let (dispatcher, handler) =
            dispatcher(ScriptedHandler::new([Step::Succeed, Step::FailTransient], Step::Succeed));
        let metrics = Metrics::new();
        let dispatcher = dispatcher.with_metrics(Arc::new(metrics.clone()));
        let (publisher, queue) = ChannelQueue::bounded(8);
        let ledger = queue.ledger();

        publisher.publish("material.uploaded", body("material_uploaded")).await.unwrap();
        publisher.publish("material.uploaded", body("material_uploaded")).await.unwrap();
        drop(publisher);

        dispatcher.run(queue).await;
        dispatcher.drain(shutdown_ctx(Duration::from_secs(5))).await.unwrap();

        assert_eq!(handler.calls(), 2);
        assert_eq!(ledger.acked(), 1);
        assert_eq!(ledger.requeued(), 1);
        assert_eq!(
            metrics.snapshot().events_with("material_uploaded", DeliveryOutcome::Acked),
            1
        );
    }

    #[tokio::test]
    async fn test_rejects_after_intake_stopped() {
        let (dispatcher, handler) = dispatcher(ScriptedHandler::succeeding());
        let metrics = Metrics::new();
        let dispatcher = dispatcher.with_metrics(Arc::new(metrics.clone()));
        let (publisher, queue) = ChannelQueue::bounded(8);
        let ledger = queue.ledger();
        publisher.publish("student.enrolled", body("student_enrolled")).await.unwrap();

        dispatcher.stop();
        let mut queue = queue;
        let delivery = queue.next_delivery().await.unwrap();
        dispatcher.dispatch(delivery).await;

        assert_eq!(handler.calls(), 0);
        assert_eq!(ledger.settlements()[0].kind, Settlement::Nacked { requeue: true });
        assert_eq!(metrics.events_rejected(), 1);
    }

    #[tokio::test]
    async fn test_limiter_keyed_by_event_type() {
        let handler = Arc::new(ScriptedHandler::succeeding());
        let limiter = Arc::new(
            MultiKeyLimiter::builder()
                .policy("material_uploaded", RatePolicy::new(1.0, 1.0))
                .build(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&handler), Arc::clone(&limiter));
        let (publisher, queue) = ChannelQueue::bounded(8);
        let ledger = queue.ledger();

        publisher.publish("x", body("material_uploaded")).await.unwrap();
        publisher.publish("x", body("material_uploaded")).await.unwrap();
        publisher.publish("x", body("student_enrolled")).await.unwrap();
        drop(publisher);
        dispatcher.run(queue).await;

        // One upload is admitted, the other waits for a token that won't come
        // within the test; the unthrottled type goes straight through.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ledger.acked(), 2);
        assert_eq!(dispatcher.in_flight(), 1);

        // Shutdown interrupts the limiter wait and requeues the message.
        dispatcher.drain(shutdown_ctx(Duration::from_secs(5))).await.unwrap();
        assert_eq!(ledger.requeued(), 1);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn test_routing_key_used_without_event_type() {
        let handler = Arc::new(ScriptedHandler::succeeding());
        let limiter = Arc::new(
            MultiKeyLimiter::builder()
                .policy("legacy.queue", RatePolicy::new(1.0, 1.0))
                .build(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&handler), Arc::clone(&limiter));
        let (publisher, queue) = ChannelQueue::bounded(8);
        publisher.publish("legacy.queue", b"not json".to_vec()).await.unwrap();
        drop(publisher);

        dispatcher.run(queue).await;
        dispatcher.drain(shutdown_ctx(Duration::from_secs(5))).await.unwrap();

        assert!(limiter.tokens("legacy.queue") < 1.0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let (dispatcher, handler) =
            dispatcher(ScriptedHandler::succeeding().with_delay(Duration::from_millis(150)));
        let (publisher, queue) = ChannelQueue::bounded(8);
        let ledger = queue.ledger();
        for _ in 0..3 {
            publisher.publish("k", body("assessment_attempt")).await.unwrap();
        }

        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(queue).await })
        };
        while handler.calls() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        dispatcher.drain(shutdown_ctx(Duration::from_secs(5))).await.unwrap();
        runner.await.unwrap();

        assert_eq!(handler.completed(), 3);
        assert_eq!(ledger.acked(), 3);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(handler.peak_in_flight(), 3, "messages are processed concurrently");
    }

    #[tokio::test]
    async fn test_drain_timeout_reports_in_flight() {
        let (dispatcher, handler) =
            dispatcher(ScriptedHandler::succeeding().with_delay(Duration::from_secs(3600)));
        let (publisher, queue) = ChannelQueue::bounded(8);
        let ledger = queue.ledger();
        publisher.publish("k", body("material_uploaded")).await.unwrap();
        publisher.publish("k", body("material_uploaded")).await.unwrap();
        drop(publisher);

        dispatcher.run(queue).await;
        while handler.calls() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = dispatcher
            .drain(shutdown_ctx(Duration::from_millis(50)))
            .await
            .unwrap_err();
        let timeout = err.downcast_ref::<DrainTimeout>().unwrap();
        assert_eq!(timeout.in_flight, 2);
        assert!(dispatcher.processing_token().is_cancelled());

        // Cancelled handlers fail and their messages are requeued.
        dispatcher.tracker.wait().await;
        assert_eq!(ledger.requeued(), 2);
        assert_eq!(handler.completed(), 0);
    }

    #[tokio::test]
    async fn test_drain_disabled_returns_immediately() {
        let (dispatcher, handler) =
            dispatcher(ScriptedHandler::succeeding().with_delay(Duration::from_secs(3600)));
        let dispatcher = dispatcher.with_drain(false);
        let (publisher, queue) = ChannelQueue::bounded(8);
        publisher.publish("k", body("material_uploaded")).await.unwrap();
        drop(publisher);

        dispatcher.run(queue).await;
        while handler.calls() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        dispatcher.drain(shutdown_ctx(Duration::from_secs(5))).await.unwrap();
        assert_eq!(dispatcher.in_flight(), 1);
        assert!(!dispatcher.processing_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_register_shutdown_stops_loop() {
        let (dispatcher, _handler) = dispatcher(ScriptedHandler::succeeding());
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        dispatcher.register_shutdown(&coordinator);
        assert_eq!(coordinator.task_count(), 1);

        let (_publisher, queue) = ChannelQueue::bounded(8);
        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run(queue).await })
        };

        coordinator.shutdown(&CancellationToken::new()).await.unwrap();
        runner.await.unwrap();
        assert!(dispatcher.intake_token().is_cancelled());
    }
}
