//! End-to-end tests of the dispatch pipeline: queue, limiter, handler and
//! graceful shutdown working together.

#![cfg(feature = "test-helpers")]

use async_trait::async_trait;
use queue_guard::infrastructure::mocks::{MockCaptureLayer, ScriptedHandler};
use queue_guard::{
    BoxError, ChannelQueue, DeliveryOutcome, Dispatcher, Error, Metrics, MultiKeyLimiter,
    Processor, ProcessorRegistry, RatePolicy, Result, Settlement, ShutdownCoordinator,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;

fn event(event_type: &str, id: usize) -> Vec<u8> {
    serde_json::json!({ "event_type": event_type, "material_id": id })
        .to_string()
        .into_bytes()
}

struct Recording {
    event_type: &'static str,
    seen: AtomicUsize,
    fail_first: AtomicUsize,
}

impl Recording {
    fn new(event_type: &'static str) -> Arc<Self> {
        Self::failing_first(event_type, 0)
    }

    fn failing_first(event_type: &'static str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            event_type,
            seen: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(failures),
        })
    }
}

#[async_trait]
impl Processor for Recording {
    fn event_type(&self) -> &str {
        self.event_type
    }

    async fn process(&self, _cancel: &CancellationToken, _payload: &[u8]) -> Result<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::transient("database unavailable"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_registry_pipeline_acks_and_requeues() {
    let uploaded = Recording::new("material_uploaded");
    let attempts = Recording::failing_first("assessment_attempt", 1);
    let registry = Arc::new(ProcessorRegistry::new());
    registry.register(uploaded.clone());
    registry.register(attempts.clone());

    let metrics = Metrics::new();
    let dispatcher = Dispatcher::new(registry, Arc::new(MultiKeyLimiter::unthrottled()))
        .with_metrics(Arc::new(metrics.clone()));

    let (publisher, queue) = ChannelQueue::bounded(16);
    let queue = queue.with_redelivery();
    let ledger = queue.ledger();

    for i in 0..3 {
        publisher.publish("events", event("material_uploaded", i)).await.unwrap();
    }
    publisher.publish("events", event("assessment_attempt", 9)).await.unwrap();
    publisher.publish("events", event("course_archived", 10)).await.unwrap();

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(queue).await })
    };

    // The failed attempt comes back once through redelivery.
    while attempts.seen.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    dispatcher.register_shutdown(&coordinator);
    drop(publisher);
    coordinator.shutdown(&CancellationToken::new()).await.unwrap();
    runner.await.unwrap();

    assert_eq!(uploaded.seen.load(Ordering::SeqCst), 3);
    assert_eq!(attempts.seen.load(Ordering::SeqCst), 2);

    let acked: Vec<_> = ledger
        .settlements()
        .into_iter()
        .filter(|s| s.kind == Settlement::Acked)
        .collect();
    // Three uploads, the retried attempt, and the unknown type.
    assert_eq!(acked.len(), 5);
    assert!(acked.iter().any(|s| s.redelivered));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.events_with("material_uploaded", DeliveryOutcome::Acked), 3);
    assert_eq!(snapshot.events_with("assessment_attempt", DeliveryOutcome::Requeued), 1);
    assert_eq!(snapshot.events_with("course_archived", DeliveryOutcome::Acked), 1);
    assert_eq!(snapshot.total_events(), 6);
}

#[tokio::test]
async fn test_rate_limit_spreads_admissions() {
    let handler = Arc::new(ScriptedHandler::succeeding());
    let limiter = Arc::new(
        MultiKeyLimiter::builder()
            .policy("material_uploaded", RatePolicy::new(10.0, 2.0))
            .build(),
    );
    let dispatcher = Dispatcher::new(Arc::clone(&handler), limiter);
    let (publisher, queue) = ChannelQueue::bounded(16);
    let ledger = queue.ledger();

    for i in 0..4 {
        publisher.publish("events", event("material_uploaded", i)).await.unwrap();
    }
    publisher.publish("events", event("student_enrolled", 7)).await.unwrap();
    drop(publisher);

    dispatcher.run(queue).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The burst and the unthrottled type go straight through; two uploads wait.
    assert_eq!(handler.calls(), 3);
    assert_eq!(dispatcher.in_flight(), 2);

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    dispatcher.register_shutdown(&coordinator);

    // Two more tokens arrive within 200ms.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handler.calls(), 5);

    coordinator.shutdown(&CancellationToken::new()).await.unwrap();
    assert_eq!(ledger.acked(), 5);
}

#[tokio::test]
async fn test_shutdown_drains_before_later_teardown() {
    let handler = Arc::new(ScriptedHandler::succeeding().with_delay(Duration::from_millis(100)));
    let dispatcher = Dispatcher::new(Arc::clone(&handler), Arc::new(MultiKeyLimiter::unthrottled()));
    let (publisher, queue) = ChannelQueue::bounded(16);
    let ledger = queue.ledger();

    let order = Arc::new(Mutex::new(Vec::new()));
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    {
        let order = Arc::clone(&order);
        let ledger = ledger.clone();
        coordinator.register("broker connection", move |_ctx| async move {
            order.lock().unwrap().push(format!("broker closed after {} acks", ledger.acked()));
            Ok(())
        });
    }
    dispatcher.register_shutdown(&coordinator);

    for i in 0..4 {
        publisher.publish("events", event("material_uploaded", i)).await.unwrap();
    }
    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(queue).await })
    };
    while handler.calls() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    coordinator.shutdown(&CancellationToken::new()).await.unwrap();
    runner.await.unwrap();

    assert_eq!(handler.completed(), 4);
    assert_eq!(*order.lock().unwrap(), vec!["broker closed after 4 acks".to_string()]);
}

#[tokio::test]
async fn test_drain_timeout_is_reported_and_logged() {
    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let handler = Arc::new(
        ScriptedHandler::succeeding().with_delay(Duration::from_secs(60)),
    );
    let dispatcher = Dispatcher::new(Arc::clone(&handler), Arc::new(MultiKeyLimiter::unthrottled()));
    let (publisher, queue) = ChannelQueue::bounded(4);
    let ledger = queue.ledger();
    publisher.publish("events", event("material_uploaded", 1)).await.unwrap();

    let runner = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(queue).await })
    };
    while handler.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let closed = Arc::new(AtomicUsize::new(0));
    let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
    {
        let closed = Arc::clone(&closed);
        coordinator.register("database", move |_ctx| async move {
            closed.fetch_add(1, Ordering::SeqCst);
            Ok::<(), BoxError>(())
        });
    }
    dispatcher.register_shutdown(&coordinator);

    let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();
    runner.await.unwrap();

    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].name, "dispatcher");
    assert!(err.to_string().contains("1 message(s) still in flight"));
    assert_eq!(closed.load(Ordering::SeqCst), 1, "later tasks still run");

    // The processing token was cancelled, so the handler gave up and the
    // message went back to the queue.
    while dispatcher.in_flight() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ledger.requeued(), 1);
    assert_eq!(handler.completed(), 0);
    assert_eq!(capture.matching("drain deadline exceeded").len(), 1);
}
