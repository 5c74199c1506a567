//! Worker example wiring every component together.
//!
//! A publisher feeds a burst of events into an in-process queue. Uploaded
//! materials go through a flaky object store and text generator, each guarded
//! by a circuit breaker and retried with backoff. The worker stops on Ctrl-C,
//! or by itself after a few seconds, draining in-flight messages first.
//!
//! Run with `cargo run --example worker`, optionally passing a JSON config
//! path as the first argument.

use async_trait::async_trait;
use queue_guard::infrastructure::logging;
use queue_guard::{
    termination_signal, with_retry, BreakerObjectStore, BreakerTextGenerator, ChannelQueue,
    CircuitBreaker, Dispatcher, Error, Metrics, MetricsRecorder, ObjectStore, Processor,
    ProcessorRegistry, Quiz, Result, RetryPolicy, ShutdownCoordinator, Summary, TextGenerator,
    WorkerConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Object store that fails every third call.
#[derive(Debug, Default)]
struct FlakyStore {
    calls: AtomicUsize,
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 3 == 2 {
            return Err(Error::transient(format!("timeout downloading {key}")));
        }
        Ok(b"Photosynthesis converts light into chemical energy.".to_vec())
    }

    async fn upload(&self, _key: &str, _content: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate_summary(&self, text: &str) -> Result<Summary> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Summary {
            main_ideas: vec![text.to_string()],
            word_count: text.split_whitespace().count(),
            ..Summary::default()
        })
    }

    async fn generate_quiz(&self, _text: &str, _question_count: usize) -> Result<Quiz> {
        Ok(Quiz::default())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

struct MaterialUploaded<S, G> {
    store: S,
    generator: G,
    retry: RetryPolicy,
}

#[async_trait]
impl<S: ObjectStore, G: TextGenerator> Processor for MaterialUploaded<S, G> {
    fn event_type(&self) -> &str {
        "material_uploaded"
    }

    async fn process(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<()> {
        let event: serde_json::Value = serde_json::from_slice(payload).map_err(Error::permanent)?;
        let key = event["file_url"]
            .as_str()
            .ok_or_else(|| Error::permanent("missing file_url"))?
            .to_string();

        let content = with_retry(cancel, &self.retry, || self.store.download(&key)).await?;
        let text = String::from_utf8_lossy(&content);
        let summary = with_retry(cancel, &self.retry, || self.generator.generate_summary(&text)).await?;

        tracing::info!(file_url = %key, words = summary.word_count, "material summarised");
        Ok(())
    }
}

struct MaterialDeleted;

#[async_trait]
impl Processor for MaterialDeleted {
    fn event_type(&self) -> &str {
        "material_deleted"
    }

    async fn process(&self, _cancel: &CancellationToken, _payload: &[u8]) -> Result<()> {
        tracing::info!("material removed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => WorkerConfig::from_path(path)?,
        None => WorkerConfig::from_json_str(
            r#"{
                "rate_limiter": {
                    "default": { "requests_per_second": 20, "burst_size": 5 },
                    "by_event_type": {
                        "material_uploaded": { "requests_per_second": 4, "burst_size": 2 }
                    }
                },
                "retry": { "max_attempts": 3, "initial_backoff_ms": 100, "max_backoff_ms": 400 },
                "shutdown": { "timeout_ms": 5000 }
            }"#,
        )?,
    };
    logging::init(&config.logging);

    let metrics = Arc::new(Metrics::new());
    let recorder: Arc<dyn MetricsRecorder> = metrics.clone();

    let limiter = Arc::new(config.rate_limiter.build_limiter(recorder.clone()));

    let storage_breaker = Arc::new(
        CircuitBreaker::new(config.circuit_breakers.storage.to_config("storage"))
            .with_metrics(recorder.clone()),
    );
    let nlp_breaker = Arc::new(
        CircuitBreaker::new(config.circuit_breakers.nlp.to_config("nlp")).with_metrics(recorder.clone()),
    );

    let registry = Arc::new(ProcessorRegistry::new());
    registry.register(Arc::new(MaterialUploaded {
        store: BreakerObjectStore::new(FlakyStore::default(), storage_breaker),
        generator: BreakerTextGenerator::new(EchoGenerator, nlp_breaker),
        retry: config.retry.policy(),
    }));
    registry.register(Arc::new(MaterialDeleted));

    let dispatcher = Dispatcher::new(registry, limiter)
        .with_metrics(recorder)
        .with_drain(config.shutdown.wait_for_messages);

    let coordinator = ShutdownCoordinator::new(config.shutdown.timeout());
    let summary = metrics.clone();
    coordinator.register("metrics", move |_ctx| async move {
        let snapshot = summary.snapshot();
        tracing::info!(
            acked = snapshot.events_acked,
            requeued = snapshot.events_requeued,
            rejected = snapshot.events_rejected,
            "final message counts"
        );
        Ok(())
    });
    dispatcher.register_shutdown(&coordinator);

    let (publisher, queue) = ChannelQueue::bounded(64);
    let queue = queue.with_redelivery();
    let ledger = queue.ledger();

    let intake = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run(queue).await }
    });

    for i in 0..12 {
        let body = if i % 4 == 3 {
            serde_json::json!({ "event_type": "material_deleted", "material_id": i })
        } else {
            serde_json::json!({ "event_type": "material_uploaded", "file_url": format!("materials/{i}.txt") })
        };
        publisher.publish("worker.events", body.to_string()).await?;
    }
    publisher.publish("worker.events", r#"{"event_type":"course_archived"}"#).await?;

    let trigger = async {
        tokio::select! {
            _ = termination_signal() => {},
            _ = tokio::time::sleep(Duration::from_secs(4)) => {},
        }
    };
    if let Err(err) = coordinator.shutdown_on(trigger).await {
        tracing::error!(error = %err, "shutdown finished with errors");
    }
    intake.await?;

    println!(
        "settled {} deliveries ({} acked, {} requeued)",
        ledger.len(),
        ledger.acked(),
        ledger.requeued()
    );
    Ok(())
}
