//! Integration tests for graceful shutdown.

use queue_guard::{BoxError, ShutdownCoordinator, ShutdownError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_teardown_order_mirrors_startup() {
    let order = recorder();
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

    // Registered in startup order: database, then queue consumer, then the
    // metrics server.
    for name in ["database", "consumer", "metrics server"] {
        let order = Arc::clone(&order);
        coordinator.register(name, move |_ctx| async move {
            order.lock().unwrap().push(name);
            Ok(())
        });
    }
    assert_eq!(coordinator.task_count(), 3);

    coordinator.shutdown(&CancellationToken::new()).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["metrics server", "consumer", "database"]);
    assert_eq!(coordinator.task_count(), 3);
    assert!(coordinator.is_shut_down());
}

#[tokio::test]
async fn test_failures_are_collected_not_short_circuited() {
    let order = recorder();
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

    for (name, fails) in [("a", false), ("b", true), ("c", true)] {
        let order = Arc::clone(&order);
        coordinator.register(name, move |_ctx| async move {
            order.lock().unwrap().push(name);
            if fails {
                Err(BoxError::from(format!("{name} refused to close")))
            } else {
                Ok(())
            }
        });
    }

    let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(*order.lock().unwrap(), vec!["c", "b", "a"]);
    let names: Vec<_> = err.failures().iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["c", "b"]);
    assert_eq!(
        err.to_string(),
        "shutdown completed with errors: c: c refused to close; b: b refused to close"
    );
}

#[tokio::test]
async fn test_second_shutdown_is_refused() {
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    coordinator.shutdown(&CancellationToken::new()).await.unwrap();

    let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ShutdownError::AlreadyShutDown));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_task_does_not_block_the_rest() {
    let order = recorder();
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(2));

    {
        let order = Arc::clone(&order);
        coordinator.register("database", move |ctx| async move {
            // Runs after the deadline passed; its token is already cancelled.
            assert!(ctx.token().is_cancelled());
            order.lock().unwrap().push("database");
            Ok(())
        });
    }
    coordinator.register("http server", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    });

    let started = tokio::time::Instant::now();
    let err = coordinator.shutdown(&CancellationToken::new()).await.unwrap_err();

    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].name, "http server");
    assert_eq!(*order.lock().unwrap(), vec!["database"]);
}

#[tokio::test]
async fn test_shutdown_on_external_trigger() {
    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let observed = Arc::new(Mutex::new(None));
    {
        let observed = Arc::clone(&observed);
        coordinator.register("consumer", move |ctx| async move {
            *observed.lock().unwrap() = Some(ctx.remaining() > Duration::ZERO);
            Ok(())
        });
    }

    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .shutdown_on(async {
                    let _ = rx.await;
                })
                .await
        })
    };

    tokio::task::yield_now().await;
    assert!(!coordinator.is_shut_down());

    tx.send(()).unwrap();
    waiter.await.unwrap().unwrap();

    assert!(coordinator.is_shut_down());
    assert_eq!(*observed.lock().unwrap(), Some(true));
}
