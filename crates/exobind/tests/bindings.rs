//! End-to-end tests of the request functions against the in-process backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;

use exobind::ApplicationDescriptor;
use exobind::Bindings;
use exobind::Credential;
use exobind::MockBackend;
use exobind::OperationResult;
use exobind::Outcome;

const KEY: [u8; 8] = [1, 2, 3, 5, 7, 11, 13, 17];
const WAIT: Duration = Duration::from_secs(5);

fn descriptor() -> ApplicationDescriptor {
    ApplicationDescriptor::new(1234, "Unique-App", Credential::new(KEY)).expect("valid descriptor")
}

/// Waits until the backend has returned from `expected` trampoline calls.
async fn settle(backend: &MockBackend, expected: usize) {
    let poll = async {
        while backend.fired() < expected {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    timeout(WAIT, poll).await.expect("backend never settled");
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> T {
    timeout(WAIT, rx).await.expect("timed out").expect("callback dropped without firing")
}

// --- Scenarios ---

#[tokio::test]
async fn test_register_app_reports_success() {
    let backend = MockBackend::builder().build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");

    let (tx, rx) = oneshot::channel();
    bindings.register_app(&descriptor(), move |result| {
        let _ = tx.send(result);
    });

    let result = recv(rx).await;
    assert_eq!(result, OperationResult::ok());

    settle(&backend, 1).await;
    let stats = bindings.stats();
    assert_eq!(stats.registered, 1);
    assert_eq!(stats.fired, 1);
    assert_eq!(stats.violations, 0);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test]
async fn test_get_app_id_delivers_the_id() {
    let bindings = Bindings::new(MockBackend::builder().build()).expect("bindings");

    let (tx, rx) = oneshot::channel();
    bindings.get_app_id(&descriptor(), move |result, id| {
        let _ = tx.send((result.code, id));
    });

    assert_eq!(recv(rx).await, (0, 1234));
}

#[tokio::test]
async fn test_get_app_name_outlives_the_native_buffer() {
    let backend = MockBackend::builder().build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");

    let (tx, rx) = oneshot::channel();
    bindings.get_app_name(&descriptor(), move |result, name| {
        let _ = tx.send((result, name));
    });

    let (result, name) = recv(rx).await;
    settle(&backend, 1).await;

    // The backend has zeroed and freed its buffer by now.
    assert!(result.is_ok());
    assert_eq!(name, "Unique-App");
}

#[tokio::test]
async fn test_descriptor_arrives_intact() {
    let backend = MockBackend::builder().build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");
    let sent = descriptor();

    let (tx, rx) = oneshot::channel();
    bindings.register_app(&sent, move |result| {
        let _ = tx.send(result);
    });
    recv(rx).await;

    let received = backend.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id(), 1234);
    assert_eq!(received[0].name(), "Unique-App");
    assert_eq!(received[0].credential().as_bytes(), &KEY);
    assert_eq!(received[0], sent);
}

#[tokio::test]
async fn test_backend_failure_is_delivered_as_data() {
    let outcome = Outcome::Failure { code: -11, message: "Invalid signature".into() };
    let bindings = Bindings::new(MockBackend::builder().outcome(outcome).build()).expect("bindings");
    let app = descriptor();

    let (tx_unit, rx_unit) = oneshot::channel();
    let (tx_id, rx_id) = oneshot::channel();
    let (tx_name, rx_name) = oneshot::channel();

    bindings.register_app(&app, move |result| {
        let _ = tx_unit.send(result);
    });
    bindings.get_app_id(&app, move |result, id| {
        let _ = tx_id.send((result, id));
    });
    bindings.get_app_name(&app, move |result, name| {
        let _ = tx_name.send((result, name));
    });

    let expected = OperationResult::failure(-11, "Invalid signature");
    assert_eq!(recv(rx_unit).await, expected);
    assert_eq!(recv(rx_id).await, (expected.clone(), 0));
    assert_eq!(recv(rx_name).await, (expected, String::new()));
    assert_eq!(bindings.stats().violations, 0);
}

// --- Concurrency ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_fire_exactly_once() {
    const PER_OP: usize = 40;

    let backend = MockBackend::builder()
        .latency(Duration::ZERO, Duration::from_millis(5))
        .build();
    let bindings = Arc::new(Bindings::new(backend.clone()).expect("bindings"));
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

    let mut tasks = Vec::new();
    for _ in 0..PER_OP {
        let bindings = bindings.clone();
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let app = descriptor();
            let (a, b, c) = (tx.clone(), tx.clone(), tx);
            [
                bindings.register_app(&app, move |_| {
                    let _ = a.send("register_app");
                }),
                bindings.get_app_id(&app, move |_, _| {
                    let _ = b.send("get_app_id");
                }),
                bindings.get_app_name(&app, move |_, _| {
                    let _ = c.send("get_app_name");
                }),
            ]
        }));
    }
    drop(tx);

    let mut tokens = HashSet::new();
    for task in tasks {
        for token in task.await.expect("task") {
            assert!(tokens.insert(token), "token issued twice: {}", token);
        }
    }

    let mut delivered = 0;
    while timeout(WAIT, rx.recv()).await.expect("timed out waiting for callbacks").is_some() {
        delivered += 1;
    }

    let total = PER_OP * 3;
    assert_eq!(tokens.len(), total);
    assert_eq!(delivered, total);

    settle(&backend, total).await;
    assert_eq!(backend.fired(), total);

    let stats = bindings.stats();
    assert_eq!(stats.fired, total as u64);
    assert_eq!(stats.violations, 0);
    assert_eq!(stats.outstanding, 0);
}

#[tokio::test]
async fn test_callback_can_issue_a_new_request() {
    let bindings = Arc::new(Bindings::new(MockBackend::builder().build()).expect("bindings"));

    let (tx, rx) = oneshot::channel();
    let inner = bindings.clone();
    bindings.register_app(&descriptor(), move |_| {
        inner.get_app_name(&descriptor(), move |_, name| {
            let _ = tx.send(name);
        });
    });

    assert_eq!(recv(rx).await, "Unique-App");
}

// --- Teardown ---

#[tokio::test]
async fn test_shutdown_releases_outstanding_calls() {
    let backend = MockBackend::builder().hold(true).build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");
    let app = descriptor();

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let (a, b, c) = (tx.clone(), tx.clone(), tx);
    let tokens = [
        bindings.register_app(&app, move |_| {
            let _ = a.send(());
        }),
        bindings.get_app_id(&app, move |_, _| {
            let _ = b.send(());
        }),
        bindings.get_app_name(&app, move |_, _| {
            let _ = c.send(());
        }),
    ];
    assert_eq!(backend.held(), 3);
    assert_eq!(bindings.stats().outstanding, 3);

    let teardown = bindings.shutdown();
    assert_eq!(teardown.released, 3);
    for token in tokens {
        assert!(!bindings.registry().contains(token));
    }

    // Late completions for released tokens are protocol violations.
    assert_eq!(backend.fire_held(), 3);

    let stats = bindings.stats();
    assert_eq!(stats.released, 3);
    assert_eq!(stats.fired, 0);
    assert_eq!(stats.violations, 3);

    // Every sender was dropped without a callback running.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_release_single_call() {
    let backend = MockBackend::builder().hold(true).build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");
    let app = descriptor();

    let (tx_kept, rx_kept) = oneshot::channel();
    let (tx_dropped, rx_dropped) = oneshot::channel::<i32>();

    bindings.get_app_id(&app, move |_, id| {
        let _ = tx_kept.send(id);
    });
    let dropped = bindings.get_app_id(&app, move |_, id| {
        let _ = tx_dropped.send(id);
    });

    assert!(bindings.release(dropped));
    assert!(!bindings.release(dropped));

    backend.fire_held();
    assert_eq!(recv(rx_kept).await, 1234);
    assert!(rx_dropped.await.is_err());
    assert_eq!(bindings.stats().violations, 1);
}

#[tokio::test]
async fn test_dropping_bindings_releases_pending_calls() {
    let backend = MockBackend::builder().hold(true).build();
    let bindings = Bindings::new(backend.clone()).expect("bindings");

    let (tx, rx) = oneshot::channel::<OperationResult>();
    bindings.register_app(&descriptor(), move |result| {
        let _ = tx.send(result);
    });
    drop(bindings);

    assert!(rx.await.is_err());
    // Completion for a retired registry is logged and dropped.
    assert_eq!(backend.fire_held(), 1);
}
