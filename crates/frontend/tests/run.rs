use std::time::Duration;

use exobind::Bindings;
use exobind::MockBackend;
use exobind::OperationResult;
use exobind::Outcome;
use frontend::Reply;

#[tokio::test]
async fn test_run_collects_all_replies() -> anyhow::Result<()> {
    let backend = MockBackend::builder()
        .latency(Duration::ZERO, Duration::from_millis(10))
        .build();
    let bindings = Bindings::new(backend)?;

    let report = frontend::run(&bindings, &frontend::sample_descriptor()?, Duration::from_secs(5)).await;

    assert!(report.is_complete());
    assert_eq!(report.teardown.released, 0);
    assert!(report.replies.contains(&Reply::Registered(OperationResult::ok())));
    assert!(report.replies.contains(&Reply::AppId(OperationResult::ok(), 1234)));
    assert!(report.replies.contains(&Reply::AppName(OperationResult::ok(), "Unique-App".into())));
    Ok(())
}

#[tokio::test]
async fn test_run_reports_backend_failure() -> anyhow::Result<()> {
    let outcome = Outcome::Failure { code: -11, message: "Invalid signature".into() };
    let bindings = Bindings::new(MockBackend::builder().outcome(outcome).build())?;

    let report = frontend::run(&bindings, &frontend::sample_descriptor()?, Duration::from_secs(5)).await;

    assert!(report.is_complete());
    for reply in &report.replies {
        assert_eq!(reply.result().code, -11);
    }
    Ok(())
}

#[tokio::test]
async fn test_run_releases_unanswered_requests_at_deadline() -> anyhow::Result<()> {
    let backend = MockBackend::builder().hold(true).build();
    let bindings = Bindings::new(backend.clone())?;

    let report = frontend::run(&bindings, &frontend::sample_descriptor()?, Duration::from_millis(50)).await;

    assert!(report.replies.is_empty());
    assert_eq!(report.teardown.released, 3);

    // The backend answering late changes nothing.
    assert_eq!(backend.fire_held(), 3);
    assert_eq!(bindings.stats().fired, 0);
    assert_eq!(bindings.stats().violations, 3);
    Ok(())
}
