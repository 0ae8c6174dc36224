use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use exobind::Bindings;

const TIMEOUT_VAR: &str = "EXOBIND_REPLY_TIMEOUT_MS";

fn reply_timeout() -> anyhow::Result<Duration> {
    match std::env::var(TIMEOUT_VAR) {
        Ok(raw) => {
            let millis: u64 = raw.trim().parse().with_context(|| format!("{} must be a number of milliseconds, got {:?}", TIMEOUT_VAR, raw))?;
            Ok(Duration::from_millis(millis))
        }
        Err(_) => Ok(frontend::DEFAULT_REPLY_TIMEOUT),
    }
}

#[cfg(feature = "native")]
fn backend() -> exobind::NativeBackend {
    exobind::NativeBackend
}

#[cfg(not(feature = "native"))]
fn backend() -> exobind::MockBackend {
    exobind::MockBackend::builder()
        .latency(Duration::from_millis(1), Duration::from_millis(50))
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let timeout = reply_timeout()?;
    let descriptor = frontend::sample_descriptor()?;
    let bindings = Bindings::new(backend())?;

    println!("- Calling into the backend, replies arrive on its threads...");
    let report = frontend::run(&bindings, &descriptor, timeout).await;
    println!("{}", report);

    anyhow::ensure!(report.is_complete(), "backend did not answer every request within {:?}", timeout);
    Ok(())
}
