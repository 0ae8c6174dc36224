//! Sample caller of the application backend.
//!
//! Issues the three requests for one descriptor, waits for the replies with a
//! deadline, then tears the bindings down and reports what came back.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;

use exobind::ApplicationDescriptor;
use exobind::Backend;
use exobind::Bindings;
use exobind::Credential;
use exobind::OperationResult;
use exobind::Teardown;

/// Default wait for all replies.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(5000);

const REQUESTS: usize = 3;

/// A result delivered by one of the request callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Registered(OperationResult),
    AppId(OperationResult, i32),
    AppName(OperationResult, String),
}

impl Reply {
    pub fn result(&self) -> &OperationResult {
        match self {
            Self::Registered(result) | Self::AppId(result, _) | Self::AppName(result, _) => result,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered(result) => write!(f, "register_app -> {}", result),
            Self::AppId(result, id) => write!(f, "get_app_id -> {}, id = {}", result, id),
            Self::AppName(result, name) => write!(f, "get_app_name -> {}, name = {:?}", result, name),
        }
    }
}

/// Everything one `run` observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub replies: Vec<Reply>,
    pub teardown: Teardown,
}

impl Report {
    /// Every request answered before the deadline.
    pub fn is_complete(&self) -> bool {
        self.replies.len() == REQUESTS
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reply in &self.replies {
            writeln!(f, "- {}", reply)?;
        }
        write!(f, "- {} of {} replies, {} released unanswered", self.replies.len(), REQUESTS, self.teardown.released)
    }
}

/// The descriptor the sample registers.
pub fn sample_descriptor() -> exobind::Result<ApplicationDescriptor> {
    let credential = Credential::new([1, 2, 3, 5, 7, 11, 13, 17]);
    Ok(ApplicationDescriptor::new(1234, "Unique-App", credential)?)
}

/// Issues `register_app`, `get_app_id` and `get_app_name` for `descriptor` and
/// collects the replies until all arrive or `timeout` elapses. Requests still
/// outstanding at the deadline are released.
pub async fn run<B: Backend>(bindings: &Bindings<B>, descriptor: &ApplicationDescriptor, timeout: Duration) -> Report {
    let deadline = Instant::now() + timeout;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let reply = tx.clone();
    bindings.register_app(descriptor, move |result| {
        let _ = reply.send(Reply::Registered(result));
    });
    let reply = tx.clone();
    bindings.get_app_id(descriptor, move |result, id| {
        let _ = reply.send(Reply::AppId(result, id));
    });
    bindings.get_app_name(descriptor, move |result, name| {
        let _ = tx.send(Reply::AppName(result, name));
    });

    let mut replies = Vec::with_capacity(REQUESTS);
    while replies.len() < REQUESTS {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(reply)) => {
                info!(%reply, "reply received");
                replies.push(reply);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(received = replies.len(), ?timeout, "deadline passed with requests outstanding");
                break;
            }
        }
    }

    let teardown = bindings.shutdown();
    Report { replies, teardown }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_display_counts_released() {
        let report = Report {
            replies: vec![Reply::AppId(OperationResult::ok(), 1234)],
            teardown: Teardown { released: 2 },
        };

        assert!(!report.is_complete());
        let text = report.to_string();
        assert!(text.contains("get_app_id -> 0: OK, id = 1234"));
        assert!(text.ends_with("1 of 3 replies, 2 released unanswered"));
    }

    #[test]
    fn test_sample_descriptor() {
        let descriptor = sample_descriptor().unwrap();
        assert_eq!(descriptor.id(), 1234);
        assert_eq!(descriptor.name(), "Unique-App");
    }
}
