//! Output plumbing: named consumers draining the notifier's per-output
//! channels. Delivery failures are logged and counted, never
//! propagated.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::AlertEvent;
use crate::stats::Counter;

pub mod webhook;

pub use webhook::WebhookOutput;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct OutputError(pub String);

/// A named downstream receiver of alert events.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, event: &AlertEvent) -> Result<(), OutputError>;
}

/// Drain one output's channel until it closes or shutdown.
pub fn spawn_output(
    output: Arc<dyn Output>,
    mut rx: mpsc::Receiver<AlertEvent>,
    token: CancellationToken,
    errors: Counter,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(event) = maybe else { return };
                    if let Err(e) = output.send(&event).await {
                        warn!("output {} failed to deliver event: {e}", output.name());
                        errors.add(1);
                    }
                }
                _ = token.cancelled() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Alert, EventType, Severity};
    use crate::stats::StatsRegistry;
    use std::sync::Mutex;

    struct Failing {
        attempts: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Output for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _event: &AlertEvent) -> Result<(), OutputError> {
            *self.attempts.lock().unwrap() += 1;
            Err(OutputError("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn delivery_failures_are_counted_not_fatal() {
        let stats = StatsRegistry::new();
        let errors = stats.counter("output.errors");
        let attempts = Arc::new(Mutex::new(0));
        let (tx, rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = spawn_output(
            Arc::new(Failing { attempts: attempts.clone() }),
            rx,
            token,
            errors.clone(),
        );

        let event = AlertEvent::new(
            Alert::new("X", "src", "e1", Severity::Info),
            EventType::Active,
        );
        tx.send(event.clone()).await.unwrap();
        tx.send(event).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*attempts.lock().unwrap(), 2);
        assert_eq!(errors.value(), 2);
    }
}
