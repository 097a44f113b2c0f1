//! Staged asynchronous post-processing of accepted alert events.
//!
//! Stages are chained by channels: stage *i*'s output feeds stage
//! *i+1*'s input, ordered by the stage key. Closing the head input
//! cascades stage by stage, so shutdown drains without deadlock.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::AlertEvent;
use crate::store::Store;

pub mod aggregator;
pub mod inhibitor;

pub use aggregator::Aggregator;
pub use inhibitor::Inhibitor;

/// Channel capacity between stages; bounds memory under bursts and
/// provides backpressure to the engine.
pub const STAGE_CHANNEL_CAPACITY: usize = 64;

/// A pipeline stage. `process` spawns the stage's worker and returns
/// its output channel; the worker must close the output (by dropping
/// the sender) when its input closes, and must never block
/// indefinitely once `token` is cancelled.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Sort key; lower stages run earlier in the chain.
    fn stage(&self) -> usize;

    async fn process(
        self: Arc<Self>,
        token: CancellationToken,
        store: Arc<dyn Store>,
        input: mpsc::Receiver<AlertEvent>,
    ) -> mpsc::Receiver<AlertEvent>;
}

/// Send that gives up at shutdown instead of blocking on a full
/// downstream buffer. Returns false when the event could not be
/// delivered.
pub(crate) async fn send_or_cancelled(
    tx: &mpsc::Sender<AlertEvent>,
    token: &CancellationToken,
    event: AlertEvent,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[derive(Default)]
pub struct ProcessorPipeline {
    processors: Vec<Arc<dyn Processor>>,
}

impl ProcessorPipeline {
    pub fn new() -> Self {
        ProcessorPipeline::default()
    }

    pub fn add(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Wire the stages in ascending stage order, head fed by `input`,
    /// and spawn a terminal collector that drains the tail.
    pub async fn run(
        mut self,
        token: CancellationToken,
        store: Arc<dyn Store>,
        input: mpsc::Receiver<AlertEvent>,
    ) {
        self.processors.sort_by_key(|p| p.stage());
        let mut chain = input;
        for processor in self.processors {
            info!(
                "starting processor {} at stage {}",
                processor.name(),
                processor.stage()
            );
            chain = processor
                .process(token.clone(), store.clone(), chain)
                .await;
        }
        tokio::spawn(async move {
            while chain.recv().await.is_some() {}
            debug!("processor pipeline drained");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, Severity};
    use crate::store::MemStore;
    use crate::testutil::mock_alert;
    use std::sync::Mutex;
    use pretty_assertions::assert_eq;

    /// Marks the first event it sees as suppressed.
    struct MarkFirst;

    #[async_trait]
    impl Processor for MarkFirst {
        fn name(&self) -> &str {
            "mark-first"
        }

        fn stage(&self) -> usize {
            1
        }

        async fn process(
            self: Arc<Self>,
            token: CancellationToken,
            _store: Arc<dyn Store>,
            mut input: mpsc::Receiver<AlertEvent>,
        ) -> mpsc::Receiver<AlertEvent> {
            let (tx, rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let mut first = true;
                while let Some(mut event) = input.recv().await {
                    if first {
                        event.event_type = EventType::Suppressed;
                        first = false;
                    }
                    if !send_or_cancelled(&tx, &token, event).await {
                        return;
                    }
                }
            });
            rx
        }
    }

    /// Drops suppressed events.
    struct DropSuppressed;

    #[async_trait]
    impl Processor for DropSuppressed {
        fn name(&self) -> &str {
            "drop-suppressed"
        }

        fn stage(&self) -> usize {
            2
        }

        async fn process(
            self: Arc<Self>,
            token: CancellationToken,
            _store: Arc<dyn Store>,
            mut input: mpsc::Receiver<AlertEvent>,
        ) -> mpsc::Receiver<AlertEvent> {
            let (tx, rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                while let Some(event) = input.recv().await {
                    if event.event_type == EventType::Suppressed {
                        continue;
                    }
                    if !send_or_cancelled(&tx, &token, event).await {
                        return;
                    }
                }
            });
            rx
        }
    }

    struct Collector {
        received: Arc<Mutex<Vec<AlertEvent>>>,
        done: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Processor for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn stage(&self) -> usize {
            3
        }

        async fn process(
            self: Arc<Self>,
            _token: CancellationToken,
            _store: Arc<dyn Store>,
            mut input: mpsc::Receiver<AlertEvent>,
        ) -> mpsc::Receiver<AlertEvent> {
            let (_tx, rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
            let received = self.received.clone();
            let done = self.done.clone();
            tokio::spawn(async move {
                while let Some(event) = input.recv().await {
                    received.lock().unwrap().push(event);
                }
                done.notify_one();
            });
            rx
        }
    }

    #[tokio::test]
    async fn stages_run_in_order_and_drops_do_not_propagate() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(tokio::sync::Notify::new());

        let mut pipeline = ProcessorPipeline::new();
        // registration order is deliberately shuffled; stage() decides
        pipeline.add(Arc::new(DropSuppressed));
        pipeline.add(Arc::new(MarkFirst));
        pipeline.add(Arc::new(Collector { received: received.clone(), done: done.clone() }));

        let (tx, rx) = mpsc::channel(4);
        let first = AlertEvent::new(mock_alert(1, "A", "e1", None, Severity::Info), EventType::Active);
        let second = AlertEvent::new(mock_alert(2, "B", "e2", None, Severity::Info), EventType::Active);
        tx.send(first).await.unwrap();
        tx.send(second.clone()).await.unwrap();
        drop(tx);

        let token = CancellationToken::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        pipeline.run(token, store, rx).await;

        done.notified().await;
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(*received, vec![second]);
    }

    #[tokio::test]
    async fn closing_input_cascades_shutdown() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(tokio::sync::Notify::new());

        let mut pipeline = ProcessorPipeline::new();
        pipeline.add(Arc::new(MarkFirst));
        pipeline.add(Arc::new(Collector { received, done: done.clone() }));

        let (tx, rx) = mpsc::channel::<AlertEvent>(1);
        let token = CancellationToken::new();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        pipeline.run(token, store, rx).await;

        drop(tx);
        // collector observes the cascade and finishes
        done.notified().await;
    }
}
