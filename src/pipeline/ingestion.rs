//! Ingestion producer — pulls new mail and feeds the Incoming queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::MailError;
use crate::pipeline::stage::Shutdown;
use crate::pipeline::types::MailSource;
use crate::queue::QueueStore;

/// One pass: fetch, validate, enqueue.
pub struct IngestionProducer {
    source: Arc<dyn MailSource>,
    queues: Arc<QueueStore>,
}

impl IngestionProducer {
    pub fn new(source: Arc<dyn MailSource>, queues: Arc<QueueStore>) -> Self {
        Self { source, queues }
    }

    /// Fetch new items once and push every valid one to Incoming.
    ///
    /// Returns how many were enqueued. Malformed items are logged and
    /// skipped. A source failure fails the run; nothing already pushed is
    /// taken back.
    pub async fn run(&self) -> Result<usize, MailError> {
        let items = self.source.fetch_new_items().await?;
        let fetched = items.len();

        let mut enqueued = 0;
        for item in items {
            if let Err(reason) = item.validate() {
                warn!(id = %item.id, sender = %item.sender, %reason, "Malformed item skipped");
                continue;
            }
            self.queues.incoming().push(item);
            enqueued += 1;
        }

        info!(
            source = self.source.name(),
            fetched,
            enqueued,
            queue_depth = self.queues.incoming().len(),
            "Ingestion run complete"
        );
        Ok(enqueued)
    }
}

/// Spawn the producer: one run at startup, then one per `interval`.
///
/// `None` runs once and exits. Runs are sequential in this task, so two
/// runs never overlap. Returns a `JoinHandle` and shutdown handle; a
/// shutdown request ends the wait for the next tick.
pub fn spawn_ingestion_poller(
    producer: Arc<IngestionProducer>,
    interval: Option<Duration>,
) -> (JoinHandle<()>, Arc<Shutdown>) {
    let shutdown = Arc::new(Shutdown::default());
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let Some(interval) = interval else {
            info!("Ingestion running once");
            run_logged(&producer).await;
            return;
        };

        info!(?interval, "Ingestion poller started");
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Run immediately on first tick
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => {}
            }

            if shutdown.is_requested() {
                info!("Ingestion poller shutting down");
                return;
            }

            run_logged(&producer).await;
        }
    });

    (handle, shutdown_flag)
}

/// One run with errors and panics logged, never propagated.
async fn run_logged(producer: &IngestionProducer) {
    let run_id = Uuid::new_v4();
    let span = info_span!("ingestion", %run_id);

    let outcome = AssertUnwindSafe(producer.run())
        .catch_unwind()
        .instrument(span.clone())
        .await;

    let _enter = span.enter();
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(error = %e, "Ingestion run failed"),
        Err(_) => error!("Ingestion run panicked"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::types::RawItem;

    /// Mail source that replays one scripted batch per call.
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<RawItem>, MailError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Result<Vec<RawItem>, MailError>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MailSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_new_items(&self) -> Result<Vec<RawItem>, MailError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn item(id: &str, body: &str) -> RawItem {
        RawItem::new(id, "ana@agency.com", "Rooms", body)
    }

    #[tokio::test]
    async fn run_enqueues_valid_items_in_order() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            item("1", "first"),
            item("2", "second"),
        ])]));
        let producer = IngestionProducer::new(source, Arc::clone(&queues));

        assert_eq!(producer.run().await.unwrap(), 2);
        assert_eq!(queues.incoming().pop().unwrap().id, "1");
        assert_eq!(queues.incoming().pop().unwrap().id, "2");
        assert!(queues.incoming().pop().is_none());
    }

    #[tokio::test]
    async fn run_skips_malformed_items() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            item("1", "   "),
            item("", "no id"),
            item("3", "good"),
        ])]));
        let producer = IngestionProducer::new(source, Arc::clone(&queues));

        assert_eq!(producer.run().await.unwrap(), 1);
        assert_eq!(queues.incoming().len(), 1);
        assert_eq!(queues.incoming().pop().unwrap().id, "3");
    }

    #[tokio::test]
    async fn run_propagates_source_failure() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![Err(MailError::Auth {
            user: "bookings@hotel.test".into(),
        })]));
        let producer = IngestionProducer::new(source, Arc::clone(&queues));

        assert!(matches!(producer.run().await, Err(MailError::Auth { .. })));
        assert!(queues.incoming().is_empty());
    }

    #[tokio::test]
    async fn run_with_nothing_new_enqueues_nothing() {
        let queues = QueueStore::new();
        let producer = IngestionProducer::new(
            Arc::new(ScriptedSource::new(vec![])),
            Arc::clone(&queues),
        );
        assert_eq!(producer.run().await.unwrap(), 0);
        assert!(queues.incoming().is_empty());
    }

    #[tokio::test]
    async fn poller_without_interval_runs_once() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![item("1", "body")])]));
        let producer = Arc::new(IngestionProducer::new(
            Arc::clone(&source) as Arc<dyn MailSource>,
            Arc::clone(&queues),
        ));

        let (handle, _shutdown) = spawn_ingestion_poller(producer, None);
        handle.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queues.incoming().len(), 1);
    }

    #[tokio::test]
    async fn poller_keeps_going_after_failed_run() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(MailError::Protocol("boom".into())),
            Ok(vec![item("2", "body")]),
        ]));
        let producer = Arc::new(IngestionProducer::new(
            Arc::clone(&source) as Arc<dyn MailSource>,
            Arc::clone(&queues),
        ));

        let (handle, shutdown) =
            spawn_ingestion_poller(producer, Some(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.request();
        handle.await.unwrap();

        assert!(source.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(queues.incoming().pop().unwrap().id, "2");
    }

    #[tokio::test]
    async fn long_interval_stops_promptly_on_shutdown() {
        let queues = QueueStore::new();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let producer = Arc::new(IngestionProducer::new(
            Arc::clone(&source) as Arc<dyn MailSource>,
            Arc::clone(&queues),
        ));

        let (handle, shutdown) =
            spawn_ingestion_poller(producer, Some(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop before the next tick")
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
