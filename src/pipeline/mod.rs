//! Lead classification pipeline.
//!
//! Every inbound message flows through:
//! 1. `IngestionProducer::run()` — mail source → Incoming queue
//! 2. `TriageWorker` — fast lead/not-lead verdict, leads → DeepExtraction queue
//! 3. `ExtractionWorker` — structured extraction, enrichment, `RecordSink::append()`
//!
//! Each stage runs in its own task; stages only meet through the queues.

pub mod extraction;
pub mod ingestion;
pub mod stage;
pub mod triage;
pub mod types;

pub use extraction::ExtractionWorker;
pub use ingestion::{IngestionProducer, spawn_ingestion_poller};
pub use stage::{Shutdown, Stage, StepOutcome, spawn_stage};
pub use triage::TriageWorker;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{LoopTiming, PipelineConfig};
use crate::queue::QueueStore;
use types::{CustomerLookup, ExtractionClassifier, MailSource, RecordSink, TriageClassifier};

/// The external collaborators a pipeline is built from.
pub struct Collaborators {
    pub source: Arc<dyn MailSource>,
    pub triage: Arc<dyn TriageClassifier>,
    pub extractor: Arc<dyn ExtractionClassifier>,
    pub customers: Arc<dyn CustomerLookup>,
    pub sink: Arc<dyn RecordSink>,
}

/// Scheduling knobs for a running pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// `None` runs ingestion once.
    pub poll_interval: Option<Duration>,
    pub timing: LoopTiming,
    pub lookup_timeout: Duration,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            timing: config.timing,
            lookup_timeout: config.lookup_timeout,
        }
    }
}

/// The three stages wired to one queue store.
pub struct Pipeline {
    queues: Arc<QueueStore>,
    producer: Arc<IngestionProducer>,
    triage: Arc<TriageWorker>,
    extraction: Arc<ExtractionWorker>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        let queues = QueueStore::new();
        let producer = Arc::new(IngestionProducer::new(
            collaborators.source,
            Arc::clone(&queues),
        ));
        let triage = Arc::new(TriageWorker::new(Arc::clone(&queues), collaborators.triage));
        let extraction = Arc::new(ExtractionWorker::new(
            Arc::clone(&queues),
            collaborators.extractor,
            collaborators.customers,
            collaborators.sink,
            settings.lookup_timeout,
        ));

        Self {
            queues,
            producer,
            triage,
            extraction,
            settings,
        }
    }

    pub fn queues(&self) -> &Arc<QueueStore> {
        &self.queues
    }

    pub fn producer(&self) -> &Arc<IngestionProducer> {
        &self.producer
    }

    /// Start the producer poller and both consumer loops.
    pub fn spawn(&self) -> RunningPipeline {
        let mut tasks = Vec::with_capacity(3);

        let (handle, flag) =
            spawn_ingestion_poller(Arc::clone(&self.producer), self.settings.poll_interval);
        tasks.push(Task::new("ingestion", handle, flag));

        let (handle, flag) = spawn_stage(Arc::clone(&self.triage), self.settings.timing);
        tasks.push(Task::new("triage", handle, flag));

        let (handle, flag) = spawn_stage(Arc::clone(&self.extraction), self.settings.timing);
        tasks.push(Task::new("extraction", handle, flag));

        info!("Pipeline started");
        RunningPipeline { tasks }
    }
}

struct Task {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Shutdown>,
}

impl Task {
    fn new(name: &'static str, handle: JoinHandle<()>, shutdown: Arc<Shutdown>) -> Self {
        Self {
            name,
            handle,
            shutdown,
        }
    }
}

/// Handles for the spawned stage tasks.
pub struct RunningPipeline {
    tasks: Vec<Task>,
}

impl RunningPipeline {
    /// Request shutdown of every task, then wait up to `grace` per task before
    /// aborting it. An aborted consumer loses its in-flight job.
    pub async fn shutdown(self, grace: Duration) {
        for task in &self.tasks {
            task.shutdown.request();
        }

        for mut task in self.tasks {
            match tokio::time::timeout(grace, &mut task.handle).await {
                Ok(Ok(())) => info!(task = task.name, "Task stopped"),
                Ok(Err(e)) => warn!(task = task.name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    warn!(task = task.name, "Task did not stop in time, aborting");
                    task.handle.abort();
                }
            }
        }
    }
}
