//! Extraction consumer — drains DeepExtraction, enriches and persists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::pipeline::stage::{Stage, StepOutcome};
use crate::pipeline::types::{
    CompositeJob, CustomerLookup, ExtractionClassifier, FinalRecord, RecordSink,
};
use crate::queue::QueueStore;

pub struct ExtractionWorker {
    queues: Arc<QueueStore>,
    extractor: Arc<dyn ExtractionClassifier>,
    customers: Arc<dyn CustomerLookup>,
    sink: Arc<dyn RecordSink>,
    lookup_timeout: Duration,
}

impl ExtractionWorker {
    pub fn new(
        queues: Arc<QueueStore>,
        extractor: Arc<dyn ExtractionClassifier>,
        customers: Arc<dyn CustomerLookup>,
        sink: Arc<dyn RecordSink>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            queues,
            extractor,
            customers,
            sink,
            lookup_timeout,
        }
    }

    /// Extract, normalize, look up the sender and persist one job.
    ///
    /// A job without an id or body is rejected before the extractor is
    /// called. A sink failure fails the job.
    pub async fn handle(&self, job: CompositeJob) -> Result<FinalRecord, PipelineError> {
        if let Err(reason) = job.item.validate() {
            return Err(PipelineError::MalformedJob {
                id: job.item.id.clone(),
                reason,
            });
        }

        let extraction = self.extractor.extract(&job.item.body).await.normalize();
        if extraction.is_failure() {
            warn!(id = %job.item.id, "Extraction fell back to review sentinel");
        }

        let is_existing_customer = self.is_existing_customer(&job.item.sender).await;
        let record = FinalRecord::assemble(job, extraction, is_existing_customer);

        self.sink.append(&record).await?;

        info!(
            id = %record.item.id,
            intent = ?record.extracted_data.intent,
            confidence = record.extracted_data.confidence_score,
            is_existing_customer,
            "Record persisted"
        );
        Ok(record)
    }

    /// Best effort: a failed or slow lookup counts as a new customer.
    async fn is_existing_customer(&self, sender: &str) -> bool {
        match tokio::time::timeout(self.lookup_timeout, self.customers.exists(sender)).await {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                warn!(sender, error = %e, "Customer lookup failed, assuming new customer");
                false
            }
            Err(_) => {
                warn!(
                    sender,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Customer lookup timed out, assuming new customer"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Stage for ExtractionWorker {
    fn name(&self) -> &'static str {
        "extraction"
    }

    async fn step(&self, idle: Duration) -> Result<StepOutcome, PipelineError> {
        match self.queues.deep_extraction().pop_wait(idle).await {
            Some(job) => {
                self.handle(job).await?;
                Ok(StepOutcome::Handled)
            }
            None => Ok(StepOutcome::Idle),
        }
    }
}
