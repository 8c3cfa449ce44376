//! Triage consumer — drains Incoming and routes leads to DeepExtraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::stage::{Stage, StepOutcome};
use crate::pipeline::types::{CompositeJob, RawItem, TriageClassifier, TriageVerdict};
use crate::queue::QueueStore;

pub struct TriageWorker {
    queues: Arc<QueueStore>,
    classifier: Arc<dyn TriageClassifier>,
}

impl TriageWorker {
    pub fn new(queues: Arc<QueueStore>, classifier: Arc<dyn TriageClassifier>) -> Self {
        Self { queues, classifier }
    }

    /// Classify one item; leads move on to extraction, the rest are discarded.
    pub async fn handle(&self, item: RawItem) -> TriageVerdict {
        let verdict = self.classifier.classify(&item).await;

        if verdict.is_lead {
            info!(
                id = %item.id,
                intent = %verdict.intent,
                "Lead confirmed, queued for deep extraction"
            );
            self.queues
                .deep_extraction()
                .push(CompositeJob { item, verdict });
        } else {
            info!(
                id = %item.id,
                sender = %item.sender,
                intent = %verdict.intent,
                "Not a lead, discarded"
            );
        }
        verdict
    }
}

#[async_trait]
impl Stage for TriageWorker {
    fn name(&self) -> &'static str {
        "triage"
    }

    async fn step(&self, idle: Duration) -> Result<StepOutcome, PipelineError> {
        match self.queues.incoming().pop_wait(idle).await {
            Some(item) => {
                self.handle(item).await;
                Ok(StepOutcome::Handled)
            }
            None => Ok(StepOutcome::Idle),
        }
    }
}
