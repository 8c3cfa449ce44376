//! End-to-end tests for the lead pipeline.
//!
//! Each test wires real classifiers (over a stub LLM) and a real JSONL sink
//! in a temp dir to a scripted mailbox, spawns the three stages and watches
//! the record stream.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use lead_pipeline::classifier::{LlmExtractor, LlmTriageClassifier, RulesEngine};
use lead_pipeline::config::LoopTiming;
use lead_pipeline::error::{LlmError, MailError};
use lead_pipeline::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider, Role};
use lead_pipeline::pipeline::types::{
    BoardBasis, CompositeJob, ExtractionIntent, FinalRecord, IntentCategory, MailSource, RawItem,
    TriageClassifier, TriageVerdict,
};
use lead_pipeline::pipeline::{Collaborators, Pipeline, PipelineSettings};
use lead_pipeline::store::JsonlRecordSink;

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const EXTRACTION_REPLY: &str = r#"{"extract_reservation_details": {
    "intent": "NEW_RFQ",
    "confidence_score": 0.95,
    "stay_dates": {"check_in_date": "2025-06-10", "check_out_date": null, "num_nights": 3},
    "accommodation": {"num_people": 4, "num_rooms": 0, "board_basis": "BB"},
    "hotel_preference": {"name": null, "star_rating": 4},
    "requester_details": {"full_name": "Ana Pop", "organization": "Agency SRL"}
}}"#;

/// Stub LLM: triage says "lead" when the message mentions rooms; extraction
/// always returns the same booking.
struct StubLlm {
    extraction_reply: String,
    extraction_calls: AtomicUsize,
}

impl StubLlm {
    fn new() -> Self {
        Self::with_extraction(EXTRACTION_REPLY)
    }

    fn with_extraction(reply: &str) -> Self {
        Self {
            extraction_reply: reply.to_string(),
            extraction_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request.system_prompt().unwrap_or_default();
        let user = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<String>();

        let content = if system.contains("extract reservation details") {
            self.extraction_calls.fetch_add(1, Ordering::SeqCst);
            self.extraction_reply.clone()
        } else if user.contains("room") {
            r#"{"triage_email_lead": {"is_reservation_lead": true, "initial_intent_type": "RFQ"}}"#
                .to_string()
        } else {
            r#"{"is_reservation_lead": false, "initial_intent_type": "OTHER"}"#.to_string()
        };

        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

/// In-memory mailbox that marks messages seen once delivered.
struct Mailbox {
    messages: Mutex<Vec<RawItem>>,
    seen: Mutex<HashSet<String>>,
}

impl Mailbox {
    fn new(messages: Vec<RawItem>) -> Self {
        Self {
            messages: Mutex::new(messages),
            seen: Mutex::new(HashSet::new()),
        }
    }

    fn deliver(&self, item: RawItem) {
        self.messages.lock().unwrap().push(item);
    }
}

#[async_trait]
impl MailSource for Mailbox {
    fn name(&self) -> &str {
        "mailbox"
    }

    async fn fetch_new_items(&self) -> Result<Vec<RawItem>, MailError> {
        let messages = self.messages.lock().unwrap();
        let mut seen = self.seen.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| seen.insert(m.id.clone()))
            .cloned()
            .collect())
    }
}

/// Triage double that panics on one id and defers to the real classifier otherwise.
struct PanicsOn {
    id: &'static str,
    inner: LlmTriageClassifier,
}

#[async_trait]
impl TriageClassifier for PanicsOn {
    async fn classify(&self, item: &RawItem) -> TriageVerdict {
        if item.id == self.id {
            panic!("classifier exploded on {}", item.id);
        }
        self.inner.classify(item).await
    }
}

fn settings(poll_interval: Option<Duration>) -> PipelineSettings {
    PipelineSettings {
        poll_interval,
        timing: LoopTiming {
            idle_delay: Duration::from_millis(10),
            error_backoff: Duration::from_millis(50),
        },
        lookup_timeout: Duration::from_millis(200),
    }
}

fn triage_over(llm: Arc<StubLlm>) -> LlmTriageClassifier {
    LlmTriageClassifier::new(llm, RulesEngine::default_rules(), Duration::from_secs(2))
}

async fn build(
    source: Arc<dyn MailSource>,
    triage: Arc<dyn TriageClassifier>,
    llm: Arc<StubLlm>,
    output: &Path,
    poll_interval: Option<Duration>,
) -> Pipeline {
    let sink = Arc::new(JsonlRecordSink::open(output).await.unwrap());
    Pipeline::new(
        Collaborators {
            source,
            triage,
            extractor: Arc::new(LlmExtractor::new(llm, Duration::from_secs(2))),
            customers: sink.clone(),
            sink,
        },
        settings(poll_interval),
    )
}

fn read_records(path: &Path) -> Vec<FinalRecord> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        // A line still being written does not parse yet.
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Wait until the stream holds at least `n` records.
async fn wait_for_records(path: &Path, n: usize) -> Vec<FinalRecord> {
    timeout(TEST_TIMEOUT, async {
        loop {
            let records = read_records(path);
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {n} record(s)"))
}

fn rfq(id: &str, sender: &str) -> RawItem {
    RawItem::new(
        id,
        sender,
        "Rooms in June",
        "Hello, we need rooms for 4 people from 10 June, 3 nights, breakfast included.",
    )
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn lead_flows_through_to_a_persisted_record() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let source = Arc::new(Mailbox::new(vec![rfq("42", "ana@agency.com")]));
    let pipeline = build(
        source,
        Arc::new(triage_over(llm.clone())),
        llm,
        &output,
        None,
    )
    .await;
    let running = pipeline.spawn();

    let records = wait_for_records(&output, 1).await;
    running.shutdown(Duration::from_secs(1)).await;

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.item.id, "42");
    assert_eq!(record.item.sender, "ana@agency.com");
    assert_eq!(record.triage_record, TriageVerdict::lead(IntentCategory::Rfq));
    assert_eq!(record.extracted_data.intent, ExtractionIntent::NewRfq);
    assert_eq!(record.extracted_data.accommodation.board_basis, BoardBasis::BedAndBreakfast);
    // Derived fields filled in after extraction.
    assert_eq!(record.extracted_data.accommodation.num_rooms, 2);
    assert_eq!(
        record.extracted_data.stay_dates.check_out_date,
        chrono::NaiveDate::from_ymd_opt(2025, 6, 13)
    );
    assert!(!record.processing_metadata.is_existing_customer);
    assert!(record.processing_metadata.triage_decision);

    // The raw line keeps the wire names.
    let raw = std::fs::read_to_string(&output).unwrap();
    let json: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(json["id"], "42");
    assert_eq!(json["triage_record"]["is_reservation_lead"], true);
    assert_eq!(json["extracted_data"]["accommodation"]["board_basis"], "BB");
}

#[tokio::test]
async fn booking_request_42_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::with_extraction(
        r#"{"intent": "NEW_RFQ", "confidence_score": 0.9,
            "stay_dates": {"check_in_date": null, "check_out_date": null, "num_nights": 3},
            "accommodation": {"num_people": 2, "num_rooms": 1, "board_basis": "BB"},
            "hotel_preference": {"name": null, "star_rating": null},
            "requester_details": {"full_name": "Unknown", "organization": null}}"#,
    ));

    let source = Arc::new(Mailbox::new(vec![RawItem::new(
        "42",
        "a@b.com",
        "Booking",
        "Need a room for 2 people, 3 nights, breakfast included",
    )]));
    let pipeline = build(
        source,
        Arc::new(triage_over(llm.clone())),
        llm,
        &output,
        None,
    )
    .await;
    let running = pipeline.spawn();
    let records = wait_for_records(&output, 1).await;
    running.shutdown(Duration::from_secs(1)).await;

    let record = &records[0];
    assert_eq!(record.item.id, "42");
    assert_eq!(record.triage_record, TriageVerdict::lead(IntentCategory::Rfq));
    let accommodation = &record.extracted_data.accommodation;
    assert_eq!(accommodation.num_people, 2);
    assert_eq!(accommodation.num_rooms, 1);
    assert_eq!(accommodation.board_basis, BoardBasis::BedAndBreakfast);
    assert_eq!(record.extracted_data.stay_dates.num_nights, 3);

    let raw = std::fs::read_to_string(&output).unwrap();
    let json: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert!(json["processing_metadata"]["is_existing_customer"].is_boolean());
}

#[tokio::test]
async fn only_leads_reach_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let source = Arc::new(Mailbox::new(vec![
        RawItem::new("1", "noreply@shop.com", "Deals", "Big sale this weekend"),
        RawItem::new("2", "colleague@hotel.test", "Lunch", "Pizza at noon?"),
        rfq("3", "ana@agency.com"),
    ]));
    let pipeline = build(
        source,
        Arc::new(triage_over(llm.clone())),
        llm.clone(),
        &output,
        None,
    )
    .await;
    let running = pipeline.spawn();

    let records = wait_for_records(&output, 1).await;
    // Give the consumers time to (not) produce anything else.
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.shutdown(Duration::from_secs(1)).await;

    let records_after = read_records(&output);
    assert_eq!(records_after.len(), 1);
    assert_eq!(records[0].item.id, "3");
    assert_eq!(llm.extraction_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_body_job_is_dropped_and_the_next_job_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let pipeline = build(
        Arc::new(Mailbox::new(vec![])),
        Arc::new(triage_over(llm.clone())),
        llm.clone(),
        &output,
        None,
    )
    .await;

    // Bypass the producer's validation to reach the extraction guard.
    let queue = pipeline.queues().deep_extraction();
    queue.push(CompositeJob {
        item: RawItem::new("42", "a@b.com", "Room", ""),
        verdict: TriageVerdict::lead(IntentCategory::Rfq),
    });
    queue.push(CompositeJob {
        item: rfq("43", "ana@agency.com"),
        verdict: TriageVerdict::lead(IntentCategory::Rfq),
    });

    let running = pipeline.spawn();
    let records = wait_for_records(&output, 1).await;
    running.shutdown(Duration::from_secs(1)).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].item.id, "43");
    assert!(records.iter().all(|r| r.item.id != "42"));
    // The empty job never reached the extractor.
    assert_eq!(llm.extraction_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn triage_panic_loses_one_job_only() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let source = Arc::new(Mailbox::new(vec![
        rfq("1", "ana@agency.com"),
        rfq("2", "bob@agency.com"),
    ]));
    let triage = Arc::new(PanicsOn {
        id: "1",
        inner: triage_over(llm.clone()),
    });
    let pipeline = build(source, triage, llm, &output, None).await;
    let running = pipeline.spawn();

    let records = wait_for_records(&output, 1).await;
    running.shutdown(Duration::from_secs(1)).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].item.id, "2");
}

#[tokio::test]
async fn delivered_items_are_not_reprocessed_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let mailbox = Arc::new(Mailbox::new(vec![rfq("1", "ana@agency.com")]));
    let pipeline = build(
        Arc::clone(&mailbox) as Arc<dyn MailSource>,
        Arc::new(triage_over(llm.clone())),
        llm,
        &output,
        Some(Duration::from_millis(30)),
    )
    .await;
    let running = pipeline.spawn();

    wait_for_records(&output, 1).await;
    mailbox.deliver(rfq("2", "ana@agency.com"));
    let records = wait_for_records(&output, 2).await;

    // Several more polls with nothing new.
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.shutdown(Duration::from_secs(1)).await;

    let records_after = read_records(&output);
    assert_eq!(records_after.len(), 2);
    assert_eq!(records[0].item.id, "1");
    assert_eq!(records[1].item.id, "2");
    // Same sender seen before the second record.
    assert!(!records[0].processing_metadata.is_existing_customer);
    assert!(records[1].processing_metadata.is_existing_customer);
}

#[tokio::test]
async fn producer_run_counts_enqueued_items() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("leads.jsonl");
    let llm = Arc::new(StubLlm::new());

    let pipeline = build(
        Arc::new(Mailbox::new(vec![
            rfq("1", "ana@agency.com"),
            RawItem::new("2", "ana@agency.com", "blank", " "),
        ])),
        Arc::new(triage_over(llm.clone())),
        llm,
        &output,
        None,
    )
    .await;

    assert_eq!(pipeline.producer().run().await.unwrap(), 1);
    assert_eq!(pipeline.producer().run().await.unwrap(), 0);
    assert_eq!(pipeline.queues().incoming().len(), 1);
}
