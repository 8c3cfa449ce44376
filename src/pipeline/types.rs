//! Shared types for the lead pipeline.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MailError, PersistenceError};

// ── Raw item ────────────────────────────────────────────────────────

/// Sender recorded for a message with no usable `From` address. Never
/// counts as a known customer.
pub const UNKNOWN_SENDER: &str = "unknown";

/// One ingested message, as produced by a `MailSource`.
///
/// Read-only once enqueued. Carried unchanged into the composite job and
/// the final record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Stable identifier from the source system (IMAP UID).
    pub id: String,
    /// Sender address.
    pub sender: String,
    /// Subject line.
    pub subject: String,
    /// Full plain-text body.
    pub body: String,
    /// `Date` header of the message, when present and parseable.
    pub sent_at: Option<DateTime<Utc>>,
    /// When this system ingested the message.
    pub ingested_at: DateTime<Utc>,
}

impl RawItem {
    /// Build an item stamped with the current ingestion time.
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            sent_at: None,
            ingested_at: Utc::now(),
        }
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    /// Check the enqueue invariant. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("missing identifier".into());
        }
        if self.body.trim().is_empty() {
            return Err("missing body text".into());
        }
        Ok(())
    }
}

// ── Triage ──────────────────────────────────────────────────────────

/// Why a message was sent, as judged by triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentCategory {
    Rfq,
    FollowUp,
    NoiseSpam,
    Complaint,
    Other,
    /// Only produced by the classifier fallback.
    Failure,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rfq => "RFQ",
            Self::FollowUp => "FOLLOW_UP",
            Self::NoiseSpam => "NOISE_SPAM",
            Self::Complaint => "COMPLAINT",
            Self::Other => "OTHER",
            Self::Failure => "FAILURE",
        }
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the triage classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageVerdict {
    #[serde(rename = "is_reservation_lead")]
    pub is_lead: bool,
    #[serde(rename = "initial_intent_type")]
    pub intent: IntentCategory,
}

impl TriageVerdict {
    pub fn lead(intent: IntentCategory) -> Self {
        Self {
            is_lead: true,
            intent,
        }
    }

    pub fn not_lead(intent: IntentCategory) -> Self {
        Self {
            is_lead: false,
            intent,
        }
    }

    /// Safe default returned when classification fails.
    pub fn failure() -> Self {
        Self::not_lead(IntentCategory::Failure)
    }
}

/// A triaged lead on its way to deep extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeJob {
    pub item: RawItem,
    pub verdict: TriageVerdict,
}

// ── Extraction ──────────────────────────────────────────────────────

/// Intent as refined by deep extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionIntent {
    NewRfq,
    FollowUpOrder,
    NewRfqAfterPrevious,
    Cancellation,
    OtherInquiry,
    /// Only produced by the extractor fallback.
    FailureReviewNeeded,
}

/// Meal-inclusion plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoardBasis {
    /// Room only.
    #[serde(rename = "RO")]
    RoomOnly,
    /// Bed and breakfast.
    #[serde(rename = "BB")]
    BedAndBreakfast,
    #[serde(rename = "HB")]
    HalfBoard,
    #[serde(rename = "FB")]
    FullBoard,
    #[serde(rename = "AI")]
    AllInclusive,
    #[default]
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StayDates {
    #[serde(default, deserialize_with = "lenient_date")]
    pub check_in_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub check_out_date: Option<NaiveDate>,
    pub num_nights: u32,
}

/// Accept `YYYY-MM-DD` or an RFC 3339 timestamp; anything else ("TBD", "",
/// a number) becomes `None` rather than failing the whole result.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = value.as_str().and_then(|s| {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
    });
    if parsed.is_none() && !value.as_str().is_some_and(|s| s.trim().is_empty()) {
        warn!(value = %value, "Unparseable stay date, treating as unknown");
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accommodation {
    pub num_people: u32,
    pub num_rooms: u32,
    pub board_basis: BoardBasis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotelPreference {
    pub name: Option<String>,
    pub star_rating: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterDetails {
    pub full_name: String,
    pub organization: Option<String>,
}

/// Structured booking fields produced by the deep-extraction classifier.
///
/// Every field is always serialized; nullable ones become `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub intent: ExtractionIntent,
    pub confidence_score: f64,
    pub stay_dates: StayDates,
    pub accommodation: Accommodation,
    pub hotel_preference: HotelPreference,
    pub requester_details: RequesterDetails,
}

impl ExtractionResult {
    /// The sentinel substituted when extraction fails. Same schema, neutral values.
    pub fn failure() -> Self {
        Self {
            intent: ExtractionIntent::FailureReviewNeeded,
            confidence_score: 0.0,
            stay_dates: StayDates {
                check_in_date: None,
                check_out_date: None,
                num_nights: 0,
            },
            accommodation: Accommodation {
                num_people: 0,
                num_rooms: 0,
                board_basis: BoardBasis::Unknown,
            },
            hotel_preference: HotelPreference {
                name: None,
                star_rating: None,
            },
            requester_details: RequesterDetails {
                full_name: "ERROR".into(),
                organization: None,
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        self.intent == ExtractionIntent::FailureReviewNeeded
    }

    /// Fill in fields derivable from the others.
    ///
    /// - rooms from people at two per room, rounded up
    /// - nights from the two dates
    /// - check-out from check-in plus nights
    /// - confidence clamped to `[0, 1]`
    ///
    /// The failure sentinel is left untouched.
    pub fn normalize(mut self) -> Self {
        if self.is_failure() {
            return self;
        }

        self.confidence_score = if self.confidence_score.is_finite() {
            self.confidence_score.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let acc = &mut self.accommodation;
        if acc.num_rooms == 0 && acc.num_people > 0 {
            acc.num_rooms = acc.num_people.div_ceil(2);
        }

        let dates = &mut self.stay_dates;
        if dates.num_nights == 0
            && let (Some(check_in), Some(check_out)) = (dates.check_in_date, dates.check_out_date)
        {
            let nights = check_out.signed_duration_since(check_in).num_days();
            if nights > 0 {
                dates.num_nights = u32::try_from(nights).unwrap_or(0);
            }
        }
        if dates.check_out_date.is_none()
            && dates.num_nights > 0
            && let Some(check_in) = dates.check_in_date
        {
            dates.check_out_date =
                check_in.checked_add_days(chrono::Days::new(u64::from(dates.num_nights)));
        }

        self
    }
}

// ── Final record ────────────────────────────────────────────────────

/// Post-processing facts attached to every persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub triage_intent: IntentCategory,
    pub triage_decision: bool,
    pub is_existing_customer: bool,
    pub processed_at: DateTime<Utc>,
}

/// The terminal, persisted union of input, verdict, extraction and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRecord {
    #[serde(flatten)]
    pub item: RawItem,
    pub triage_record: TriageVerdict,
    pub extracted_data: ExtractionResult,
    pub processing_metadata: ProcessingMetadata,
}

impl FinalRecord {
    pub fn assemble(job: CompositeJob, extraction: ExtractionResult, is_existing_customer: bool) -> Self {
        let CompositeJob { item, verdict } = job;
        Self {
            item,
            triage_record: verdict,
            extracted_data: extraction,
            processing_metadata: ProcessingMetadata {
                triage_intent: verdict.intent,
                triage_decision: verdict.is_lead,
                is_existing_customer,
                processed_at: Utc::now(),
            },
        }
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Source of new inbound items — pure I/O, no business logic.
///
/// Implementations must mark every returned item consumed so a later call
/// never returns it again.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Source name for logging (e.g. "imap").
    fn name(&self) -> &str;

    /// Fetch items not delivered before.
    async fn fetch_new_items(&self) -> Result<Vec<RawItem>, MailError>;
}

/// Fast first-pass classifier. Never fails outward.
#[async_trait]
pub trait TriageClassifier: Send + Sync {
    /// Classify an item. Internal failures yield `TriageVerdict::failure()`.
    async fn classify(&self, item: &RawItem) -> TriageVerdict;
}

/// Detailed second-pass classifier. Never fails outward.
#[async_trait]
pub trait ExtractionClassifier: Send + Sync {
    /// Extract booking fields from body text. Internal failures yield
    /// `ExtractionResult::failure()`.
    async fn extract(&self, text: &str) -> ExtractionResult;
}

/// Append-only destination for finalized records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, record: &FinalRecord) -> Result<(), PersistenceError>;
}

/// Best-effort existing-customer check.
#[async_trait]
pub trait CustomerLookup: Send + Sync {
    async fn exists(&self, identity: &str) -> Result<bool, PersistenceError>;
}
