//! Pre-LLM rules engine for fast triage.
//!
//! Runs before the LLM triage call to short-circuit obvious non-leads:
//! - noreply/no-reply senders, mail daemons → `NOISE_SPAM`
//! - Marketing/newsletter domains, unsubscribe subjects and footers → `NOISE_SPAM`
//! - Transactional mail (shipping, receipts) → `OTHER`
//!
//! If the rules engine returns a verdict, the LLM call is skipped entirely.
//! No rule ever produces a lead; leads always come from the model.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{IntentCategory, RawItem, TriageVerdict};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A single non-lead rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct NoiseRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    /// Verdict intent when this rule fires.
    pub intent: IntentCategory,
    /// Why this rule triggers.
    pub reason: String,
}

impl NoiseRule {
    fn matches(&self, item: &RawItem) -> bool {
        let value = match self.field {
            RuleField::Sender => &item.sender,
            RuleField::Subject => &item.subject,
            RuleField::Body => &item.body,
        };
        self.regex.is_match(value)
    }
}

/// Pre-LLM rules engine.
pub struct RulesEngine {
    rules: Vec<NoiseRule>,
    /// Senders/domains that always go to the model (bypass every rule).
    always_classify: Vec<Regex>,
}

impl RulesEngine {
    /// Create a rules engine with the default noise patterns.
    pub fn default_rules() -> Self {
        let noise = |pattern: &str, re: &str, field: RuleField, reason: &str| NoiseRule {
            pattern: pattern.into(),
            regex: Regex::new(re).unwrap(),
            field,
            intent: IntentCategory::NoiseSpam,
            reason: reason.into(),
        };

        let rules = vec![
            noise(
                "noreply@*",
                r"(?i)^no[\-_.]?reply@",
                RuleField::Sender,
                "noreply sender",
            ),
            noise(
                "*@marketing.*",
                r"(?i)@(marketing|newsletter|promo|campaign)\b",
                RuleField::Sender,
                "marketing/newsletter sender",
            ),
            noise(
                "mailer-daemon",
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                "automated mail system",
            ),
            noise(
                "unsubscribe in subject",
                r"(?i)\bunsubscribe\b",
                RuleField::Subject,
                "newsletter/marketing (unsubscribe in subject)",
            ),
            noise(
                "unsubscribe footer",
                r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                RuleField::Body,
                "bulk/marketing email (unsubscribe footer)",
            ),
            noise(
                "jira notification",
                r"(?i)^jira@|@.*\.atlassian\.net$",
                RuleField::Sender,
                "issue tracker notification",
            ),
            NoiseRule {
                pattern: "shipping update".into(),
                regex: Regex::new(
                    r"(?i)(your (order|package|shipment)|tracking (number|update)|has (shipped|been delivered)|out for delivery)",
                )
                .unwrap(),
                field: RuleField::Body,
                intent: IntentCategory::Other,
                reason: "shipping/delivery update".into(),
            },
            NoiseRule {
                pattern: "payment receipt".into(),
                regex: Regex::new(
                    r"(?i)(payment (received|confirmed)|receipt for|your (receipt|transaction))",
                )
                .unwrap(),
                field: RuleField::Body,
                intent: IntentCategory::Other,
                reason: "payment/receipt".into(),
            },
        ];

        Self {
            rules,
            always_classify: Vec::new(),
        }
    }

    /// Create an empty rules engine (everything goes to the model).
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self {
            rules: Vec::new(),
            always_classify: Vec::new(),
        }
    }

    /// Add a sender pattern that always reaches the model.
    pub fn add_always_classify(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.always_classify.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Evaluate an item against all rules, in order.
    ///
    /// Returns `Some(verdict)` (never a lead) if a rule matches, `None` to
    /// fall through to model triage.
    pub fn evaluate(&self, item: &RawItem) -> Option<TriageVerdict> {
        if self.always_classify.iter().any(|r| r.is_match(&item.sender)) {
            debug!(
                id = %item.id,
                sender = %item.sender,
                "Sender matches always-classify pattern, bypassing rules"
            );
            return None;
        }

        let rule = self.rules.iter().find(|rule| rule.matches(item))?;
        debug!(
            id = %item.id,
            sender = %item.sender,
            rule = %rule.pattern,
            reason = %rule.reason,
            "Item matched rule"
        );
        Some(TriageVerdict::not_lead(rule.intent))
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::default_rules()
    }
}
