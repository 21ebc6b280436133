use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::models::EscalationRecord;
use crate::store::{EngineStore, StoreError};

/// Sentiment below this, with no keyword rule matching first, escalates.
pub const NEGATIVE_SENTIMENT_THRESHOLD: f64 = 0.3;
/// Failed knowledge searches tolerated before giving up on autonomy.
pub const MAX_SEARCH_ATTEMPTS: i32 = 2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    PricingInquiry,
    RefundRequest,
    LegalThreat,
    NegativeSentiment,
    HumanRequested,
    NoDocumentationFound,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PricingInquiry => write!(f, "pricing_inquiry"),
            Self::RefundRequest => write!(f, "refund_request"),
            Self::LegalThreat => write!(f, "legal_threat"),
            Self::NegativeSentiment => write!(f, "negative_sentiment"),
            Self::HumanRequested => write!(f, "human_requested"),
            Self::NoDocumentationFound => write!(f, "no_documentation_found"),
        }
    }
}

/// Escalation is a first-class return value, not an error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    None,
    Escalate(EscalationReason),
}

impl EscalationDecision {
    pub fn is_escalation(&self) -> bool {
        matches!(self, Self::Escalate(_))
    }
}

const PRICING_KEYWORDS: &[&str] = &[
    "pricing",
    "price",
    "how much does",
    "cost of",
    "quote",
    "discount",
    "enterprise plan",
];

const REFUND_KEYWORDS: &[&str] = &[
    "refund",
    "money back",
    "cancel my subscription",
    "cancel my account",
    "cancellation",
    "chargeback",
];

const LEGAL_KEYWORDS: &[&str] = &[
    "lawyer",
    "attorney",
    "legal action",
    "lawsuit",
    "sue you",
    "suing",
    "regulator",
];

const AGGRESSIVE_KEYWORDS: &[&str] = &[
    "damn",
    "wtf",
    "stupid",
    "useless",
    "terrible",
    "worst",
    "garbage",
    "scam",
];

const HUMAN_KEYWORDS: &[&str] = &[
    "speak to a human",
    "talk to a human",
    "real person",
    "speak to someone",
    "talk to an agent",
    "human agent",
    "representative",
];

fn matches_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| text.contains(k))
}

/// The deterministic escalation policy. Pure: text + state in, decision
/// out, no I/O. Rules are ordered and the first match wins; all are
/// channel-independent.
pub fn decide(
    message_text: &str,
    conversation_sentiment: f64,
    search_attempt_count: i32,
) -> EscalationDecision {
    let text = message_text.to_lowercase();

    if matches_any(&text, PRICING_KEYWORDS) {
        return EscalationDecision::Escalate(EscalationReason::PricingInquiry);
    }
    if matches_any(&text, REFUND_KEYWORDS) {
        return EscalationDecision::Escalate(EscalationReason::RefundRequest);
    }
    if matches_any(&text, LEGAL_KEYWORDS) {
        return EscalationDecision::Escalate(EscalationReason::LegalThreat);
    }
    if matches_any(&text, AGGRESSIVE_KEYWORDS)
        || conversation_sentiment < NEGATIVE_SENTIMENT_THRESHOLD
    {
        return EscalationDecision::Escalate(EscalationReason::NegativeSentiment);
    }
    if matches_any(&text, HUMAN_KEYWORDS) {
        return EscalationDecision::Escalate(EscalationReason::HumanRequested);
    }
    if search_attempt_count >= MAX_SEARCH_ATTEMPTS {
        return EscalationDecision::Escalate(EscalationReason::NoDocumentationFound);
    }

    EscalationDecision::None
}

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "perfect", "awesome", "love", "helpful", "good", "works",
];
const NEGATIVE_WORDS: &[&str] = &[
    "angry", "furious", "unacceptable", "terrible", "awful", "worst", "hate", "broken",
    "frustrated", "useless", "never", "ridiculous",
];

/// Deterministic lexicon score for one message, in [0, 1] with 0.5 neutral.
pub fn estimate_sentiment(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let mut score: f64 = 0.5;
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if POSITIVE_WORDS.contains(&word) {
            score += 0.1;
        } else if NEGATIVE_WORDS.contains(&word) {
            score -= 0.15;
        }
    }
    score.clamp(0.0, 1.0)
}

/// Short acknowledgment sent when a ticket is handed to a human; the channel
/// formatter shapes it on the way out. Escalation is always acknowledged,
/// never silent.
pub fn acknowledgment_for(reason: EscalationReason) -> &'static str {
    match reason {
        EscalationReason::PricingInquiry => {
            "Thanks for your interest! A member of our sales team will get back to you shortly with pricing details."
        }
        EscalationReason::RefundRequest => {
            "I've passed your request to our billing team. They will be in touch shortly to sort this out."
        }
        EscalationReason::LegalThreat => {
            "Your message has been forwarded to the appropriate team. Someone will contact you as soon as possible."
        }
        EscalationReason::NegativeSentiment => {
            "I'm sorry about the trouble. I've looped in a member of our support team who will take it from here."
        }
        EscalationReason::HumanRequested => {
            "Of course. I've asked a member of our team to take over; they will reply here shortly."
        }
        EscalationReason::NoDocumentationFound => {
            "I couldn't find a reliable answer for this one, so I've handed it to our support team. They will follow up soon."
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationNotice {
    pub ticket_id: Uuid,
    pub customer_id: Uuid,
    pub reason: EscalationReason,
    pub sentiment: f64,
    pub conversation_summary: String,
}

/// External handoff target for escalated tickets.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), StoreError>;
}

/// Default sink: persist the escalation so the human work list survives
/// restarts.
pub struct StoreEscalationSink {
    store: Arc<dyn EngineStore>,
}

impl StoreEscalationSink {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EscalationSink for StoreEscalationSink {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), StoreError> {
        info!(
            "Escalating ticket {} for customer {} ({})",
            notice.ticket_id, notice.customer_id, notice.reason
        );
        self.store
            .record_escalation(EscalationRecord {
                id: Uuid::new_v4(),
                ticket_id: notice.ticket_id,
                customer_id: notice.customer_id,
                reason: notice.reason.to_string(),
                sentiment: notice.sentiment,
                summary: notice.conversation_summary.clone(),
                created_at: chrono::Utc::now(),
            })
            .await
    }
}
