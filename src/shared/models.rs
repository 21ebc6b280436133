use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::schema::{
    conversation_messages, conversations, customer_identifiers, customers, dead_letters,
    escalations, processed_events, tickets,
};

/// Canonical identity. Never deleted; a merged customer keeps its row with
/// `merged_into` pointing at the canonical survivor.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = customers)]
pub struct Customer {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub primary_email: Option<String>,
    pub first_contact: DateTime<Utc>,
    pub interaction_count: i32,
    /// Ordered `[{at, score}]` history, newest last.
    pub sentiment_trend: serde_json::Value,
    pub merged_into: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentPoint {
    pub at: DateTime<Utc>,
    pub score: f64,
}

impl Customer {
    pub fn new(display_name: Option<String>, primary_email: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            display_name,
            primary_email,
            first_contact: now,
            interaction_count: 0,
            sentiment_trend: serde_json::Value::Array(vec![]),
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_interaction(&mut self, score: f64) {
        self.interaction_count += 1;
        if let serde_json::Value::Array(points) = &mut self.sentiment_trend {
            points.push(serde_json::json!({ "at": Utc::now(), "score": score }));
        }
        self.updated_at = Utc::now();
    }
}

/// Binds a typed identifier value to exactly one customer. (kind, value) is
/// globally unique; rows are repointed only during an explicit merge.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = customer_identifiers)]
pub struct CustomerIdentifier {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub kind: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub initial_channel: String,
    pub current_channel: String,
    pub status: String,
    /// Running estimate in [0, 1], exponentially smoothed per inbound message.
    pub sentiment: f64,
    /// Failed knowledge searches since the ticket opened.
    pub search_attempts: i32,
    /// `[{at, from, to}]` channel-switch log.
    pub channel_switches: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub const CONVERSATION_ACTIVE: &str = "active";
pub const CONVERSATION_CLOSED: &str = "closed";

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = conversation_messages)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub role: String,
    pub channel: String,
    pub content: String,
    pub channel_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const DIRECTION_INBOUND: &str = "inbound";
pub const DIRECTION_OUTBOUND: &str = "outbound";
pub const ROLE_CUSTOMER: &str = "customer";
pub const ROLE_AGENT: &str = "agent";

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub customer_id: Uuid,
    pub category: String,
    pub priority: String,
    pub status: String,
    pub escalation_reason: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Append-only idempotency mark. Existence is the sole signal; rows age out
/// with the queue's retention window.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = processed_events)]
pub struct ProcessedEvent {
    pub event_key: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = escalations)]
pub struct EscalationRecord {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub customer_id: Uuid,
    pub reason: String,
    pub sentiment: f64,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = dead_letters)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub event_key: String,
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
}
