use async_trait::async_trait;
use uuid::Uuid;

use crate::shared::models::{
    Conversation, ConversationMessage, Customer, CustomerIdentifier, DeadLetterRecord,
    EscalationRecord, Ticket,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backing store unreachable. The event must not be processed
    /// optimistically; the caller leaves it on the queue for redelivery.
    Unavailable(String),
    /// Uniqueness conflict, e.g. concurrent insert of the same identifier.
    Conflict(String),
    NotFound(String),
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "Store unavailable: {msg}"),
            Self::Conflict(msg) => write!(f, "Store conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Backend(msg) => write!(f, "Store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Outcome of an identifier insert under the (kind, value) unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another row already holds (kind, value); the caller re-reads.
    Conflict,
}

/// All durable cross-event state lives behind this trait. `PgStore` is the
/// production implementation; `MemoryStore` backs the embedded mode and the
/// test suite.
#[async_trait]
pub trait EngineStore: Send + Sync {
    // --- idempotency ---
    async fn has_processed(&self, event_key: &str) -> Result<bool, StoreError>;
    async fn mark_processed(&self, event_key: &str) -> Result<(), StoreError>;

    // --- identity ---
    async fn find_identifier(
        &self,
        kind: &str,
        value: &str,
    ) -> Result<Option<CustomerIdentifier>, StoreError>;
    async fn insert_identifier(
        &self,
        customer_id: Uuid,
        kind: &str,
        value: &str,
    ) -> Result<InsertOutcome, StoreError>;
    async fn create_customer(&self, customer: Customer) -> Result<(), StoreError>;
    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError>;
    async fn update_customer(&self, customer: &Customer) -> Result<(), StoreError>;
    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, StoreError>;
    /// Repoints the absorbed customer's identifiers, conversations and
    /// tickets at the canonical customer and marks the absorbed row as a
    /// redirect. Conversation and ticket rows themselves are not rewritten.
    async fn merge_customers(&self, canonical: Uuid, absorbed: Uuid) -> Result<(), StoreError>;

    // --- conversations ---
    async fn active_conversation(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn append_message(&self, message: ConversationMessage) -> Result<(), StoreError>;
    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, StoreError>;

    // --- tickets ---
    async fn ticket_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Ticket>, StoreError>;
    async fn create_ticket(&self, ticket: Ticket) -> Result<(), StoreError>;
    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;
    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError>;
    async fn list_tickets(&self, status: Option<&str>) -> Result<Vec<Ticket>, StoreError>;

    // --- sinks ---
    async fn record_escalation(&self, record: EscalationRecord) -> Result<(), StoreError>;
    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StoreError>;
}
