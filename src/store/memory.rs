use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::shared::models::{
    Conversation, ConversationMessage, Customer, CustomerIdentifier, DeadLetterRecord,
    EscalationRecord, Ticket, CONVERSATION_ACTIVE, CONVERSATION_CLOSED,
};
use crate::store::{EngineStore, InsertOutcome, StoreError};

#[derive(Default)]
struct Inner {
    customers: HashMap<Uuid, Customer>,
    /// (kind, value) -> identifier row; the map key is the unique constraint.
    identifiers: HashMap<(String, String), CustomerIdentifier>,
    conversations: HashMap<Uuid, Conversation>,
    messages: Vec<ConversationMessage>,
    tickets: HashMap<Uuid, Ticket>,
    processed: HashMap<String, chrono::DateTime<Utc>>,
    escalations: Vec<EscalationRecord>,
    dead_letters: Vec<DeadLetterRecord>,
}

/// Embedded backend: every table is a map behind one mutex. Used by the
/// dev configuration (no DATABASE_URL) and the test suite.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn escalation_count(&self) -> usize {
        self.inner.lock().unwrap().escalations.len()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.inner.lock().unwrap().dead_letters.len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.inner.lock().unwrap().dead_letters.clone()
    }

    pub fn escalations(&self) -> Vec<EscalationRecord> {
        self.inner.lock().unwrap().escalations.clone()
    }

    pub fn ticket_count(&self) -> usize {
        self.inner.lock().unwrap().tickets.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.lock().unwrap().conversations.len()
    }

    pub fn customer_count(&self) -> usize {
        self.inner.lock().unwrap().customers.len()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn has_processed(&self, event_key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().processed.contains_key(event_key))
    }

    async fn mark_processed(&self, event_key: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .processed
            .insert(event_key.to_string(), Utc::now());
        Ok(())
    }

    async fn find_identifier(
        &self,
        kind: &str,
        value: &str,
    ) -> Result<Option<CustomerIdentifier>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .identifiers
            .get(&(kind.to_string(), value.to_string()))
            .cloned())
    }

    async fn insert_identifier(
        &self,
        customer_id: Uuid,
        kind: &str,
        value: &str,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (kind.to_string(), value.to_string());
        if inner.identifiers.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        inner.identifiers.insert(
            key,
            CustomerIdentifier {
                id: Uuid::new_v4(),
                customer_id,
                kind: kind.to_string(),
                value: value.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn create_customer(&self, customer: Customer) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(email) = &customer.primary_email {
            let duplicate = inner
                .customers
                .values()
                .any(|c| c.merged_into.is_none() && c.primary_email.as_deref() == Some(email));
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "primary email already bound: {email}"
                )));
            }
        }
        inner.customers.insert(customer.id, customer);
        Ok(())
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.inner.lock().unwrap().customers.get(&id).cloned())
    }

    async fn update_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.customers.get_mut(&customer.id) {
            Some(existing) => {
                *existing = customer.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("customer {}", customer.id))),
        }
    }

    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .customers
            .values()
            .find(|c| c.merged_into.is_none() && c.primary_email.as_deref() == Some(email))
            .cloned())
    }

    async fn merge_customers(&self, canonical: Uuid, absorbed: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.customers.contains_key(&canonical) {
            return Err(StoreError::NotFound(format!("customer {canonical}")));
        }

        for identifier in inner.identifiers.values_mut() {
            if identifier.customer_id == absorbed {
                identifier.customer_id = canonical;
            }
        }
        for conversation in inner.conversations.values_mut() {
            if conversation.customer_id == absorbed {
                conversation.customer_id = canonical;
            }
        }
        for ticket in inner.tickets.values_mut() {
            if ticket.customer_id == absorbed {
                ticket.customer_id = canonical;
            }
        }

        // At most one active conversation per customer: the merge keeps the
        // most recently active one and closes the rest.
        let mut active: Vec<(chrono::DateTime<Utc>, Uuid)> = inner
            .conversations
            .values()
            .filter(|c| c.customer_id == canonical && c.status == CONVERSATION_ACTIVE)
            .map(|c| (c.last_activity_at, c.id))
            .collect();
        active.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale_id) in active.into_iter().skip(1) {
            if let Some(stale) = inner.conversations.get_mut(&stale_id) {
                stale.status = CONVERSATION_CLOSED.to_string();
                stale.ended_at = Some(Utc::now());
            }
        }

        let (absorbed_count, absorbed_email) = match inner.customers.get_mut(&absorbed) {
            Some(row) => {
                row.merged_into = Some(canonical);
                row.updated_at = Utc::now();
                (row.interaction_count, row.primary_email.take())
            }
            None => return Err(StoreError::NotFound(format!("customer {absorbed}"))),
        };
        if let Some(row) = inner.customers.get_mut(&canonical) {
            row.interaction_count += absorbed_count;
            if row.primary_email.is_none() {
                row.primary_email = absorbed_email;
            }
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn active_conversation(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .conversations
            .values()
            .find(|c| c.customer_id == customer_id && c.status == CONVERSATION_ACTIVE)
            .cloned())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let already_active = inner
            .conversations
            .values()
            .any(|c| c.customer_id == conversation.customer_id && c.status == CONVERSATION_ACTIVE);
        if already_active && conversation.status == CONVERSATION_ACTIVE {
            return Err(StoreError::Conflict(format!(
                "customer {} already has an active conversation",
                conversation.customer_id
            )));
        }
        inner.conversations.insert(conversation.id, conversation);
        Ok(())
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.conversations.get_mut(&conversation.id) {
            Some(existing) => {
                *existing = conversation.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!(
                "conversation {}",
                conversation.id
            ))),
        }
    }

    async fn append_message(&self, message: ConversationMessage) -> Result<(), StoreError> {
        self.inner.lock().unwrap().messages.push(message);
        Ok(())
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn ticket_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Ticket>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tickets
            .values()
            .find(|t| t.conversation_id == conversation_id)
            .cloned())
    }

    async fn create_ticket(&self, ticket: Ticket) -> Result<(), StoreError> {
        self.inner.lock().unwrap().tickets.insert(ticket.id, ticket);
        Ok(())
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tickets.get_mut(&ticket.id) {
            Some(existing) => {
                *existing = ticket.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("ticket {}", ticket.id))),
        }
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.inner.lock().unwrap().tickets.get(&id).cloned())
    }

    async fn list_tickets(&self, status: Option<&str>) -> Result<Vec<Ticket>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut tickets: Vec<Ticket> = inner
            .tickets
            .values()
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn record_escalation(&self, record: EscalationRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().escalations.push(record);
        Ok(())
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().dead_letters.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identifier_unique_constraint_reports_conflict() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(
            store.insert_identifier(a, "email", "a@x.com").await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_identifier(b, "email", "a@x.com").await.unwrap(),
            InsertOutcome::Conflict
        );
        // The original binding survives.
        let row = store.find_identifier("email", "a@x.com").await.unwrap().unwrap();
        assert_eq!(row.customer_id, a);
    }

    #[tokio::test]
    async fn second_active_conversation_is_rejected() {
        let store = MemoryStore::new();
        let customer = Customer::new(None, None);
        let customer_id = customer.id;
        store.create_customer(customer).await.unwrap();

        let make = |customer_id| Conversation {
            id: Uuid::new_v4(),
            customer_id,
            initial_channel: "web".to_string(),
            current_channel: "web".to_string(),
            status: CONVERSATION_ACTIVE.to_string(),
            sentiment: 0.5,
            search_attempts: 0,
            channel_switches: serde_json::Value::Array(vec![]),
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
            ended_at: None,
        };

        store.create_conversation(make(customer_id)).await.unwrap();
        let err = store.create_conversation(make(customer_id)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn merge_leaves_at_most_one_active_conversation() {
        let store = MemoryStore::new();
        let keep = Customer::new(None, None);
        let gone = Customer::new(None, None);
        let (keep_id, gone_id) = (keep.id, gone.id);
        store.create_customer(keep).await.unwrap();
        store.create_customer(gone).await.unwrap();

        let make = |customer_id, age_secs: i64| Conversation {
            id: Uuid::new_v4(),
            customer_id,
            initial_channel: "web".to_string(),
            current_channel: "web".to_string(),
            status: CONVERSATION_ACTIVE.to_string(),
            sentiment: 0.5,
            search_attempts: 0,
            channel_switches: serde_json::Value::Array(vec![]),
            started_at: Utc::now(),
            last_activity_at: Utc::now() - chrono::Duration::seconds(age_secs),
            ended_at: None,
        };
        let older = make(keep_id, 60);
        let newer = make(gone_id, 0);
        let newer_id = newer.id;
        store.create_conversation(older).await.unwrap();
        store.create_conversation(newer).await.unwrap();

        store.merge_customers(keep_id, gone_id).await.unwrap();

        // The most recently active conversation survives; the other closed.
        let active = store.active_conversation(keep_id).await.unwrap().unwrap();
        assert_eq!(active.id, newer_id);

        let mut survivor = active;
        survivor.status = CONVERSATION_CLOSED.to_string();
        survivor.ended_at = Some(Utc::now());
        store.update_conversation(&survivor).await.unwrap();
        assert!(store.active_conversation(keep_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_repoints_identifiers_and_marks_redirect() {
        let store = MemoryStore::new();
        let keep = Customer::new(None, Some("a@x.com".to_string()));
        let gone = Customer::new(None, None);
        let (keep_id, gone_id) = (keep.id, gone.id);
        store.create_customer(keep).await.unwrap();
        store.create_customer(gone).await.unwrap();
        store.insert_identifier(gone_id, "phone", "+1555").await.unwrap();

        store.merge_customers(keep_id, gone_id).await.unwrap();

        let row = store.find_identifier("phone", "+1555").await.unwrap().unwrap();
        assert_eq!(row.customer_id, keep_id);
        let absorbed = store.get_customer(gone_id).await.unwrap().unwrap();
        assert_eq!(absorbed.merged_into, Some(keep_id));
    }
}
