use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::sync::Mutex;

use supportserver::agent::TemplateAgent;
use supportserver::channels::{
    ChannelType, DeliveryClient, DeliveryError, DeliveryReceipt,
};
use supportserver::config::EngineConfig;
use supportserver::dispatch::{DispatchConfig, Dispatcher};
use supportserver::engine::{Engine, Outcome, ProcessError};
use supportserver::escalation::{EscalationReason, StoreEscalationSink};
use supportserver::kb::{KnowledgeHit, KnowledgeOrchestrator, SearchError, SearchProvider};
use supportserver::queue::{InboundEvent, PartitionedQueue};
use supportserver::shared::models::{
    Conversation, ConversationMessage, Customer, CustomerIdentifier, DeadLetterRecord,
    EscalationRecord, Ticket, CONVERSATION_ACTIVE,
};
use supportserver::store::{EngineStore, InsertOutcome, MemoryStore, StoreError};
use uuid::Uuid;

/// Search fake: answers from a fixed (keyword -> hit) table, counts calls,
/// and optionally delays queries containing a marker word.
struct TableSearchProvider {
    table: Vec<(&'static str, KnowledgeHit)>,
    calls: AtomicU32,
    slow_marker: Option<&'static str>,
}

impl TableSearchProvider {
    fn new(table: Vec<(&'static str, KnowledgeHit)>) -> Self {
        Self {
            table,
            calls: AtomicU32::new(0),
            slow_marker: None,
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for TableSearchProvider {
    async fn search(&self, query: &str, _top_k: usize) -> Result<Vec<KnowledgeHit>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.slow_marker {
            if query.contains(marker) {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
        let lower = query.to_lowercase();
        Ok(self
            .table
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword))
            .map(|(_, hit)| hit.clone())
            .collect())
    }
}

/// Delivery fake: records every send in order across all channels.
struct RecordingDelivery {
    channel: ChannelType,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    fail_transiently: bool,
}

#[async_trait]
impl DeliveryClient for RecordingDelivery {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.fail_transiently {
            return Err(DeliveryError::NetworkError("down".to_string()));
        }
        self.sent
            .lock()
            .await
            .push((recipient.to_string(), content.to_string()));
        Ok(DeliveryReceipt::sent("prov-1"))
    }
}

/// Store fake: delegates everything to a `MemoryStore` but fails the first
/// `update_customer` call with a transient outage.
struct FailOnceStore {
    inner: MemoryStore,
    customer_update_fails: AtomicBool,
}

impl FailOnceStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            customer_update_fails: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl EngineStore for FailOnceStore {
    async fn has_processed(&self, event_key: &str) -> Result<bool, StoreError> {
        self.inner.has_processed(event_key).await
    }

    async fn mark_processed(&self, event_key: &str) -> Result<(), StoreError> {
        self.inner.mark_processed(event_key).await
    }

    async fn find_identifier(
        &self,
        kind: &str,
        value: &str,
    ) -> Result<Option<CustomerIdentifier>, StoreError> {
        self.inner.find_identifier(kind, value).await
    }

    async fn insert_identifier(
        &self,
        customer_id: Uuid,
        kind: &str,
        value: &str,
    ) -> Result<InsertOutcome, StoreError> {
        self.inner.insert_identifier(customer_id, kind, value).await
    }

    async fn create_customer(&self, customer: Customer) -> Result<(), StoreError> {
        self.inner.create_customer(customer).await
    }

    async fn get_customer(&self, id: Uuid) -> Result<Option<Customer>, StoreError> {
        self.inner.get_customer(id).await
    }

    async fn update_customer(&self, customer: &Customer) -> Result<(), StoreError> {
        if self.customer_update_fails.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.update_customer(customer).await
    }

    async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, StoreError> {
        self.inner.find_customer_by_email(email).await
    }

    async fn merge_customers(&self, canonical: Uuid, absorbed: Uuid) -> Result<(), StoreError> {
        self.inner.merge_customers(canonical, absorbed).await
    }

    async fn active_conversation(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        self.inner.active_conversation(customer_id).await
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<(), StoreError> {
        self.inner.create_conversation(conversation).await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.inner.update_conversation(conversation).await
    }

    async fn append_message(&self, message: ConversationMessage) -> Result<(), StoreError> {
        self.inner.append_message(message).await
    }

    async fn conversation_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, StoreError> {
        self.inner.conversation_messages(conversation_id).await
    }

    async fn ticket_for_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Ticket>, StoreError> {
        self.inner.ticket_for_conversation(conversation_id).await
    }

    async fn create_ticket(&self, ticket: Ticket) -> Result<(), StoreError> {
        self.inner.create_ticket(ticket).await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.inner.update_ticket(ticket).await
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        self.inner.get_ticket(id).await
    }

    async fn list_tickets(&self, status: Option<&str>) -> Result<Vec<Ticket>, StoreError> {
        self.inner.list_tickets(status).await
    }

    async fn record_escalation(&self, record: EscalationRecord) -> Result<(), StoreError> {
        self.inner.record_escalation(record).await
    }

    async fn record_dead_letter(&self, record: DeadLetterRecord) -> Result<(), StoreError> {
        self.inner.record_dead_letter(record).await
    }
}

struct Harness {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    provider: Arc<TableSearchProvider>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

fn password_reset_hit() -> KnowledgeHit {
    KnowledgeHit {
        title: "Password reset".to_string(),
        content: "Open Settings, choose Security, and click Reset password.".to_string(),
        score: 0.85,
    }
}

fn harness_with(provider: TableSearchProvider, failing_delivery: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(provider);
    let sent = Arc::new(Mutex::new(Vec::new()));

    let mut dispatcher = Dispatcher::new(DispatchConfig {
        max_attempts: 2,
        base_backoff_ms: 1,
    });
    for channel in [ChannelType::Email, ChannelType::WhatsApp, ChannelType::Web] {
        dispatcher.register(Arc::new(RecordingDelivery {
            channel,
            sent: sent.clone(),
            fail_transiently: failing_delivery,
        }));
    }

    let knowledge = KnowledgeOrchestrator::new(provider.clone(), 1000, 5);
    let engine = Arc::new(Engine::new(
        store.clone() as Arc<dyn EngineStore>,
        knowledge,
        Arc::new(TemplateAgent),
        Arc::new(dispatcher),
        Arc::new(StoreEscalationSink::new(store.clone())),
        EngineConfig::default(),
    ));

    Harness {
        engine,
        store,
        provider,
        sent,
    }
}

fn harness() -> Harness {
    harness_with(
        TableSearchProvider::new(vec![("password", password_reset_hit())]),
        false,
    )
}

fn event(
    channel: ChannelType,
    identifier: &str,
    content: &str,
    message_id: &str,
) -> InboundEvent {
    InboundEvent {
        channel,
        identifier: identifier.to_string(),
        content: content.to_string(),
        channel_message_id: message_id.to_string(),
        timestamp: Utc::now(),
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn password_reset_email_is_answered_autonomously() {
    let h = harness();
    let outcome = h
        .engine
        .process_event(&event(
            ChannelType::Email,
            "a@x.com",
            "How do I reset my password?",
            "m1",
        ))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Replied);

    let tickets = h.store.list_tickets(None).await.unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].category, "account");
    // Autonomous handling leaves the ticket open, never resolved.
    assert_eq!(tickets[0].status, "open");

    let sent = h.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "a@x.com");
    assert!(sent[0].1.contains("Reset password"));
    // Email formatting applied on the way out.
    assert!(sent[0].1.starts_with("Hello,"));
    assert!(sent[0].1.contains("The Support Team"));
}

#[tokio::test]
async fn refund_request_escalates_without_searching() {
    let h = harness();
    let outcome = h
        .engine
        .process_event(&event(
            ChannelType::WhatsApp,
            "+15551234",
            "I want a refund now",
            "wa1",
        ))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Escalated(EscalationReason::RefundRequest));

    let tickets = h.store.list_tickets(None).await.unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, "escalated");
    assert_eq!(tickets[0].escalation_reason.as_deref(), Some("refund_request"));

    // Escalation supersedes retrieval entirely.
    assert_eq!(h.provider.call_count(), 0);

    let escalations = h.store.escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].reason, "refund_request");

    // A short acknowledgment still goes out.
    let sent = h.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("billing team"));
}

#[tokio::test]
async fn replaying_an_event_produces_no_second_side_effect() {
    let h = harness();
    let e = event(ChannelType::Web, "a@x.com", "How do I reset my password?", "m1");

    assert_eq!(h.engine.process_event(&e).await.unwrap(), Outcome::Replied);
    assert_eq!(h.engine.process_event(&e).await.unwrap(), Outcome::Duplicate);
    assert_eq!(h.engine.process_event(&e).await.unwrap(), Outcome::Duplicate);

    assert_eq!(h.store.ticket_count(), 1);
    assert_eq!(h.store.conversation_count(), 1);
    assert_eq!(h.sent.lock().await.len(), 1);

    let tickets = h.store.list_tickets(None).await.unwrap();
    let messages = h
        .store
        .conversation_messages(tickets[0].conversation_id)
        .await
        .unwrap();
    // Exactly one inbound and one outbound despite three deliveries.
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn redelivery_after_transient_failure_logs_the_message_once() {
    let store = Arc::new(FailOnceStore::new());
    let sent = Arc::new(Mutex::new(Vec::new()));

    let mut dispatcher = Dispatcher::new(DispatchConfig {
        max_attempts: 2,
        base_backoff_ms: 1,
    });
    dispatcher.register(Arc::new(RecordingDelivery {
        channel: ChannelType::Web,
        sent: sent.clone(),
        fail_transiently: false,
    }));

    let provider = Arc::new(TableSearchProvider::new(vec![("password", password_reset_hit())]));
    let knowledge = KnowledgeOrchestrator::new(provider, 1000, 5);
    let engine = Arc::new(Engine::new(
        store.clone() as Arc<dyn EngineStore>,
        knowledge,
        Arc::new(TemplateAgent),
        Arc::new(dispatcher),
        Arc::new(StoreEscalationSink::new(store.clone())),
        EngineConfig::default(),
    ));

    let e = event(ChannelType::Web, "a@x.com", "How do I reset my password?", "m1");

    // First attempt dies on the customer update, after the inbound message
    // was appended.
    let err = engine.process_event(&e).await.unwrap_err();
    assert!(matches!(err, ProcessError::Transient(_)));

    // Redelivery completes the pipeline without logging the message twice.
    assert_eq!(engine.process_event(&e).await.unwrap(), Outcome::Replied);

    let tickets = store.inner.list_tickets(None).await.unwrap();
    let messages = store
        .inner
        .conversation_messages(tickets[0].conversation_id)
        .await
        .unwrap();
    let inbound: Vec<_> = messages
        .iter()
        .filter(|m| m.channel_message_id.as_deref() == Some("m1"))
        .collect();
    assert_eq!(inbound.len(), 1);
    assert_eq!(messages.len(), 2);
    assert_eq!(sent.lock().await.len(), 1);
}

#[tokio::test]
async fn channel_switch_is_recorded_and_identity_merged() {
    let h = harness();
    h.engine
        .process_event(&event(
            ChannelType::Email,
            "a@x.com",
            "How do I reset my password?",
            "m1",
        ))
        .await
        .unwrap();

    // Same person, now on WhatsApp; the profile surfaces the email.
    let mut wa = event(
        ChannelType::WhatsApp,
        "+15551234",
        "Still locked out of my account",
        "wa1",
    );
    wa.metadata.insert(
        "profile_email".to_string(),
        serde_json::Value::String("a@x.com".to_string()),
    );
    h.engine.process_event(&wa).await.unwrap();

    // One customer, one conversation carrying a channel-switch record.
    assert_eq!(h.store.customer_count(), 1);
    assert_eq!(h.store.conversation_count(), 1);

    let tickets = h.store.list_tickets(None).await.unwrap();
    let conversation_id = tickets[0].conversation_id;
    let messages = h.store.conversation_messages(conversation_id).await.unwrap();
    assert_eq!(messages.len(), 4);

    let customer_id = tickets[0].customer_id;
    let conversation = h
        .store
        .active_conversation(customer_id)
        .await
        .unwrap()
        .unwrap();
    let switches = conversation.channel_switches.as_array().unwrap();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0]["from"], "email");
    assert_eq!(switches[0]["to"], "whatsapp");
}

#[tokio::test]
async fn second_failed_search_escalates_as_no_documentation() {
    let h = harness();
    let first = h
        .engine
        .process_event(&event(
            ChannelType::Web,
            "b@x.com",
            "How do I frobnicate the widget?",
            "m1",
        ))
        .await
        .unwrap();
    // First miss: honest fallback reply, no escalation yet.
    assert_eq!(first, Outcome::Replied);
    assert_eq!(h.store.escalation_count(), 0);

    let second = h
        .engine
        .process_event(&event(
            ChannelType::Web,
            "b@x.com",
            "Seriously, how do I frobnicate the widget?",
            "m2",
        ))
        .await
        .unwrap();
    assert_eq!(
        second,
        Outcome::Escalated(EscalationReason::NoDocumentationFound)
    );
    assert_eq!(h.store.escalation_count(), 1);

    let tickets = h.store.list_tickets(None).await.unwrap();
    assert_eq!(tickets[0].status, "escalated");
}

#[tokio::test]
async fn reply_without_ticket_is_an_invariant_violation() {
    let h = harness();
    let customer_id = uuid::Uuid::new_v4();
    let conversation = Conversation {
        id: uuid::Uuid::new_v4(),
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
    h.store.create_conversation(conversation.clone()).await.unwrap();

    let err = h
        .engine
        .dispatch_reply(
            &conversation,
            &event(ChannelType::Web, "c@x.com", "hi", "m9"),
            "an answer",
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::TicketMissing(_)));
    assert!(h.sent.lock().await.is_empty());
}

#[tokio::test]
async fn delivery_exhaustion_dead_letters_and_leaves_ticket_alone() {
    let h = harness_with(
        TableSearchProvider::new(vec![("password", password_reset_hit())]),
        true,
    );
    let e = event(ChannelType::Web, "a@x.com", "How do I reset my password?", "m1");
    let outcome = h.engine.process_event(&e).await.unwrap();
    assert!(matches!(outcome, Outcome::DeadLettered(_)));

    assert_eq!(h.store.dead_letter_count(), 1);
    // The dead letter records how many delivery attempts were burned.
    let dead = h.store.dead_letters();
    assert_eq!(dead[0].attempt_count, 2);

    let tickets = h.store.list_tickets(None).await.unwrap();
    assert_eq!(tickets[0].status, "open");

    // State committed before dispatch: the replay is a duplicate, so the
    // failure costs at most one duplicate reply after reconciliation.
    assert_eq!(h.engine.process_event(&e).await.unwrap(), Outcome::Duplicate);
}

#[tokio::test]
async fn events_for_one_identifier_are_processed_in_arrival_order() {
    let mut provider = TableSearchProvider::new(vec![
        (
            "first",
            KnowledgeHit {
                title: "First answer".to_string(),
                content: "Alpha.".to_string(),
                score: 0.9,
            },
        ),
        (
            "second",
            KnowledgeHit {
                title: "Second answer".to_string(),
                content: "Beta.".to_string(),
                score: 0.9,
            },
        ),
    ]);
    // E1 is artificially slow; E2 must still wait for it.
    provider.slow_marker = Some("first");
    let h = harness_with(provider, false);

    let queue = PartitionedQueue::new(2);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = h.engine.spawn_workers(&queue, shutdown_rx);

    queue
        .publish(event(ChannelType::Web, "a@x.com", "the first question", "m1"))
        .await;
    queue
        .publish(event(ChannelType::Web, "a@x.com", "the second question", "m2"))
        .await;

    // Wait for both replies to be dispatched.
    for _ in 0..100 {
        if h.sent.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let sent = h.sent.lock().await;
    assert_eq!(sent.len(), 2, "both events should have been processed");
    assert!(sent[0].1.contains("Alpha"), "E1's reply must come first");
    assert!(sent[1].1.contains("Beta"));
    drop(sent);

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(2), worker).await;
    }
}

#[tokio::test]
async fn malformed_event_goes_to_dead_letter_not_retry() {
    let h = harness();
    let queue = PartitionedQueue::new(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = h.engine.spawn_workers(&queue, shutdown_rx);

    queue
        .publish(event(ChannelType::Web, "   ", "no identifier here", "bad1"))
        .await;

    for _ in 0..100 {
        if h.store.dead_letter_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.store.dead_letter_count(), 1);
    assert_eq!(queue.depth().await, 0, "malformed event must be acked");
    assert_eq!(h.store.ticket_count(), 0);
    assert!(h.sent.lock().await.is_empty());

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = tokio::time::timeout(Duration::from_secs(2), worker).await;
    }
}
