use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{validate_invocation, AgentContext, AgentError, AgentProvider, ToolInvocation};
use crate::channels::DeliveryReceipt;
use crate::config::EngineConfig;
use crate::conversation::ConversationEngine;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::escalation::{
    acknowledgment_for, decide, estimate_sentiment, EscalationDecision, EscalationNotice,
    EscalationReason, EscalationSink, MAX_SEARCH_ATTEMPTS,
};
use crate::idempotency::IdempotencyGuard;
use crate::identity::{IdentityError, IdentityResolver};
use crate::kb::KnowledgeOrchestrator;
use crate::queue::{InboundEvent, PartitionBuffer, PartitionedQueue};
use crate::shared::models::{Conversation, ConversationMessage, Customer, DeadLetterRecord};
use crate::store::{EngineStore, StoreError};
use crate::tickets::{new_ticket, transition, TicketStatus};

/// What processing one event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Already processed; dropped before any mutation.
    Duplicate,
    /// Autonomous reply dispatched.
    Replied,
    /// Handed to a human; acknowledgment dispatched.
    Escalated(EscalationReason),
    /// State committed but delivery failed; parked for reconciliation.
    DeadLettered(String),
}

#[derive(Debug)]
pub enum ProcessError {
    /// Retry from the top later; the idempotency mark was not written.
    Transient(String),
    /// Never retried; routed to the dead-letter path.
    Permanent(String),
    /// A reply was attempted for a conversation with no ticket.
    TicketMissing(Uuid),
    /// Delivery gave up; carries the attempt count for the dead letter.
    DispatchFailed { attempts: u32, reason: String },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "Transient processing failure: {msg}"),
            Self::Permanent(msg) => write!(f, "Unprocessable event: {msg}"),
            Self::TicketMissing(id) => {
                write!(f, "Invariant violation: reply for conversation {id} without a ticket")
            }
            Self::DispatchFailed { attempts, reason } => {
                write!(f, "Delivery failed after {attempts} attempts: {reason}")
            }
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<StoreError> for ProcessError {
    fn from(e: StoreError) -> Self {
        // Store-write failures abort the whole event and retry from the
        // top; partial state is acceptable because every step is
        // re-runnable and the guard is only marked at the end.
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            match e {
                StoreError::Conflict(msg) => Self::Transient(msg),
                other => Self::Permanent(other.to_string()),
            }
        }
    }
}

impl From<IdentityError> for ProcessError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Store(inner) => inner.into(),
            IdentityError::Unresolvable(msg) => Self::Permanent(msg),
        }
    }
}

/// The queue-consumer orchestrator: drives guard → identity → state machine
/// → policy → retrieval → dispatch for each event, one worker per
/// partition, strictly in order within a partition.
pub struct Engine {
    store: Arc<dyn EngineStore>,
    guard: IdempotencyGuard,
    resolver: IdentityResolver,
    conversations: ConversationEngine,
    knowledge: KnowledgeOrchestrator,
    agent: Arc<dyn AgentProvider>,
    dispatcher: Arc<Dispatcher>,
    escalation_sink: Arc<dyn EscalationSink>,
    config: EngineConfig,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn EngineStore>,
        knowledge: KnowledgeOrchestrator,
        agent: Arc<dyn AgentProvider>,
        dispatcher: Arc<Dispatcher>,
        escalation_sink: Arc<dyn EscalationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            resolver: IdentityResolver::new(store.clone()),
            conversations: ConversationEngine::new(store.clone(), config.inactivity_window_hours),
            store,
            knowledge,
            agent,
            dispatcher,
            escalation_sink,
            config,
        }
    }

    /// One worker task per queue partition. Workers stop pulling on
    /// shutdown and finish the event in flight.
    pub fn spawn_workers(
        self: &Arc<Self>,
        queue: &PartitionedQueue,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        (0..queue.partition_count())
            .map(|index| {
                let engine = Arc::clone(self);
                let partition = queue.partition(index);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    engine.run_partition(index, partition, shutdown).await;
                })
            })
            .collect()
    }

    async fn run_partition(
        &self,
        index: usize,
        partition: Arc<PartitionBuffer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Partition worker {index} started");
        loop {
            let delivery = tokio::select! {
                delivery = partition.next() => delivery,
                _ = shutdown.changed() => break,
            };
            let event_key = delivery.event.dedup_key();

            match self.process_event(&delivery.event).await {
                Ok(outcome) => {
                    debug!("Event {event_key}: {outcome:?}");
                    partition.ack(&event_key).await;
                }
                Err(ProcessError::Transient(reason)) => {
                    if delivery.attempt >= self.config.max_event_attempts {
                        error!(
                            "Event {event_key} dead-lettered after {} attempts: {reason}",
                            delivery.attempt
                        );
                        self.dead_letter(&delivery.event, &reason, delivery.attempt)
                            .await;
                        partition.ack(&event_key).await;
                    } else {
                        warn!(
                            "Event {event_key} attempt {} failed, will redeliver: {reason}",
                            delivery.attempt
                        );
                        // No ack: the head stays put and comes back.
                        let backoff = Duration::from_millis(
                            self.config.dispatch_backoff_ms * 2u64.pow(delivery.attempt.min(6)),
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => {
                    error!("Event {event_key} unprocessable: {e}");
                    self.dead_letter(&delivery.event, &e.to_string(), delivery.attempt)
                        .await;
                    partition.ack(&event_key).await;
                }
            }
        }
        info!("Partition worker {index} stopped");
    }

    /// The full per-event pipeline. Durable state mutations and the
    /// idempotency mark commit before dispatch is attempted.
    pub async fn process_event(&self, event: &InboundEvent) -> Result<Outcome, ProcessError> {
        if event.identifier.trim().is_empty() {
            return Err(ProcessError::Permanent("event without identifier".to_string()));
        }

        let event_key = event.dedup_key();
        if self.guard.has_processed(&event_key).await? {
            return Ok(Outcome::Duplicate);
        }

        // Identity, then conversation, then ticket. The ticket must exist
        // before any reply content is generated.
        let customer_id = self
            .resolver
            .resolve(event.channel, &event.identifier, &event.metadata)
            .await?;
        let mut customer = self
            .store
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| ProcessError::Permanent(format!("customer {customer_id} vanished")))?;

        let mut conversation = self
            .conversations
            .ensure_conversation(customer_id, event.channel)
            .await?;

        let mut ticket = match self.store.ticket_for_conversation(conversation.id).await? {
            Some(ticket) => ticket,
            None => {
                let ticket = new_ticket(
                    conversation.id,
                    customer_id,
                    &event.content,
                    event.channel,
                    &event.metadata,
                );
                self.store.create_ticket(ticket.clone()).await?;
                // New ticket, fresh search budget.
                if conversation.search_attempts != 0 {
                    self.conversations
                        .reset_search_attempts(&mut conversation)
                        .await?;
                }
                info!(
                    "Opened ticket {} ({}, {}) for conversation {}",
                    ticket.id, ticket.category, ticket.priority, conversation.id
                );
                ticket
            }
        };

        let message_sentiment = estimate_sentiment(&event.content);
        self.conversations
            .append_inbound(&mut conversation, event, message_sentiment)
            .await?;
        customer.record_interaction(message_sentiment);
        self.store.update_customer(&customer).await?;

        let decision = decide(&event.content, conversation.sentiment, conversation.search_attempts);

        let (reply, outcome_reason) = match decision {
            EscalationDecision::Escalate(reason) => {
                self.escalate(&mut ticket, &conversation, &customer, reason)
                    .await?;
                (acknowledgment_for(reason).to_string(), Some(reason))
            }
            EscalationDecision::None => {
                let retrieval = self.knowledge.retrieve(&event.content).await;

                if retrieval.is_empty() {
                    self.conversations
                        .record_failed_search(&mut conversation)
                        .await?;
                    if conversation.search_attempts >= MAX_SEARCH_ATTEMPTS {
                        let reason = EscalationReason::NoDocumentationFound;
                        self.escalate(&mut ticket, &conversation, &customer, reason)
                            .await?;
                        (acknowledgment_for(reason).to_string(), Some(reason))
                    } else {
                        let reply = self
                            .agent_reply(event, &customer, &conversation, &ticket, Vec::new())
                            .await?;
                        (reply, None)
                    }
                } else {
                    // Autonomous replies leave the ticket open; only human
                    // tooling moves it to in_progress or resolved.
                    let reply = self
                        .agent_reply(event, &customer, &conversation, &ticket, retrieval.hits)
                        .await?;
                    (reply, None)
                }
            }
        };

        self.conversations
            .append_outbound(&conversation, event.channel, &reply)
            .await?;

        // Last durable mutation is the mark; a crash after this point costs
        // at most one duplicate reply, never a duplicate state change.
        self.guard.mark_processed(&event_key).await?;

        match self
            .dispatch_reply(&conversation, event, &reply, customer.display_name.as_deref())
            .await
        {
            Ok(_) => Ok(match outcome_reason {
                Some(reason) => Outcome::Escalated(reason),
                None => Outcome::Replied,
            }),
            Err(ProcessError::TicketMissing(id)) => Err(ProcessError::TicketMissing(id)),
            Err(ProcessError::DispatchFailed { attempts, reason }) => {
                // State is committed; park the delivery failure for the
                // reconciliation pass and leave the ticket as it is.
                self.dead_letter(event, &reason, attempts).await;
                Ok(Outcome::DeadLettered(reason))
            }
            Err(e) => {
                self.dead_letter(event, &e.to_string(), 1).await;
                Ok(Outcome::DeadLettered(e.to_string()))
            }
        }
    }

    /// Delivers a reply for a conversation. Refuses to run for a
    /// conversation that has no ticket yet; ticket creation strictly
    /// precedes response dispatch.
    pub async fn dispatch_reply(
        &self,
        conversation: &Conversation,
        event: &InboundEvent,
        content: &str,
        recipient_name: Option<&str>,
    ) -> Result<DeliveryReceipt, ProcessError> {
        if self
            .store
            .ticket_for_conversation(conversation.id)
            .await?
            .is_none()
        {
            return Err(ProcessError::TicketMissing(conversation.id));
        }

        self.dispatcher
            .dispatch(event.channel, &event.identifier, content, recipient_name)
            .await
            .map_err(|e| match e {
                DispatchError::Exhausted { attempts, last } => ProcessError::DispatchFailed {
                    attempts,
                    reason: last.to_string(),
                },
                DispatchError::Permanent(inner) => ProcessError::DispatchFailed {
                    attempts: 1,
                    reason: inner.to_string(),
                },
                DispatchError::NoClient(channel) => ProcessError::DispatchFailed {
                    attempts: 0,
                    reason: format!("no delivery client for channel {channel}"),
                },
            })
    }

    async fn escalate(
        &self,
        ticket: &mut crate::shared::models::Ticket,
        conversation: &Conversation,
        customer: &Customer,
        reason: EscalationReason,
    ) -> Result<(), ProcessError> {
        match transition(ticket, TicketStatus::Escalated) {
            Ok(()) => {
                ticket.escalation_reason = Some(reason.to_string());
                self.store.update_ticket(ticket).await?;
            }
            Err(e) => {
                // A resolved ticket stays resolved; the handoff record is
                // still written so a human sees the new contact.
                warn!("Ticket {} not moved to escalated: {e}", ticket.id);
            }
        }

        let summary = self.summarize(conversation.id).await?;
        self.escalation_sink
            .notify(&EscalationNotice {
                ticket_id: ticket.id,
                customer_id: customer.id,
                reason,
                sentiment: conversation.sentiment,
                conversation_summary: summary,
            })
            .await?;
        Ok(())
    }

    async fn agent_reply(
        &self,
        event: &InboundEvent,
        customer: &Customer,
        conversation: &Conversation,
        ticket: &crate::shared::models::Ticket,
        hits: Vec<(crate::kb::KnowledgeHit, crate::kb::RelevanceBand)>,
    ) -> Result<String, ProcessError> {
        let context = AgentContext {
            event_key: event.dedup_key(),
            customer_id: customer.id,
            conversation_id: conversation.id,
            ticket_id: ticket.id,
            message: event.content.clone(),
            hits,
        };

        let invocations = self.agent.act(&context).await.map_err(|e| match e {
            AgentError::Provider(msg) => ProcessError::Transient(format!("agent: {msg}")),
            AgentError::InvalidInvocation(msg) => ProcessError::Permanent(format!("agent: {msg}")),
        })?;

        let valid: Vec<ToolInvocation> = invocations
            .into_iter()
            .filter(|invocation| match validate_invocation(invocation, &context) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Dropping malformed tool invocation: {e}");
                    false
                }
            })
            .collect();

        valid
            .into_iter()
            .find_map(|invocation| match invocation {
                ToolInvocation::SendReply { body } => Some(body),
                _ => None,
            })
            .ok_or_else(|| ProcessError::Transient("agent produced no usable reply".to_string()))
    }

    /// Short tail of the dialogue for the escalation handoff.
    async fn summarize(&self, conversation_id: Uuid) -> Result<String, ProcessError> {
        let messages = self.store.conversation_messages(conversation_id).await?;
        let tail: Vec<String> = messages
            .iter()
            .rev()
            .take(5)
            .collect::<Vec<&ConversationMessage>>()
            .into_iter()
            .rev()
            .map(|m| format!("[{}] {}", m.role, truncate(&m.content, 200)))
            .collect();
        Ok(tail.join("\n"))
    }

    async fn dead_letter(&self, event: &InboundEvent, reason: &str, attempts: u32) {
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            event_key: event.dedup_key(),
            payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
            failure_reason: reason.to_string(),
            attempt_count: attempts as i32,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.record_dead_letter(record).await {
            // Nothing left to do but say so; the queue retention window is
            // the backstop.
            error!("Failed to record dead letter for {}: {e}", event.dedup_key());
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}
