use chrono::{Duration, Utc};
use log::{debug, info};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::channels::ChannelType;
use crate::queue::InboundEvent;
use crate::shared::models::{
    Conversation, ConversationMessage, CONVERSATION_ACTIVE, CONVERSATION_CLOSED,
    DIRECTION_INBOUND, DIRECTION_OUTBOUND, ROLE_AGENT, ROLE_CUSTOMER,
};
use crate::store::{EngineStore, StoreError};

/// Smoothing factor for the running sentiment estimate: the latest message
/// weighs 30%, history 70%.
const SENTIMENT_ALPHA: f64 = 0.3;

/// Owns the conversation half of the lifecycle: the bounded dialogue window,
/// the at-most-one-active invariant, channel continuity, and the message log.
pub struct ConversationEngine {
    store: Arc<dyn EngineStore>,
    inactivity_window: Duration,
}

impl ConversationEngine {
    pub fn new(store: Arc<dyn EngineStore>, inactivity_window_hours: i64) -> Self {
        Self {
            store,
            inactivity_window: Duration::hours(inactivity_window_hours),
        }
    }

    /// Finds the customer's live conversation or starts a fresh one. A
    /// conversation past the inactivity window is closed, never reopened; a
    /// live conversation reached over a different channel gets a
    /// channel-switch record instead of a new conversation.
    pub async fn ensure_conversation(
        &self,
        customer_id: Uuid,
        channel: ChannelType,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();

        if let Some(mut conversation) = self.store.active_conversation(customer_id).await? {
            if now - conversation.last_activity_at <= self.inactivity_window {
                if conversation.current_channel != channel.to_string() {
                    self.record_channel_switch(&mut conversation, channel);
                }
                conversation.last_activity_at = now;
                self.store.update_conversation(&conversation).await?;
                return Ok(conversation);
            }

            // Stale: close it and fall through to a fresh conversation.
            info!(
                "Closing conversation {} after inactivity window",
                conversation.id
            );
            conversation.status = CONVERSATION_CLOSED.to_string();
            conversation.ended_at = Some(now);
            self.store.update_conversation(&conversation).await?;
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            customer_id,
            initial_channel: channel.to_string(),
            current_channel: channel.to_string(),
            status: CONVERSATION_ACTIVE.to_string(),
            sentiment: 0.5,
            search_attempts: 0,
            channel_switches: serde_json::Value::Array(vec![]),
            started_at: now,
            last_activity_at: now,
            ended_at: None,
        };
        self.store.create_conversation(conversation.clone()).await?;
        debug!(
            "Started conversation {} for customer {customer_id} on {channel}",
            conversation.id
        );
        Ok(conversation)
    }

    fn record_channel_switch(&self, conversation: &mut Conversation, channel: ChannelType) {
        info!(
            "Conversation {} switching channel {} -> {channel}",
            conversation.id, conversation.current_channel
        );
        if let serde_json::Value::Array(switches) = &mut conversation.channel_switches {
            switches.push(json!({
                "at": Utc::now(),
                "from": conversation.current_channel,
                "to": channel.to_string(),
            }));
        }
        conversation.current_channel = channel.to_string();
    }

    /// Appends the inbound message and folds the message's sentiment score
    /// into the running estimate.
    pub async fn append_inbound(
        &self,
        conversation: &mut Conversation,
        event: &InboundEvent,
        message_sentiment: f64,
    ) -> Result<(), StoreError> {
        // A channel-native ID already in the log marks a redelivery after a
        // partial failure: the message is not logged or scored twice.
        let already_logged = self
            .store
            .conversation_messages(conversation.id)
            .await?
            .iter()
            .any(|m| {
                m.direction == DIRECTION_INBOUND
                    && m.channel_message_id.as_deref() == Some(event.channel_message_id.as_str())
            });
        if already_logged {
            debug!(
                "Inbound {} already logged for conversation {}, skipping",
                event.channel_message_id, conversation.id
            );
            return Ok(());
        }

        self.store
            .append_message(ConversationMessage {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                direction: DIRECTION_INBOUND.to_string(),
                role: ROLE_CUSTOMER.to_string(),
                channel: event.channel.to_string(),
                content: event.content.clone(),
                channel_message_id: Some(event.channel_message_id.clone()),
                created_at: Utc::now(),
            })
            .await?;

        conversation.sentiment = smooth(conversation.sentiment, message_sentiment);
        conversation.last_activity_at = Utc::now();
        self.store.update_conversation(conversation).await
    }

    pub async fn append_outbound(
        &self,
        conversation: &Conversation,
        channel: ChannelType,
        content: &str,
    ) -> Result<(), StoreError> {
        self.store
            .append_message(ConversationMessage {
                id: Uuid::new_v4(),
                conversation_id: conversation.id,
                direction: DIRECTION_OUTBOUND.to_string(),
                role: ROLE_AGENT.to_string(),
                channel: channel.to_string(),
                content: content.to_string(),
                channel_message_id: None,
                created_at: Utc::now(),
            })
            .await
    }

    pub async fn record_failed_search(
        &self,
        conversation: &mut Conversation,
    ) -> Result<(), StoreError> {
        conversation.search_attempts += 1;
        self.store.update_conversation(conversation).await
    }

    /// New ticket, fresh search budget.
    pub async fn reset_search_attempts(
        &self,
        conversation: &mut Conversation,
    ) -> Result<(), StoreError> {
        conversation.search_attempts = 0;
        self.store.update_conversation(conversation).await
    }
}

fn smooth(previous: f64, latest: f64) -> f64 {
    (previous * (1.0 - SENTIMENT_ALPHA) + latest * SENTIMENT_ALPHA).clamp(0.0, 1.0)
}
