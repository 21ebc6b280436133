use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::channels::ChannelType;
use crate::shared::models::Ticket;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Escalated,
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Resolved => write!(f, "resolved"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "escalated" => Ok(Self::Escalated),
            other => Err(TicketError::UnknownStatus(other.to_string())),
        }
    }
}

impl TicketStatus {
    /// The lifecycle only moves forward: open → in_progress → resolved,
    /// with open|in_progress → escalated → resolved for human handoff.
    /// Nothing ever leaves resolved.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Resolved)
                | (Open, Escalated)
                | (InProgress, Resolved)
                | (InProgress, Escalated)
                | (Escalated, Resolved)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for TicketPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TicketError {
    UnknownStatus(String),
    /// Backward or undefined transition; rejected, never silently applied.
    IllegalTransition { from: String, to: TicketStatus },
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStatus(s) => write!(f, "Unknown ticket status: {s}"),
            Self::IllegalTransition { from, to } => {
                write!(f, "Illegal ticket transition: {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for TicketError {}

/// Applies a forward transition or rejects it as an invariant violation.
pub fn transition(ticket: &mut Ticket, next: TicketStatus) -> Result<(), TicketError> {
    let current: TicketStatus = ticket.status.parse()?;
    if current == next {
        return Ok(());
    }
    if !current.can_transition_to(next) {
        return Err(TicketError::IllegalTransition {
            from: ticket.status.clone(),
            to: next,
        });
    }
    info!("Ticket {} transition {current} -> {next}", ticket.id);
    ticket.status = next.to_string();
    if next == TicketStatus::Resolved {
        ticket.resolved_at = Some(Utc::now());
    }
    Ok(())
}

/// Initial categorisation from message text. Humans own recategorisation;
/// this never runs twice for a ticket.
pub fn infer_category(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    const BILLING: &[&str] = &["invoice", "billing", "charge", "payment", "subscription"];
    const TECHNICAL: &[&str] = &["error", "bug", "crash", "broken", "not working", "fails"];
    const ACCOUNT: &[&str] = &["password", "login", "sign in", "account", "2fa", "reset"];

    if BILLING.iter().any(|k| lower.contains(k)) {
        "billing"
    } else if TECHNICAL.iter().any(|k| lower.contains(k)) {
        "technical"
    } else if ACCOUNT.iter().any(|k| lower.contains(k)) {
        "account"
    } else {
        "general"
    }
}

/// Priority from channel-supplied hints, falling back to channel defaults.
pub fn priority_from_hints(
    channel: ChannelType,
    metadata: &HashMap<String, serde_json::Value>,
) -> TicketPriority {
    if let Some(hint) = metadata.get("priority").and_then(|v| v.as_str()) {
        match hint {
            "low" => return TicketPriority::Low,
            "normal" => return TicketPriority::Normal,
            "high" => return TicketPriority::High,
            "urgent" => return TicketPriority::Urgent,
            _ => {}
        }
    }
    match channel {
        ChannelType::WhatsApp => TicketPriority::High,
        ChannelType::Email | ChannelType::Web => TicketPriority::Normal,
    }
}

/// New ticket for a conversation: category inferred from the first message,
/// priority from channel hints, status open.
pub fn new_ticket(
    conversation_id: Uuid,
    customer_id: Uuid,
    first_message: &str,
    channel: ChannelType,
    metadata: &HashMap<String, serde_json::Value>,
) -> Ticket {
    Ticket {
        id: Uuid::new_v4(),
        conversation_id,
        customer_id,
        category: infer_category(first_message).to_string(),
        priority: priority_from_hints(channel, metadata).to_string(),
        status: TicketStatus::Open.to_string(),
        escalation_reason: None,
        resolution_notes: None,
        created_at: Utc::now(),
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket_with(status: TicketStatus) -> Ticket {
        let mut ticket = new_ticket(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "hello",
            ChannelType::Web,
            &HashMap::new(),
        );
        ticket.status = status.to_string();
        ticket
    }

    #[test]
    fn forward_transitions_are_allowed() {
        let mut ticket = ticket_with(TicketStatus::Open);
        transition(&mut ticket, TicketStatus::InProgress).unwrap();
        transition(&mut ticket, TicketStatus::Resolved).unwrap();
        assert!(ticket.resolved_at.is_some());
    }

    #[test]
    fn escalated_path_reaches_resolved() {
        let mut ticket = ticket_with(TicketStatus::InProgress);
        transition(&mut ticket, TicketStatus::Escalated).unwrap();
        transition(&mut ticket, TicketStatus::Resolved).unwrap();
    }

    #[test]
    fn resolved_never_regresses() {
        for next in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Escalated,
        ] {
            let mut ticket = ticket_with(TicketStatus::Resolved);
            let err = transition(&mut ticket, next).unwrap_err();
            assert!(matches!(err, TicketError::IllegalTransition { .. }));
            assert_eq!(ticket.status, "resolved");
        }
    }

    #[test]
    fn backward_transition_is_rejected() {
        let mut ticket = ticket_with(TicketStatus::InProgress);
        assert!(transition(&mut ticket, TicketStatus::Open).is_err());
    }

    #[test]
    fn self_transition_is_a_no_op() {
        let mut ticket = ticket_with(TicketStatus::Escalated);
        transition(&mut ticket, TicketStatus::Escalated).unwrap();
        assert_eq!(ticket.status, "escalated");
    }

    #[test]
    fn category_inference() {
        assert_eq!(infer_category("My invoice is wrong"), "billing");
        assert_eq!(infer_category("The app keeps crashing with an error"), "technical");
        assert_eq!(infer_category("How do I reset my password?"), "account");
        assert_eq!(infer_category("Just saying hi"), "general");
    }

    #[test]
    fn priority_hint_overrides_channel_default() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "priority".to_string(),
            serde_json::Value::String("urgent".to_string()),
        );
        assert_eq!(
            priority_from_hints(ChannelType::Web, &metadata),
            TicketPriority::Urgent
        );
        assert_eq!(
            priority_from_hints(ChannelType::WhatsApp, &HashMap::new()),
            TicketPriority::High
        );
        assert_eq!(
            priority_from_hints(ChannelType::Email, &HashMap::new()),
            TicketPriority::Normal
        );
    }
}
