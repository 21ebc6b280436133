use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kb::{KnowledgeHit, RelevanceBand};

/// One tool call requested by the agent. Tagged variants with typed
/// payloads; the orchestrator validates shape before acting, never parses
/// free text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolInvocation {
    CreateTicket { category: String, priority: String },
    LookupHistory { customer_id: Uuid },
    SearchKnowledge { query: String },
    SendReply { body: String },
    Escalate { reason: String },
}

/// Context threaded explicitly through the call chain. Workers hold no
/// conversation state of their own.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub event_key: String,
    pub customer_id: Uuid,
    pub conversation_id: Uuid,
    pub ticket_id: Uuid,
    pub message: String,
    pub hits: Vec<(KnowledgeHit, RelevanceBand)>,
}

#[derive(Debug)]
pub enum AgentError {
    Provider(String),
    InvalidInvocation(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(msg) => write!(f, "Agent provider error: {msg}"),
            Self::InvalidInvocation(msg) => write!(f, "Invalid tool invocation: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// The reply-generating agent, an opaque tool-calling black box. Given the
/// inbound message and the qualifying knowledge hits it returns the tool
/// calls to perform.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn act(&self, context: &AgentContext) -> Result<Vec<ToolInvocation>, AgentError>;
}

/// Rejects invocations whose shape does not fit the context they arrived
/// with.
pub fn validate_invocation(
    invocation: &ToolInvocation,
    context: &AgentContext,
) -> Result<(), AgentError> {
    match invocation {
        ToolInvocation::SendReply { body } => {
            if body.trim().is_empty() {
                return Err(AgentError::InvalidInvocation("empty reply body".to_string()));
            }
        }
        ToolInvocation::SearchKnowledge { query } => {
            if query.trim().is_empty() {
                return Err(AgentError::InvalidInvocation(
                    "empty search query".to_string(),
                ));
            }
        }
        ToolInvocation::LookupHistory { customer_id } => {
            if *customer_id != context.customer_id {
                return Err(AgentError::InvalidInvocation(format!(
                    "history lookup for foreign customer {customer_id}"
                )));
            }
        }
        ToolInvocation::Escalate { reason } => {
            if reason.trim().is_empty() {
                return Err(AgentError::InvalidInvocation(
                    "empty escalation reason".to_string(),
                ));
            }
        }
        ToolInvocation::CreateTicket { category, .. } => {
            // Ticket creation precedes the agent in the pipeline; an agent
            // asking for another one is malformed output.
            return Err(AgentError::InvalidInvocation(format!(
                "ticket already exists (requested category {category})"
            )));
        }
    }
    Ok(())
}

/// Deterministic fallback agent: answers from the best knowledge hit. Used
/// in the embedded configuration and wherever the LLM is unavailable.
pub struct TemplateAgent;

#[async_trait]
impl AgentProvider for TemplateAgent {
    async fn act(&self, context: &AgentContext) -> Result<Vec<ToolInvocation>, AgentError> {
        let body = match context.hits.first() {
            Some((hit, RelevanceBand::High)) => {
                format!("{}\n\n(From our documentation: {})", hit.content, hit.title)
            }
            Some((hit, _)) => format!(
                "This might help: {}\n\n{}\n\nIf that doesn't answer it, just reply and I'll dig further.",
                hit.title, hit.content
            ),
            None => {
                "I couldn't find anything in our documentation for that yet. Could you rephrase or add a little more detail?"
                    .to_string()
            }
        };
        Ok(vec![ToolInvocation::SendReply { body }])
    }
}
