use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::error;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{SmtpConfig, WhatsAppConfig};

/// WhatsApp text messages are rejected above this length by the Graph API.
pub const WHATSAPP_MAX_LEN: usize = 4096;
pub const WEB_MAX_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    WhatsApp,
    Web,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::WhatsApp => write!(f, "whatsapp"),
            Self::Web => write!(f, "web"),
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "email" | "mail" => Ok(Self::Email),
            "whatsapp" | "wa" => Ok(Self::WhatsApp),
            "web" | "webchat" | "chat" => Ok(Self::Web),
            _ => Err(DeliveryError::UnknownChannel(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            provider_message_id: Some(provider_message_id.into()),
        }
    }

    pub fn queued() -> Self {
        Self {
            status: DeliveryStatus::Queued,
            provider_message_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeliveryError {
    UnknownChannel(String),
    InvalidRecipient(String),
    NetworkError(String),
    RateLimited { retry_after: Option<u64> },
    ApiError { code: Option<String>, message: String },
    NotConfigured,
}

impl DeliveryError {
    /// Transient failures are worth retrying with backoff; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError(_) | Self::RateLimited { .. } | Self::ApiError { code: None, .. }
        )
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChannel(name) => write!(f, "Unknown channel: {name}"),
            Self::InvalidRecipient(r) => write!(f, "Invalid recipient: {r}"),
            Self::NetworkError(msg) => write!(f, "Network error: {msg}"),
            Self::RateLimited { retry_after } => {
                if let Some(secs) = retry_after {
                    write!(f, "Rate limited, retry after {secs} seconds")
                } else {
                    write!(f, "Rate limited")
                }
            }
            Self::ApiError { code, message } => {
                if let Some(c) = code {
                    write!(f, "API error [{c}]: {message}")
                } else {
                    write!(f, "API error: {message}")
                }
            }
            Self::NotConfigured => write!(f, "Channel not configured"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Splits text into chunks of at most `max_len` characters, breaking at
/// sentence boundaries where possible and at word boundaries otherwise.
pub fn split_at_sentences(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();

    for sentence in sentence_iter(text) {
        // The joining space counts against the limit too.
        let separator = if current.is_empty() { 0 } else { 1 };
        let candidate_len = current.chars().count() + separator + sentence.chars().count();
        if !current.is_empty() && candidate_len > max_len {
            parts.push(current.trim().to_string());
            current = String::new();
        }
        if sentence.chars().count() > max_len {
            // Single oversized sentence: fall back to word boundaries.
            for word in sentence.split_whitespace() {
                if current.chars().count() + word.chars().count() + 1 > max_len
                    && !current.is_empty()
                {
                    parts.push(current.trim().to_string());
                    current = String::new();
                }
                current.push_str(word);
                current.push(' ');
            }
        } else {
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            current.push_str(sentence);
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn sentence_iter(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let end = i + 1;
            if end >= bytes.len() || bytes[end] == b' ' || bytes[end] == b'\n' {
                sentences.push(&text[start..end.min(text.len())]);
                start = end;
            }
        }
    }
    if start < text.len() {
        sentences.push(&text[start..]);
    }
    sentences
        .into_iter()
        .map(|s| s.trim_start_matches(' '))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Formats outbound content for a channel, returning one or more message
/// parts to deliver in order.
pub fn format_for_channel(
    channel: ChannelType,
    content: &str,
    recipient_name: Option<&str>,
) -> Vec<String> {
    match channel {
        ChannelType::Email => {
            let greeting = match recipient_name {
                Some(name) if !name.is_empty() => format!("Hi {name},\n\n"),
                _ => "Hello,\n\n".to_string(),
            };
            vec![format!(
                "{greeting}{content}\n\nBest regards,\nThe Support Team"
            )]
        }
        ChannelType::WhatsApp => split_at_sentences(content, WHATSAPP_MAX_LEN),
        ChannelType::Web => split_at_sentences(content, WEB_MAX_LEN),
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    fn channel(&self) -> ChannelType;

    async fn send(&self, recipient: &str, content: &str)
        -> Result<DeliveryReceipt, DeliveryError>;
}

/// SMTP delivery for the email channel.
pub struct SmtpDeliveryClient {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpDeliveryClient {
    pub fn new(config: SmtpConfig) -> Result<Self, DeliveryError> {
        let transport = if config.host.is_empty() {
            None
        } else {
            let creds = Credentials::new(config.username.clone(), config.password.clone());
            let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| DeliveryError::NetworkError(format!("SMTP transport: {e}")))?
                .port(config.port)
                .credentials(creds)
                .build();
            Some(transport)
        };
        Ok(Self { config, transport })
    }
}

#[async_trait]
impl DeliveryClient for SmtpDeliveryClient {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let transport = self.transport.as_ref().ok_or(DeliveryError::NotConfigured)?;

        let message = Message::builder()
            .from(self.config.from_address.parse().map_err(|e| {
                error!("Invalid from address {}: {e}", self.config.from_address);
                DeliveryError::NotConfigured
            })?)
            .to(recipient
                .parse()
                .map_err(|e| DeliveryError::InvalidRecipient(format!("{recipient}: {e}")))?)
            .subject("Re: your support request")
            .body(content.to_string())
            .map_err(|e| DeliveryError::ApiError {
                code: Some("build".to_string()),
                message: e.to_string(),
            })?;

        let response = transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::NetworkError(format!("SMTP send: {e}")))?;

        Ok(DeliveryReceipt::sent(
            response.message().collect::<Vec<_>>().join(" "),
        ))
    }
}

/// WhatsApp delivery through the Graph API.
pub struct WhatsAppDeliveryClient {
    config: WhatsAppConfig,
    client: Client,
}

impl WhatsAppDeliveryClient {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl DeliveryClient for WhatsAppDeliveryClient {
    fn channel(&self) -> ChannelType {
        ChannelType::WhatsApp
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        if self.config.access_token.is_empty() {
            return Err(DeliveryError::NotConfigured);
        }

        let url = format!(
            "https://graph.facebook.com/v17.0/{}/messages",
            self.config.phone_number_id
        );

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": recipient,
            "type": "text",
            "text": { "body": content }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(DeliveryError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("WhatsApp API error: {error_text}");
            if status.is_server_error() {
                return Err(DeliveryError::ApiError {
                    code: None,
                    message: error_text,
                });
            }
            return Err(DeliveryError::ApiError {
                code: Some(status.as_u16().to_string()),
                message: error_text,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::NetworkError(e.to_string()))?;
        let provider_id = body["messages"][0]["id"].as_str().unwrap_or_default();

        Ok(DeliveryReceipt::sent(provider_id))
    }
}

/// In-process outbox for the web chat channel. The web UI polls or streams
/// from this outbox; delivery mechanics beyond that are not this crate's
/// concern.
#[derive(Default)]
pub struct WebDeliveryClient {
    outbox: Arc<Mutex<Vec<(String, String)>>>,
}

impl WebDeliveryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<(String, String)> {
        let mut outbox = self.outbox.lock().await;
        std::mem::take(&mut *outbox)
    }
}

#[async_trait]
impl DeliveryClient for WebDeliveryClient {
    fn channel(&self) -> ChannelType {
        ChannelType::Web
    }

    async fn send(
        &self,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut outbox = self.outbox.lock().await;
        outbox.push((recipient.to_string(), content.to_string()));
        Ok(DeliveryReceipt::queued())
    }
}
