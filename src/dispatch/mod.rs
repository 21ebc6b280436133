use log::{error, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channels::{ChannelType, DeliveryClient, DeliveryError, DeliveryReceipt};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
        }
    }
}

#[derive(Debug)]
pub enum DispatchError {
    NoClient(ChannelType),
    /// Non-retryable delivery failure.
    Permanent(DeliveryError),
    /// Retries exhausted; the caller routes the event to the dead-letter
    /// path and leaves the ticket untouched.
    Exhausted {
        attempts: u32,
        last: DeliveryError,
    },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoClient(channel) => write!(f, "No delivery client for channel {channel}"),
            Self::Permanent(e) => write!(f, "Permanent delivery failure: {e}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "Delivery failed after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Selects the channel formatter, drives the delivery client, and retries
/// transient failures with exponential backoff. State mutations and the
/// idempotency mark always commit before this runs, so a failure here never
/// makes the system believe the event was unprocessed.
pub struct Dispatcher {
    clients: HashMap<ChannelType, Arc<dyn DeliveryClient>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            clients: HashMap::new(),
            config,
        }
    }

    pub fn register(&mut self, client: Arc<dyn DeliveryClient>) {
        self.clients.insert(client.channel(), client);
    }

    /// Formats `content` for the channel and delivers every part in order.
    /// Returns the receipt of the last part.
    pub async fn dispatch(
        &self,
        channel: ChannelType,
        recipient: &str,
        content: &str,
        recipient_name: Option<&str>,
    ) -> Result<DeliveryReceipt, DispatchError> {
        let client = self
            .clients
            .get(&channel)
            .ok_or(DispatchError::NoClient(channel))?;

        let parts = crate::channels::format_for_channel(channel, content, recipient_name);
        let mut receipt = DeliveryReceipt::queued();
        for part in &parts {
            receipt = self.send_with_retry(client.as_ref(), recipient, part).await?;
        }
        Ok(receipt)
    }

    async fn send_with_retry(
        &self,
        client: &dyn DeliveryClient,
        recipient: &str,
        content: &str,
    ) -> Result<DeliveryReceipt, DispatchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.send(recipient, content).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if !e.is_transient() => {
                    error!("Permanent delivery failure on {}: {e}", client.channel());
                    return Err(DispatchError::Permanent(e));
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    error!(
                        "Delivery exhausted after {attempt} attempts on {}: {e}",
                        client.channel()
                    );
                    return Err(DispatchError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let backoff = self.backoff_for(attempt, &e);
                    warn!(
                        "Transient delivery failure on {} (attempt {attempt}), retrying in {:?}: {e}",
                        client.channel(),
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32, error: &DeliveryError) -> Duration {
        if let DeliveryError::RateLimited {
            retry_after: Some(secs),
        } = error
        {
            return Duration::from_secs(*secs);
        }
        let base = self.config.base_backoff_ms * 2u64.pow(attempt.saturating_sub(1));
        let jitter = rand::thread_rng().gen_range(0..self.config.base_backoff_ms / 2 + 1);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::DeliveryStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Fails the first `failures` sends, then succeeds.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
        sent: Mutex<Vec<String>>,
        transient: bool,
    }

    impl FlakyClient {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
                transient,
            }
        }
    }

    #[async_trait]
    impl DeliveryClient for FlakyClient {
        fn channel(&self) -> ChannelType {
            ChannelType::Web
        }

        async fn send(
            &self,
            _recipient: &str,
            content: &str,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    DeliveryError::NetworkError("flap".to_string())
                } else {
                    DeliveryError::InvalidRecipient("nope".to_string())
                });
            }
            self.sent.lock().await.push(content.to_string());
            Ok(DeliveryReceipt::sent("p-1"))
        }
    }

    fn dispatcher_with(client: Arc<FlakyClient>) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(DispatchConfig {
            max_attempts: 3,
            base_backoff_ms: 1,
        });
        dispatcher.register(client);
        dispatcher
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let client = Arc::new(FlakyClient::new(2, true));
        let dispatcher = dispatcher_with(client.clone());
        let receipt = dispatcher
            .dispatch(ChannelType::Web, "r", "hello", None)
            .await
            .unwrap();
        assert_eq!(receipt.status, DeliveryStatus::Sent);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_reported_with_attempt_count() {
        let client = Arc::new(FlakyClient::new(10, true));
        let dispatcher = dispatcher_with(client);
        let err = dispatcher
            .dispatch(ChannelType::Web, "r", "hello", None)
            .await
            .unwrap_err();
        match err {
            DispatchError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let client = Arc::new(FlakyClient::new(10, false));
        let dispatcher = dispatcher_with(client.clone());
        let err = dispatcher
            .dispatch(ChannelType::Web, "r", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Permanent(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_client_is_an_error() {
        let dispatcher = Dispatcher::new(DispatchConfig::default());
        let err = dispatcher
            .dispatch(ChannelType::Email, "r", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoClient(ChannelType::Email)));
    }
}
