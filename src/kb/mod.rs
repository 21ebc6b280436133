use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::warn;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;

#[cfg(feature = "vectordb")]
pub mod qdrant;

/// Hits scoring at or above this are safe to answer from directly.
pub const HIGH_RELEVANCE: f32 = 0.70;
/// Hits below this carry no signal and are discarded.
pub const MODERATE_RELEVANCE: f32 = 0.50;

pub type SearchLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Ephemeral search result; consumed within one processing pass, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub title: String,
    pub content: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelevanceBand {
    High,
    Moderate,
    Irrelevant,
}

pub fn band_for(score: f32) -> RelevanceBand {
    if score >= HIGH_RELEVANCE {
        RelevanceBand::High
    } else if score >= MODERATE_RELEVANCE {
        RelevanceBand::Moderate
    } else {
        RelevanceBand::Irrelevant
    }
}

#[derive(Debug, Clone)]
pub enum SearchError {
    Timeout(String),
    Provider(String),
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "Search timeout: {msg}"),
            Self::Provider(msg) => write!(f, "Search provider error: {msg}"),
        }
    }
}

impl std::error::Error for SearchError {}

/// The similarity-search backend, treated as opaque.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>, SearchError>;
}

/// What one retrieval pass produced after banding.
#[derive(Debug, Clone)]
pub struct Retrieval {
    /// Qualifying hits (high or moderate), best first.
    pub hits: Vec<(KnowledgeHit, RelevanceBand)>,
}

impl Retrieval {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn best(&self) -> Option<&KnowledgeHit> {
        self.hits.first().map(|(hit, _)| hit)
    }
}

/// Wraps the opaque provider with relevance banding and the shared rate
/// limit. Never fabricates: zero qualifying hits come back as an empty
/// retrieval and the escalation policy decides what that means. A provider
/// failure folds into the same empty result so one slow search cannot abort
/// the whole event.
pub struct KnowledgeOrchestrator {
    provider: Arc<dyn SearchProvider>,
    limiter: Arc<SearchLimiter>,
    top_k: usize,
}

impl KnowledgeOrchestrator {
    pub fn new(provider: Arc<dyn SearchProvider>, rate_per_second: u32, top_k: usize) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rate_per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            provider,
            limiter: Arc::new(RateLimiter::direct(quota)),
            top_k,
        }
    }

    pub async fn retrieve(&self, query: &str) -> Retrieval {
        // Suspension point shared across all workers: upstream quota.
        self.limiter.until_ready().await;

        let raw = match self.provider.search(query, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Knowledge search failed, treating as zero hits: {e}");
                Vec::new()
            }
        };

        let mut hits: Vec<(KnowledgeHit, RelevanceBand)> = raw
            .into_iter()
            .map(|hit| {
                let band = band_for(hit.score);
                (hit, band)
            })
            .filter(|(_, band)| *band != RelevanceBand::Irrelevant)
            .collect();
        hits.sort_by(|a, b| b.0.score.partial_cmp(&a.0.score).unwrap_or(std::cmp::Ordering::Equal));

        Retrieval { hits }
    }
}

/// Default provider: the HTTP similarity-search endpoint, posting
/// `{query, top_k}` and expecting `[{title, content, score}]`.
pub struct HttpSearchProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>, SearchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query, "top_k": top_k }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SearchError::Timeout(e.to_string())
                } else {
                    SearchError::Provider(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(SearchError::Provider(format!(
                "status {}",
                response.status()
            )));
        }

        response
            .json::<Vec<KnowledgeHit>>()
            .await
            .map_err(|e| SearchError::Provider(e.to_string()))
    }
}
