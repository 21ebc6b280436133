use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::SearchPoints;
use qdrant_client::Qdrant;
use std::sync::Arc;

use crate::kb::{KnowledgeHit, SearchError, SearchProvider};

/// Turns query text into the vector the collection was indexed with. The
/// embedding computation itself is an external collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

/// Knowledge search over a qdrant collection. Payloads are expected to carry
/// `title` and `content` string fields, matching what the indexer writes.
pub struct QdrantSearchProvider {
    client: Qdrant,
    collection: String,
    embedder: Arc<dyn Embedder>,
}

impl QdrantSearchProvider {
    pub fn new(url: &str, collection: impl Into<String>, embedder: Arc<dyn Embedder>) -> Result<Self, SearchError> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| SearchError::Provider(e.to_string()))?;
        Ok(Self {
            client,
            collection: collection.into(),
            embedder,
        })
    }
}

fn payload_str(
    payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
    key: &str,
) -> String {
    payload
        .get(key)
        .and_then(|v| match &v.kind {
            Some(Kind::StringValue(s)) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchProvider for QdrantSearchProvider {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<KnowledgeHit>, SearchError> {
        let vector = self.embedder.embed(query).await?;

        let response = self
            .client
            .search_points(SearchPoints {
                collection_name: self.collection.clone(),
                vector,
                limit: top_k as u64,
                with_payload: Some(true.into()),
                ..Default::default()
            })
            .await
            .map_err(|e| SearchError::Provider(e.to_string()))?;

        Ok(response
            .result
            .into_iter()
            .map(|point| KnowledgeHit {
                title: payload_str(&point.payload, "title"),
                content: payload_str(&point.payload, "content"),
                score: point.score,
            })
            .collect())
    }
}
