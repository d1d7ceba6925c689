//! Subgraph client and the upstream event source seam.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use cohort_core::{EventBatch, Protocol};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::events::{decode_head, fetch_events, META_QUERY};

/// Upstream source of one protocol's events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Protocol served by this source.
    fn protocol(&self) -> Protocol;

    /// Highest block number currently indexed upstream.
    async fn current_head(&self) -> Result<u64>;

    /// Every event in exactly the given blocks, grouped by selector.
    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch>;
}

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    fn protocol(&self) -> Protocol {
        (**self).protocol()
    }

    async fn current_head(&self) -> Result<u64> {
        (**self).current_head().await
    }

    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        (**self).events_for_blocks(blocks).await
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Map<String, Value>>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    /// A non-empty `errors` array or a missing `data` object is a failure.
    fn into_data(self) -> Result<Map<String, Value>> {
        if !self.errors.is_empty() {
            let messages: Vec<_> = self.errors.into_iter().map(|e| e.message).collect();
            bail!("Subgraph returned errors: {}", messages.join("; "));
        }

        self.data
            .ok_or_else(|| anyhow!("Subgraph response carries no data"))
    }
}

/// GraphQL-over-HTTP client for one protocol's subgraph.
#[derive(Debug, Clone)]
pub struct SubgraphProvider {
    client: reqwest::Client,
    endpoint: String,
    protocol: Protocol,
}

impl SubgraphProvider {
    /// Create a provider for `protocol` at `endpoint`.
    pub fn new(protocol: Protocol, endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cohort-indexer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            protocol,
        })
    }

    /// Subgraph endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&self, query: &str) -> Result<Map<String, Value>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query }))
            .send()
            .await
            .with_context(|| format!("Failed to reach subgraph at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Subgraph HTTP error {}: {}", status, body);
        }

        let body: GraphQlResponse = response
            .json()
            .await
            .context("Failed to decode subgraph response")?;

        body.into_data()
    }
}

#[async_trait]
impl EventSource for SubgraphProvider {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn current_head(&self) -> Result<u64> {
        let data = self.query(META_QUERY).await?;
        decode_head(&data).with_context(|| format!("Failed to read {} head", self.protocol))
    }

    async fn events_for_blocks(&self, blocks: &[u64]) -> Result<EventBatch> {
        debug!(protocol = %self.protocol, ?blocks, "Querying subgraph events");

        fetch_events(self.protocol, blocks, |query| async move { self.query(&query).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<Map<String, Value>> {
        serde_json::from_str::<GraphQlResponse>(body)
            .unwrap()
            .into_data()
    }

    #[test]
    fn test_errors_array_is_a_failure() {
        let err = parse(r#"{"data": null, "errors": [{"message": "indexing_error"}]}"#).unwrap_err();
        assert!(err.to_string().contains("indexing_error"));

        // Partial data alongside errors is still rejected.
        assert!(parse(r#"{"data": {"swaps": []}, "errors": [{"message": "x"}]}"#).is_err());
    }

    #[test]
    fn test_missing_data_is_a_failure() {
        assert!(parse("{}").is_err());
        assert!(parse(r#"{"data": null}"#).is_err());
    }

    #[test]
    fn test_data_is_returned() {
        let data = parse(r#"{"data": {"swaps": []}, "errors": []}"#).unwrap();
        assert!(data.contains_key("swaps"));
    }

    #[test]
    fn test_provider_construction() {
        let provider =
            SubgraphProvider::new(Protocol::Lido, "http://localhost:8000", Duration::from_secs(5))
                .unwrap();
        assert_eq!(provider.protocol(), Protocol::Lido);
        assert_eq!(provider.endpoint(), "http://localhost:8000");
    }
}
