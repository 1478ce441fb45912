//! Query side-channel: a plain request/response call next to the stream.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use shared_types::{HealthStatus, QueryAck, QueryRequest};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query request failed: {0}")]
    Request(String),

    #[error("Query endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait QueryClient: Send + Sync + 'static {
    async fn send_query(&self, request: &QueryRequest) -> Result<QueryAck, QueryError>;
}

#[derive(Debug, Clone)]
pub struct HttpQueryClient {
    http: reqwest::Client,
    query_url: String,
}

impl HttpQueryClient {
    pub fn new(http: reqwest::Client, query_url: impl Into<String>) -> Self {
        Self {
            http,
            query_url: query_url.into(),
        }
    }

    pub fn query_url(&self) -> &str {
        &self.query_url
    }
}

#[async_trait]
impl QueryClient for HttpQueryClient {
    async fn send_query(&self, request: &QueryRequest) -> Result<QueryAck, QueryError> {
        let response = self
            .http
            .post(&self.query_url)
            .header(ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }

        // Success bodies are informational only.
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

/// Checks the backend health endpoint.
pub async fn check_health(http: &reqwest::Client, url: &str) -> Result<HealthStatus, QueryError> {
    let response = http
        .get(url)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| QueryError::Request(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(QueryError::Status {
            status: status.as_u16(),
            body: truncate(&body, 200),
        });
    }
    response
        .json::<HealthStatus>()
        .await
        .map_err(|e| QueryError::Request(e.to_string()))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...");
    }
}
