//! Client for the long-term memory collaborator.
//!
//! The memory service owns digest generation; berth only fetches the text it
//! produces and splices it into the system prompt at sync time.

use crate::error::Result;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait MemoryService: Send + Sync + 'static {
    /// Context digest to prepend to the system prompt. `None` when the user
    /// has no memories yet.
    async fn digest(&self, user_id: &str) -> Result<Option<String>>;

    /// Instructions telling the agent how to write new memories back.
    async fn write_instructions(&self, user_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    #[serde(default)]
    text: Option<String>,
}

/// HTTP implementation talking to `GET {base}/users/{user}/digest` and
/// `GET {base}/users/{user}/instructions`.
#[derive(Debug, Clone)]
pub struct HttpMemoryService {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpMemoryService {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build memory HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token,
        })
    }

    async fn fetch_text(&self, user_id: &str, resource: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/users/{}/{resource}",
            self.base_url.trim_end_matches('/'),
            user_id
        );

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to fetch memory {resource}"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("memory {resource} request failed: {status} {body}").into());
        }

        let payload: TextResponse = response
            .json()
            .await
            .with_context(|| format!("failed to decode memory {resource} response"))?;

        Ok(payload
            .text
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }
}

#[async_trait]
impl MemoryService for HttpMemoryService {
    async fn digest(&self, user_id: &str) -> Result<Option<String>> {
        self.fetch_text(user_id, "digest").await
    }

    async fn write_instructions(&self, user_id: &str) -> Result<Option<String>> {
        self.fetch_text(user_id, "instructions").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_one_shot_server;

    #[tokio::test]
    async fn digest_sends_bearer_and_trims_text() {
        let (base_url, rx) = spawn_one_shot_server("200 OK", r#"{"text":"  likes tea \n"}"#);
        let service = HttpMemoryService::new(base_url, Some("mem-token".into())).unwrap();

        let digest = service.digest("alice").await.expect("digest succeeds");
        assert_eq!(digest.as_deref(), Some("likes tea"));

        let req = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("captured request");
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/users/alice/digest");
        assert_eq!(
            req.headers.get("authorization").map(String::as_str),
            Some("Bearer mem-token")
        );
    }

    #[tokio::test]
    async fn missing_memory_is_none() {
        let (base_url, _rx) = spawn_one_shot_server("404 Not Found", "{}");
        let service = HttpMemoryService::new(base_url, None).unwrap();
        assert_eq!(service.write_instructions("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_errors_surface_body() {
        let (base_url, _rx) = spawn_one_shot_server("503 Service Unavailable", "index rebuilding");
        let service = HttpMemoryService::new(base_url, None).unwrap();

        let error = service.digest("bob").await.expect_err("503 must fail");
        let message = error.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("index rebuilding"));
    }
}
