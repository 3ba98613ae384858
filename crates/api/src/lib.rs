//! Client for the remote generation endpoint.
//!
//! The engine only depends on the [`JobApi`] contract; [`HttpJobApi`] is
//! the production implementation speaking the endpoint's REST surface:
//! `POST /run`, `GET /status/{id}`, `POST /cancel/{id}`, `GET /health`.
//! Every call can fail by transport error, non-success status code, or
//! malformed body, and callers are expected to treat all three as
//! recoverable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport: {0}")]
    Transport(reqwest::Error),
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Protocol(e.to_string())
        } else {
            ApiError::Transport(e)
        }
    }
}

/// Body of `POST /run`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    pub input: SubmitInput,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitInput {
    pub prompt: String,
    pub image_base64: String,
    pub seed: i64,
    pub cfg: f32,
    pub width: u32,
    pub height: u32,
    pub length: u32,
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lora_pairs: Vec<LoraPairInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoraPairInput {
    pub high: String,
    pub low: String,
    pub high_weight: f32,
    pub low_weight: f32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned job id. Callers fall back to a locally generated
    /// id when the server omits it.
    pub id: Option<String>,
}

/// Body of `GET /status/{id}`. A response without a `status` field is
/// treated by the engine as a skippable tick, so the field stays
/// optional here rather than failing deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    pub status: Option<String>,
    pub output: Option<serde_json::Value>,
    pub video: Option<String>,
    pub error: Option<String>,
}

impl StatusResponse {
    /// Locate the video artifact payload, checking the common locations
    /// in order: `output.video`, a bare string `output`, then a
    /// top-level `video` field.
    pub fn video_payload(&self) -> Option<&str> {
        if let Some(output) = &self.output {
            if let Some(video) = output.get("video").and_then(|v| v.as_str()) {
                return Some(video);
            }
            if let Some(video) = output.as_str() {
                return Some(video);
            }
        }
        self.video.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthReport {
    pub status: Option<String>,
    #[serde(default)]
    pub workers: WorkerStats,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerStats {
    #[serde(default)]
    pub ready: u32,
    #[serde(default)]
    pub running: u32,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status.as_deref() == Some("running") || self.workers.ready > 0
    }
}

/// Contract the queue engine depends on.
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError>;
    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError>;
    async fn cancel(&self, job_id: &str) -> Result<(), ApiError>;
    async fn health(&self) -> Result<HealthReport, ApiError>;
}

pub struct HttpJobApi {
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        Self {
            endpoint,
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, ApiError> {
        let response = self
            .client
            .post(self.url("run"))
            .header("Authorization", &self.api_key)
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn status(&self, job_id: &str) -> Result<StatusResponse, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("status/{job_id}")))
            .header("Authorization", &self.api_key)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("cancel/{job_id}")))
            .header("Authorization", &self.api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn health(&self) -> Result<HealthReport, ApiError> {
        let response = self
            .client
            .get(self.url("health"))
            .header("accept", "application/json")
            .header("Authorization", &self.api_key)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
