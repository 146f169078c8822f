//! `ItemPipeline` that delegates every stage to an external worker service.
//!
//! Each stage is one JSON `POST` to `{endpoint}/stages/{stage}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::config::WorkerConfig;
use super::pipeline::ItemPipeline;
use super::types::{DownloadOutcome, PersistOutcome, Stage, StageError, ValidationOutcome};
use crate::scheduler::ChunkTask;

/// Request body for a stage call.
#[derive(Debug, Serialize)]
struct StageRequest<'a, T: Serialize> {
    task: &'a ChunkTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a T>,
}

/// HTTP stage pipeline.
pub struct HttpItemPipeline {
    client: Client,
    endpoint: String,
}

impl HttpItemPipeline {
    /// Create a pipeline calling `endpoint`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, StageError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StageError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Create a pipeline from the `[worker]` section, if an endpoint is set.
    pub fn from_config(config: &WorkerConfig) -> Option<Result<Self, StageError>> {
        let endpoint = config.endpoint.as_deref().filter(|e| !e.is_empty())?;
        Some(Self::new(
            endpoint,
            Duration::from_secs(config.request_timeout_secs),
        ))
    }

    /// Get the base URL without trailing slash.
    fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    async fn call<I, O>(&self, stage: Stage, task: &ChunkTask, input: Option<&I>) -> Result<O, StageError>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let url = format!("{}/stages/{}", self.base_url(), stage.as_str());
        debug!(chunk_id = %task.chunk_id, url = %url, "Calling stage service");

        let response = self
            .client
            .post(&url)
            .json(&StageRequest { task, input })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StageError::Timeout { stage }
                } else if e.is_connect() {
                    StageError::Unavailable(e.to_string())
                } else {
                    StageError::Failed {
                        stage,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StageError::Failed {
                stage,
                message: format!(
                    "HTTP {}: {}",
                    status,
                    body.chars().take(200).collect::<String>()
                ),
            });
        }

        response.json::<O>().await.map_err(|e| StageError::Failed {
            stage,
            message: format!("invalid response: {}", e),
        })
    }
}

#[async_trait]
impl ItemPipeline for HttpItemPipeline {
    fn name(&self) -> &str {
        "http"
    }

    async fn download(&self, task: &ChunkTask) -> Result<DownloadOutcome, StageError> {
        self.call::<(), _>(Stage::Download, task, None).await
    }

    async fn validate(
        &self,
        task: &ChunkTask,
        downloaded: &DownloadOutcome,
    ) -> Result<ValidationOutcome, StageError> {
        self.call(Stage::Validate, task, Some(downloaded)).await
    }

    async fn persist(
        &self,
        task: &ChunkTask,
        validated: &ValidationOutcome,
    ) -> Result<PersistOutcome, StageError> {
        self.call(Stage::Persist, task, Some(validated)).await
    }
}
