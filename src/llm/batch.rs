//! Client for the OpenAI-compatible batch API.
//!
//! A batch is an uploaded JSONL file of requests that the service works
//! through asynchronously. This module only moves files and reads job
//! state; it does not interpret the requests or results.

use crate::config::LlmConfig;
use crate::error::{EvalError, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Lifecycle state of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Validating,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
    Expired,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    /// Whether the job will not change state any more.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

/// Uploaded file handle.
#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
}

/// Batch job as reported by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub input_file_id: Option<String>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Serialize)]
struct CreateBatchRequest<'a> {
    input_file_id: &'a str,
    endpoint: &'a str,
    completion_window: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Batch API client.
#[derive(Clone)]
pub struct BatchClient {
    client: Client,
    api_base: String,
    api_key: String,
}

impl BatchClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }

    async fn send_raw(&self, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            if let Ok(api_error) = serde_json::from_str::<ApiError>(&text) {
                return Err(EvalError::LlmApi(format!(
                    "API error ({}): {}",
                    status, api_error.error.message
                )));
            }
            return Err(EvalError::LlmApi(format!(
                "Request failed ({}): {}",
                status, text
            )));
        }

        Ok(body.to_vec())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send_raw(request).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Upload a JSONL request file for batch processing.
    pub async fn upload_file(&self, path: &Path) -> Result<FileObject> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EvalError::io(path, e))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("batch_input.jsonl")
            .to_string();

        let form = Form::new()
            .text("purpose", "batch")
            .part("file", Part::bytes(bytes).file_name(file_name));

        self.send_json(self.client.post(self.url("/v1/files")).multipart(form))
            .await
    }

    /// Create a batch job over an uploaded file.
    pub async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        completion_window: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<BatchJob> {
        let request = CreateBatchRequest {
            input_file_id,
            endpoint,
            completion_window,
            metadata,
        };
        self.send_json(self.client.post(self.url("/v1/batches")).json(&request))
            .await
    }

    /// Fetch the current state of a batch job.
    pub async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob> {
        let url = self.url(&format!("/v1/batches/{}", batch_id));
        self.send_json(self.client.get(url)).await
    }

    /// Download the raw content of a file.
    pub async fn file_content(&self, file_id: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("/v1/files/{}/content", file_id));
        self.send_raw(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        let job: BatchJob = serde_json::from_str(
            r#"{"id": "batch_1", "status": "in_progress", "output_file_id": null}"#,
        )
        .unwrap();
        assert_eq!(job.status, BatchStatus::InProgress);
        assert!(!job.status.is_terminal());
        assert!(job.output_file_id.is_none());

        let job: BatchJob = serde_json::from_str(
            r#"{"id": "batch_1", "status": "completed", "output_file_id": "file-9",
                "request_counts": {"total": 3, "completed": 3, "failed": 0}}"#,
        )
        .unwrap();
        assert!(job.status.is_terminal());
        assert_eq!(job.output_file_id.as_deref(), Some("file-9"));
        assert_eq!(job.request_counts.unwrap().completed, 3);
    }

    #[test]
    fn test_terminal_states() {
        for status in [
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Cancelled,
            BatchStatus::Expired,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            BatchStatus::Validating,
            BatchStatus::InProgress,
            BatchStatus::Finalizing,
            BatchStatus::Cancelling,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_unknown_status_tolerated() {
        let status: BatchStatus = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(status, BatchStatus::Unknown);
    }

    #[test]
    fn test_url_construction() {
        let config = LlmConfig {
            api_base: "https://api.example.com/".to_string(),
            ..Default::default()
        };
        let client = BatchClient::new(&config);
        assert_eq!(client.url("/v1/batches"), "https://api.example.com/v1/batches");
    }
}
