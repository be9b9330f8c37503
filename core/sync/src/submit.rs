//! Remote submission collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use fieldsync_common::{Category, Error, FailureReason, RecordId, Result, SurveyRecord};

/// Body sent to the backend for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub record_id: RecordId,
    pub category: Category,
    pub modified_at: DateTime<Utc>,
    pub survey: Map<String, Value>,
}

impl From<&SurveyRecord> for SubmissionPayload {
    fn from(record: &SurveyRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            category: record.category,
            modified_at: record.modified_at,
            survey: record.payload.clone(),
        }
    }
}

/// Backend answer for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl SubmissionResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Accepts one record's payload at a time.
///
/// The orchestrator treats `Ok` with `success == false` and any `Err`
/// identically: the record's submission failed.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Client name for logging (e.g., "http").
    fn name(&self) -> &str;

    /// Submit a single record.
    ///
    /// # Errors
    /// - `Network` if the endpoint could not be reached (retryable)
    /// - `Submission` for timeouts and malformed responses
    async fn submit(&self, payload: &SubmissionPayload) -> Result<SubmissionResponse>;
}

/// Submits records as JSON to `<endpoint>/<category-path>`.
pub struct HttpSubmissionClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpSubmissionClient {
    /// Create a client for a base endpoint.
    ///
    /// `timeout` bounds each HTTP request; the orchestrator applies its own
    /// timeout on top.
    pub fn new(mut endpoint: Url, timeout: Duration) -> Result<Self> {
        if endpoint.cannot_be_a_base() {
            return Err(Error::Config(format!("Endpoint {} cannot be a base URL", endpoint)));
        }
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }

    /// URL records of a category are posted to.
    pub fn url_for(&self, category: Category) -> Result<Url> {
        self.endpoint
            .join(category.endpoint_path())
            .map_err(|e| Error::Config(format!("Endpoint URL: {}", e)))
    }
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<SubmissionResponse> {
        let url = self.url_for(payload.category)?;
        debug!("POST {} for {}", url, payload.record_id);

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<SubmissionResponse>()
                .await
                .ok()
                .and_then(|body| body.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Ok(SubmissionResponse::rejected(message));
        }

        response.json::<SubmissionResponse>().await.map_err(|e| {
            Error::Submission(FailureReason::Transport(format!("Invalid response body: {}", e)))
        })
    }
}

fn map_send_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Submission(FailureReason::Timeout)
    } else if e.is_connect() {
        Error::Network(e.to_string())
    } else {
        Error::Submission(FailureReason::Transport(e.to_string()))
    }
}
