//! Pipeline collaborator
//!
//! The scheduler treats one pipeline run as an opaque unit of work: it hands
//! over `(tenant_id, period?)` and gets back either a processed count or a
//! failure with partial counts. Implementations must honour the cancellation
//! token so a timed-out run stops as soon as it can.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::period::Period;

/// One unit of work handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineRequest {
    pub tenant_id: Uuid,
    /// `None` processes the tenant's current data without a period scope
    pub period: Option<Period>,
    pub attempt: i32,
}

/// Successful pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub processed: u64,
    /// Records the pipeline skipped without failing the run
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// Transport failure or 5xx; a later attempt may succeed
    Transient,
    /// The pipeline rejected the request or reported an unsuccessful run
    Permanent,
    /// The run observed its cancellation token
    Cancelled,
    /// The run panicked or was aborted before reporting
    Aborted,
}

impl fmt::Display for PipelineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineErrorKind::Transient => "transient",
            PipelineErrorKind::Permanent => "permanent",
            PipelineErrorKind::Cancelled => "cancelled",
            PipelineErrorKind::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Failed pipeline run, with whatever counts it reported before failing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pipeline {kind} failure: {message}")]
pub struct PipelineError {
    pub kind: PipelineErrorKind,
    pub message: String,
    pub processed: u64,
    pub failed: u64,
}

impl PipelineError {
    pub fn new(kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            processed: 0,
            failed: 0,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Self::new(PipelineErrorKind::Cancelled, "run cancelled")
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(PipelineErrorKind::Aborted, message)
    }

    pub fn with_counts(mut self, processed: u64, failed: u64) -> Self {
        self.processed = processed;
        self.failed = failed;
        self
    }
}

/// External data-processing pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError>;
}

/// Pipeline reached over HTTP: `POST {endpoint}` with the request as JSON.
pub struct HttpPipeline {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    processed: u64,
    #[serde(default)]
    failed: u64,
    #[serde(default)]
    error: Option<String>,
}

fn default_success() -> bool {
    true
}

const BODY_SNIPPET_CHARS: usize = 200;

impl HttpPipeline {
    pub fn new(endpoint: Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("batch-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }

    async fn send(&self, request: &PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|err| PipelineError::transient(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
            let message = format!("pipeline returned {status}: {snippet}");
            return Err(if status.is_server_error() {
                PipelineError::transient(message)
            } else {
                PipelineError::permanent(message)
            });
        }

        let body: RunResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::permanent(format!("malformed pipeline response: {err}")))?;

        if !body.success {
            let message = body
                .error
                .unwrap_or_else(|| "pipeline reported an unsuccessful run".to_string());
            return Err(PipelineError::permanent(message).with_counts(body.processed, body.failed));
        }

        Ok(PipelineOutcome {
            processed: body.processed,
            failed: body.failed,
        })
    }
}

#[async_trait]
impl Pipeline for HttpPipeline {
    async fn run(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::cancelled()),
            result = self.send(&request) => result,
        }
    }
}

/// Succeeds immediately without touching any data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPipeline;

#[async_trait]
impl Pipeline for NoopPipeline {
    async fn run(
        &self,
        request: PipelineRequest,
        _cancel: CancellationToken,
    ) -> Result<PipelineOutcome, PipelineError> {
        tracing::debug!(
            tenant_id = %request.tenant_id,
            period = ?request.period,
            "No-op pipeline run"
        );
        Ok(PipelineOutcome::default())
    }
}
