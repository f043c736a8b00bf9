//! # Rentbox Client
//!
//! Async HTTP clients used around the sandbox:
//!
//! - [`SessionClient`] talks to the session service on behalf of a lender: it asks for
//!   the next pending job and reports results back.
//! - [`RentboxClient`] submits jobs to a `rentbox_server`.
//!
//! ## Example: Polling for Work
//!
//! ```no_run
//! use rentbox_client::SessionClient;
//!
//! async fn poll() -> Result<(), rentbox_client::ClientError> {
//!     let session = SessionClient::new("https://sessions.example.com", "lender-token");
//!
//!     if let Some(job) = session.next_job().await? {
//!         println!("job {} wants {}", job.job_id, job.language);
//!     }
//!     Ok(())
//! }
//! ```

use rentbox_core::prelude::{routes::*, *};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned error {0}: {1}")]
    ServerError(StatusCode, String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A job the session service wants this lender to execute.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingJob {
    pub job_id: String,
    pub language: String,
    pub source_code: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl std::fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingJob")
            .field("job_id", &self.job_id)
            .field("language", &self.language)
            .field("source_code", &format_args!("<{} bytes>", self.source_code.len()))
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl From<PendingJob> for JobRequest {
    fn from(job: PendingJob) -> Self {
        JobRequest {
            job_id: Some(job.job_id),
            language: job.language,
            source_code: job.source_code,
            dependencies: job.dependencies,
            timeout_ms: job.timeout_ms,
        }
    }
}

/// Lender-side client of the session service. Authenticates with a bearer token.
#[derive(Clone)]
pub struct SessionClient {
    base_url: String,
    client: Client,
    token: String,
}

impl SessionClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: trim_base(base_url.into()),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token: token.into(),
        }
    }

    fn auth_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    /// The next job waiting for this lender, if any.
    pub async fn next_job(&self) -> Result<Option<PendingJob>> {
        let url = format!("{}{}", self.base_url, LENDER_NEXT_JOB);
        let response = self.auth_request(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerError(status, text));
        }

        let job: PendingJob = response
            .json()
            .await
            .map_err(|e| ClientError::Validation(format!("Failed to parse pending job: {e}")))?;

        Ok(Some(job))
    }

    /// Sends a finished job's result back to the session service.
    pub async fn report(&self, job_id: &str, result: &ExecutionResult) -> Result<()> {
        let url = self.result_url(job_id)?;
        let response = self
            .auth_request(self.client.post(url))
            .json(result)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerError(status, text));
        }

        Ok(())
    }

    /// [`LENDER_JOB_RESULT`] under the base url, with `job_id` as one encoded segment.
    fn result_url(&self, job_id: &str) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Validation(format!("Invalid session url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Validation(format!("Invalid session url: {}", self.base_url)))?
            .pop_if_empty()
            .extend(
                LENDER_JOB_RESULT
                    .trim_start_matches('/')
                    .split('/')
                    .map(|segment| if segment == "{id}" { job_id } else { segment }),
            );
        Ok(url)
    }
}

/// Client of a `rentbox_server`.
#[derive(Clone)]
pub struct RentboxClient {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl RentboxClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: trim_base(base_url.into()),
            client: Client::new(),
            token,
        }
    }

    fn auth_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            builder.bearer_auth(token)
        } else {
            builder
        }
    }

    pub async fn health(&self) -> Result<()> {
        let url = format!("{}{}", self.base_url, HEALTH);
        let response = self.auth_request(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerError(status, text));
        }
        Ok(())
    }

    /// Runs a job on the server and waits for its result.
    pub async fn execute(&self, request: &JobRequest) -> Result<ExecutionResult> {
        let url = format!("{}{}", self.base_url, JOBS_EXECUTE);
        let response = self
            .auth_request(self.client.post(&url))
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerError(status, text));
        }

        let result: ExecutionResult = response
            .json()
            .await
            .map_err(|_| ClientError::Validation("Failed to parse execution result".into()))?;

        Ok(result)
    }

    pub async fn active_jobs(&self) -> Result<Vec<String>> {
        let url = format!("{}{}", self.base_url, JOBS_ACTIVE);
        let response = self.auth_request(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::ServerError(status, text));
        }

        Ok(response.json().await?)
    }
}

fn trim_base(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
