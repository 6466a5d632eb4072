//! API client for authenticated calls to the archive backend.
//!
//! Every request goes through the [`RequestPipeline`], so an expired access
//! token is refreshed and the call resent without the caller noticing.

use std::time::Duration;

use reqwest::{header, Method};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::auth::ME_PATH;
use super::{ApiError, RequestPipeline};
use crate::models::{ImportProgress, UserProfile};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Default delay between import progress polls.
pub const DEFAULT_IMPORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// API client for the archive backend.
/// Clone is cheap - the pipeline and reqwest::Client are shared.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: RequestPipeline,
    base_url: String,
}

impl ApiClient {
    pub fn new(pipeline: RequestPipeline, base_url: impl Into<String>) -> Self {
        Self {
            pipeline,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn send<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut builder = self
            .pipeline
            .client()
            .request(method, self.url(path))
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }

        // One attempt for the whole call; rate-limit resends share its
        // retried flag
        let mut attempt = self.pipeline.begin(builder.build()?);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.pipeline.send(&mut attempt).await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e))
                    });
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(path, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(Method::POST, path, Some(body)).await
    }

    // ===== Account =====

    /// Fetch the profile of the logged-in user
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.get(ME_PATH).await
    }

    // ===== Import Jobs =====

    /// Current progress of a streaming import job
    pub async fn import_progress(&self, job_id: &str) -> Result<ImportProgress, ApiError> {
        let job_id = job_id.trim();
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ApiError::BadRequest(format!("Invalid import job id: {:?}", job_id)));
        }
        self.get(&format!("/import/progress/{}", job_id)).await
    }

    /// Poll an import job until it completes or fails.
    ///
    /// `on_progress` sees every intermediate snapshot, including the last.
    pub async fn wait_for_import<F>(
        &self,
        job_id: &str,
        interval: Duration,
        mut on_progress: F,
    ) -> Result<ImportProgress, ApiError>
    where
        F: FnMut(&ImportProgress),
    {
        loop {
            let progress = self.import_progress(job_id).await?;
            on_progress(&progress);
            if progress.status.is_terminal() {
                info!(
                    job_id,
                    status = progress.status.display_name(),
                    imported = progress.imported_messages,
                    "Import finished"
                );
                return Ok(progress);
            }
            debug!(job_id, processed = progress.processed_messages, "Import still running");
            tokio::time::sleep(interval).await;
        }
    }
}
