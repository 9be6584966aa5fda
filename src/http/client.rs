//! HTTP client with built-in retry logic.

use anyhow::{Context, Result};
use log::{debug, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::io::Write;

use super::Credentials;
use super::retry::{MAX_RETRIES, RETRY_DELAY_MS, check_retryable, is_retryable};

/// HTTP client wrapping `reqwest` with bounded retry.
#[derive(Clone, Default)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// GET a URL and deserialize the JSON response, retrying transient errors.
    #[tracing::instrument(skip(self, auth))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        auth: Option<&Credentials>,
    ) -> Result<T> {
        debug!("GET JSON from {}...", url);
        let body = self.get_text(url, auth).await?;
        serde_json::from_str(&body).context("Failed to parse JSON response")
    }

    /// GET a URL and return the response body, retrying transient errors.
    pub async fn get_text(&self, url: &str, auth: Option<&Credentials>) -> Result<String> {
        self.with_retry("GET", || async {
            let mut request = self.client.get(url);
            if let Some(credentials) = auth {
                request = credentials.apply(request);
            }

            let response = request.send().await.context("Failed to send request")?;
            let response = response.error_for_status().map_err(check_retryable)?;
            response
                .text()
                .await
                .context("Failed to read response body")
        })
        .await
    }

    /// Download a URL into the writer produced by `create_writer`, retrying
    /// transient errors. Returns the number of bytes written.
    #[tracing::instrument(skip(self, auth, create_writer))]
    pub async fn download_file<W, F>(
        &self,
        url: &str,
        auth: Option<&Credentials>,
        create_writer: F,
    ) -> Result<u64>
    where
        W: Write,
        F: Fn() -> Result<W>,
    {
        debug!("Downloading {}...", url);

        self.with_retry("download", || async {
            let mut request = self.client.get(url);
            if let Some(credentials) = auth {
                request = credentials.apply(request);
            }

            let response = request
                .send()
                .await
                .context("Failed to start download request")?;
            let mut response = response.error_for_status().map_err(check_retryable)?;

            let mut writer = create_writer()?;
            let mut downloaded: u64 = 0;
            while let Some(chunk) = response
                .chunk()
                .await
                .context("Failed to read chunk from download stream")?
            {
                writer
                    .write_all(&chunk)
                    .context("Failed to write downloaded chunk")?;
                downloaded += chunk.len() as u64;
            }

            debug!("Downloaded {} bytes", downloaded);
            Ok(downloaded)
        })
        .await
    }

    async fn with_retry<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !is_retryable(&e) {
                        debug!("{}: non-retryable error: {}", operation_name, e);
                        return Err(e);
                    }
                    if attempt < MAX_RETRIES {
                        warn!(
                            "{}: attempt {}/{} failed ({}), retrying in {}ms...",
                            operation_name, attempt, MAX_RETRIES, e, RETRY_DELAY_MS
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("{}: failed after {} attempts", operation_name, MAX_RETRIES)
        }))
    }
}
