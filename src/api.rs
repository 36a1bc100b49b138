//! REST client for the transcription service
//!
//! Covers the one-shot transcript fetch used for initial and historical
//! loads, plus the two consumed mutation calls: stopping a live meeting
//! bot and changing the recognition language. The fetch retries transient
//! failures; the mutation calls surface their errors directly so the UI
//! never claims a state the server did not confirm.

use crate::protocol::{MeetingRef, WireSegment};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};
use zeroize::Zeroize;

/// Maximum number of retry attempts for transient fetch failures
const MAX_RETRIES: u32 = 3;

/// Initial delay between retries (doubles with each attempt)
const INITIAL_RETRY_DELAY_MS: u64 = 1000;

/// REST API errors
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },
}

/// One-shot transcript fetch response
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TranscriptResponse {
    #[serde(default)]
    pub segments: Vec<WireSegment>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Language-change request body
#[derive(Debug, Serialize)]
struct LanguageUpdate<'a> {
    language: &'a str,
}

/// Client for the transcription service REST API
pub(crate) struct ApiClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new API client
    pub(crate) fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for ApiClient")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    /// Fetch the current transcript for a meeting.
    ///
    /// Used for the initial live-view load and for historical views.
    /// Includes retry logic for transient network failures.
    #[instrument(skip(self), fields(meeting = %meeting))]
    pub(crate) async fn fetch_transcript(
        &self,
        meeting: &MeetingRef,
    ) -> Result<TranscriptResponse, ApiError> {
        let url = format!("{}/transcripts/{}", self.base_url, meeting);

        let mut last_error: Option<ApiError> = None;
        let mut retry_delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS);

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                warn!(
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    delay_ms = retry_delay.as_millis(),
                    "Retrying transcript fetch after transient failure"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let result = self
                .client
                .get(&url)
                .header("X-API-Key", &self.api_key)
                .send()
                .await;

            match result {
                Ok(response) => {
                    if response.status().is_success() {
                        let transcript: TranscriptResponse =
                            response.json().await.map_err(|e| {
                                ApiError::InvalidResponse(format!(
                                    "Failed to parse transcript response: {}",
                                    e
                                ))
                            })?;

                        if attempt > 0 {
                            info!(attempt = attempt, "Transcript fetch succeeded after retry");
                        }

                        return Ok(transcript);
                    }

                    let status = response.status().as_u16();
                    let message = response.text().await.unwrap_or_default();
                    let error = ApiError::ServerError { status, message };

                    // Retry on 5xx server errors
                    if (500..600).contains(&status) && attempt < MAX_RETRIES {
                        warn!(status = status, attempt = attempt, "Server error, will retry");
                        last_error = Some(error);
                        continue;
                    }

                    return Err(error);
                }
                Err(e) => {
                    // Retry on network errors
                    if is_retryable_error(&e) && attempt < MAX_RETRIES {
                        warn!(error = %e, attempt = attempt, "Network error, will retry");
                        last_error = Some(ApiError::Network(e));
                        continue;
                    }

                    return Err(ApiError::Network(e));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ApiError::InvalidResponse("Unexpected retry loop exit".into())))
    }

    /// End a live meeting server-side.
    ///
    /// No retry: this is an explicit user action and the outcome must be
    /// reported truthfully.
    #[instrument(skip(self), fields(meeting = %meeting))]
    pub(crate) async fn stop_meeting(&self, meeting: &MeetingRef) -> Result<(), ApiError> {
        let url = format!("{}/bots/{}", self.base_url, meeting);

        let response = self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        check_status(response).await?;
        info!("Stopped meeting");
        Ok(())
    }

    /// Change the server-side recognition language.
    ///
    /// Callers clear local transcript state only after this succeeds.
    #[instrument(skip(self), fields(meeting = %meeting, language = language))]
    pub(crate) async fn update_language(
        &self,
        meeting: &MeetingRef,
        language: &str,
    ) -> Result<(), ApiError> {
        let url = format!("{}/bots/{}/config", self.base_url, meeting);

        let response = self
            .client
            .put(&url)
            .header("X-API-Key", &self.api_key)
            .json(&LanguageUpdate { language })
            .send()
            .await?;

        check_status(response).await?;
        info!("Updated recognition language");
        Ok(())
    }
}

/// Map a non-success response to a ServerError
async fn check_status(response: reqwest::Response) -> Result<(), ApiError> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::ServerError { status, message })
}

/// Check if a reqwest error is retryable (transient)
fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        // Clear API key from memory
        self.api_key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_response_deserialization() {
        let json = r#"{
            "segments": [
                {
                    "text": "hello everyone",
                    "speaker": "Ana",
                    "absolute_start_time": "2025-03-01T10:00:00Z",
                    "absolute_end_time": "2025-03-01T10:00:03Z",
                    "updated_at": "2025-03-01T10:00:04Z"
                }
            ],
            "status": "active",
            "language": "en"
        }"#;

        let response: TranscriptResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.segments.len(), 1);
        assert_eq!(response.segments[0].text.as_deref(), Some("hello everyone"));
        assert_eq!(response.status.as_deref(), Some("active"));
        assert_eq!(response.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_transcript_response_defaults() {
        let response: TranscriptResponse = serde_json::from_str("{}").unwrap();
        assert!(response.segments.is_empty());
        assert!(response.status.is_none());
        assert!(response.language.is_none());
    }

    #[test]
    fn test_language_update_serialization() {
        let json = serde_json::to_string(&LanguageUpdate { language: "de" }).unwrap();
        assert_eq!(json, r#"{"language":"de"}"#);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("https://api.example.com/", "key").unwrap();
        assert_eq!(client.base_url, "https://api.example.com");
    }
}
