pub mod http;
pub mod matching;

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub use http::{HttpLookupService, HttpStreamExtractor, ReqwestFetcher};

/// A stream candidate returned by the lookup service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub video_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub length_seconds: Option<u32>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// One page of lookup results
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    #[serde(default)]
    pub videos: Vec<Video>,
    #[serde(default)]
    pub has_more: bool,
}

/// Extraction service payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub audio_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl StreamInfo {
    pub fn duration_seconds(&self) -> Option<u32> {
        self.duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d as u32)
    }
}

/// Raw response from a plain GET
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures of the external services.
///
/// The display strings are what the proxy breaker classifies on, so transport
/// variants keep the wording of the underlying error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("not found")]
    NotFound,
    #[error("HTTP 429 rate limited")]
    RateLimited,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("request timeout")]
    Timeout,
    #[error("request aborted")]
    Aborted,
    #[error("failed to fetch: {0}")]
    Connect(String),
    #[error("{0}")]
    Transport(String),
}

impl SourceError {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => SourceError::NotFound,
            429 => SourceError::RateLimited,
            other => SourceError::Status(other),
        }
    }
}

/// Video search
#[async_trait]
pub trait LookupService: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchPage, SourceError>;
}

/// Converts an external id into a playable stream URL
#[async_trait]
pub trait StreamExtractor: Send + Sync {
    async fn extract(&self, external_id: &str) -> Result<StreamInfo, SourceError>;
}

/// Reads the duration of a stream from its metadata
#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// Duration in whole seconds, `None` when it cannot be determined
    async fn probe(&self, url: &str) -> Option<u32>;
}

/// Plain GET used by the proxy breaker and stream validation
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, SourceError>;
}
