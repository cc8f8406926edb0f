use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{
    HttpFetch, HttpResponse, LookupService, SearchPage, SourceError, StreamExtractor, StreamInfo,
    Video,
};

/// Map a reqwest failure onto the wording the proxy breaker classifies
fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if err.is_connect() {
        SourceError::Connect(err.to_string())
    } else {
        SourceError::Transport(err.to_string())
    }
}

/// `HttpFetch` over a shared reqwest client
#[derive(Clone, Default)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, SourceError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.map_err(transport_error)?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Video search over the lookup function (`?action=search&q=...`)
pub struct HttpLookupService {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpLookupService {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            timeout,
        }
    }

    /// Accepts both `{videos, hasMore}` and a bare array of videos
    pub fn parse_search_page(json: Value) -> Result<SearchPage, SourceError> {
        match json {
            Value::Array(items) => Ok(SearchPage {
                videos: items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<Video>(item).ok())
                    .collect(),
                has_more: false,
            }),
            Value::Object(_) => serde_json::from_value(json)
                .map_err(|e| SourceError::InvalidPayload(e.to_string())),
            _ => Err(SourceError::InvalidPayload(
                "expected an object or array".to_string(),
            )),
        }
    }
}

#[async_trait]
impl LookupService for HttpLookupService {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<SearchPage, SourceError> {
        let url = format!(
            "{}?action=search&q={}&limit={}&offset={}",
            self.base_url,
            urlencoding::encode(query),
            limit,
            offset
        );

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(response.status().as_u16()));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| SourceError::InvalidPayload(e.to_string()))?;
        Self::parse_search_page(json)
    }
}

/// Stream extraction over the audio function (`?v=<id>`)
pub struct HttpStreamExtractor {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpStreamExtractor {
    pub fn new(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            timeout,
        }
    }

    pub fn parse_stream_info(json: &Value) -> Result<StreamInfo, SourceError> {
        let audio_url = json
            .get("audioUrl")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(SourceError::MissingField("audioUrl"))?
            .to_string();

        Ok(StreamInfo {
            audio_url,
            title: json
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            duration: json.get("duration").and_then(|v| v.as_f64()),
        })
    }
}

#[async_trait]
impl StreamExtractor for HttpStreamExtractor {
    async fn extract(&self, external_id: &str) -> Result<StreamInfo, SourceError> {
        let url = format!("{}?v={}", self.base_url, urlencoding::encode(external_id));

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(SourceError::from_status(response.status().as_u16()));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| SourceError::InvalidPayload(e.to_string()))?;
        Self::parse_stream_info(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_search_page_object() {
        let page = HttpLookupService::parse_search_page(json!({
            "videos": [
                {"videoId": "a1", "title": "Song", "author": "Artist", "lengthSeconds": 200}
            ],
            "hasMore": true
        }))
        .unwrap();

        assert_eq!(page.videos.len(), 1);
        assert_eq!(page.videos[0].video_id, "a1");
        assert!(page.has_more);
    }

    #[test]
    fn test_parse_search_page_bare_array_skips_broken_items() {
        let page = HttpLookupService::parse_search_page(json!([
            {"videoId": "a1", "title": "Song"},
            {"title": "no id"}
        ]))
        .unwrap();

        assert_eq!(page.videos.len(), 1);
        assert!(!page.has_more);
    }

    #[test]
    fn test_parse_search_page_empty_results() {
        let page = HttpLookupService::parse_search_page(json!({"videos": []})).unwrap();
        assert!(page.videos.is_empty());

        assert!(HttpLookupService::parse_search_page(json!("nope")).is_err());
    }

    #[test]
    fn test_parse_stream_info() {
        let info = HttpStreamExtractor::parse_stream_info(&json!({
            "audioUrl": "https://cdn.example/a.m4a",
            "title": "Song",
            "duration": 205
        }))
        .unwrap();
        assert_eq!(info.audio_url, "https://cdn.example/a.m4a");
        assert_eq!(info.duration_seconds(), Some(205));
    }

    #[test]
    fn test_parse_stream_info_requires_audio_url() {
        let err = HttpStreamExtractor::parse_stream_info(&json!({"title": "Song"})).unwrap_err();
        assert_eq!(err, SourceError::MissingField("audioUrl"));

        let empty = HttpStreamExtractor::parse_stream_info(&json!({"audioUrl": ""}));
        assert!(empty.is_err());
    }
}
