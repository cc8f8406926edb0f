use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::service::matching;
use crate::service::{DurationProbe, HttpFetch, LookupService, SourceError, StreamExtractor};
use crate::track::{ResolutionResult, ResolutionSource, Track};

/// An external id chosen for a track, before it is turned into a stream URL
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub external_id: String,
    pub duration_seconds: Option<u32>,
    pub source: ResolutionSource,
}

/// Content types a proxied stream must answer with
const PLAYABLE_CONTENT_TYPES: [&str; 3] = ["audio/", "video/", "application/octet-stream"];

/// Turns library tracks into playable stream URLs.
///
/// Resolution is two-staged: `resolve` picks an external id (the pinned one,
/// or the best lookup candidate) and `materialize` asks the extraction service
/// for a stream URL. Every stage logs and returns `None` on failure.
pub struct SourceGateway {
    lookup: Arc<dyn LookupService>,
    extractor: Arc<dyn StreamExtractor>,
    fetcher: Arc<dyn HttpFetch>,
    probe: Option<Arc<dyn DurationProbe>>,
    streams: Mutex<TtlCache<String, String>>,
    extraction_retry: RetryPolicy,
    search_qualifier: String,
    search_limit: usize,
    probe_timeout: Duration,
    validation_timeout: Duration,
    validation_range: String,
    proxy_prefixes: Vec<String>,
}

impl SourceGateway {
    pub fn new(
        lookup: Arc<dyn LookupService>,
        extractor: Arc<dyn StreamExtractor>,
        fetcher: Arc<dyn HttpFetch>,
        config: &Config,
    ) -> Self {
        let proxy_prefixes = config
            .proxies
            .endpoints
            .iter()
            .filter_map(|endpoint| endpoint.url_template.split("{url}").next())
            .filter(|prefix| !prefix.is_empty())
            .map(|prefix| prefix.to_string())
            .collect();

        Self {
            lookup,
            extractor,
            fetcher,
            probe: None,
            streams: Mutex::new(TtlCache::new(
                Duration::from_secs(config.cache.stream_ttl_secs),
                config.cache.capacity,
            )),
            extraction_retry: config.retry.extraction,
            search_qualifier: config.services.search_qualifier.clone(),
            search_limit: config.services.search_limit,
            probe_timeout: Duration::from_millis(config.services.probe_timeout_ms),
            validation_timeout: Duration::from_millis(config.services.validation_timeout_ms),
            validation_range: config.services.validation_range.clone(),
            proxy_prefixes,
        }
    }

    /// Read missing durations from stream metadata
    pub fn with_probe(mut self, probe: Arc<dyn DurationProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Search text for a track: name, artists and the configured qualifier
    pub fn search_query(&self, track: &Track) -> String {
        format!(
            "{} {} {}",
            track.name,
            track.artist_names(),
            self.search_qualifier
        )
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Choose an external id for `track`
    pub async fn resolve(&self, track: &Track) -> Option<Candidate> {
        if let Some(video_id) = track.video_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(Candidate {
                external_id: video_id.to_string(),
                duration_seconds: track
                    .duration_ms
                    .map(|ms| (ms / 1000) as u32)
                    .filter(|secs| *secs > 0),
                source: ResolutionSource::Pinned,
            });
        }

        let query = self.search_query(track);
        let page = match self.lookup.search(&query, self.search_limit, 0).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("Lookup failed for \"{}\": {}", track.name, e);
                return None;
            }
        };

        match matching::select_best(&page.videos, track) {
            Some((video, score)) => {
                tracing::debug!(
                    "Picked {} for \"{}\" (score {:.1}, {} candidates)",
                    video.video_id,
                    track.name,
                    score,
                    page.videos.len()
                );
                Some(Candidate {
                    external_id: video.video_id.clone(),
                    duration_seconds: video.length_seconds.filter(|secs| *secs > 0),
                    source: ResolutionSource::Search,
                })
            }
            None => {
                tracing::warn!(
                    "No acceptable candidate for \"{}\" among {} results",
                    track.name,
                    page.videos.len()
                );
                None
            }
        }
    }

    /// Playable stream URL for an external id
    pub async fn materialize(&self, external_id: &str) -> Option<String> {
        self.materialize_with_duration(external_id)
            .await
            .map(|(url, _)| url)
    }

    async fn materialize_with_duration(&self, external_id: &str) -> Option<(String, Option<u32>)> {
        let cached = self.streams.lock().get(external_id);
        if let Some(url) = cached {
            if !self.is_proxied(&url) || self.validate_stream_url(&url).await {
                return Some((url, None));
            }
            tracing::debug!("Cached stream for {} failed validation", external_id);
            self.streams.lock().remove(external_id);
        }

        let info = self.extract_with_retry(external_id).await?;
        let duration = info.duration_seconds();
        self.streams
            .lock()
            .insert(external_id.to_string(), info.audio_url.clone());
        Some((info.audio_url, duration))
    }

    async fn extract_with_retry(&self, external_id: &str) -> Option<crate::service::StreamInfo> {
        let mut failures = 0;
        loop {
            match self.extractor.extract(external_id).await {
                Ok(info) => return Some(info),
                Err(SourceError::RateLimited) => {
                    failures += 1;
                    if !self.extraction_retry.should_retry(failures) {
                        tracing::warn!(
                            "Extraction for {} still rate limited after {} attempts",
                            external_id,
                            failures
                        );
                        return None;
                    }
                    let delay = self.extraction_retry.delay_for(failures);
                    tracing::debug!(
                        "Extraction for {} rate limited, retrying in {:?}",
                        external_id,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!("Extraction failed for {}: {}", external_id, e);
                    return None;
                }
            }
        }
    }

    /// Drop the cached stream URL for an external id
    pub fn forget_stream(&self, external_id: &str) {
        self.streams.lock().remove(external_id);
    }

    pub fn is_proxied(&self, url: &str) -> bool {
        self.proxy_prefixes
            .iter()
            .any(|prefix| url.starts_with(prefix.as_str()))
    }

    /// Ranged GET against a proxied stream; it must answer 2xx with a media
    /// content type. Direct URLs are trusted.
    pub async fn validate_stream_url(&self, url: &str) -> bool {
        if !self.is_proxied(url) {
            return true;
        }

        let headers = [("Range", self.validation_range.as_str())];
        match self.fetcher.get(url, self.validation_timeout, &headers).await {
            Ok(response) if response.is_success() => {
                let content_type = response
                    .content_type
                    .as_deref()
                    .unwrap_or_default()
                    .to_lowercase();
                PLAYABLE_CONTENT_TYPES
                    .iter()
                    .any(|kind| content_type.contains(kind))
            }
            Ok(response) => {
                tracing::debug!("Stream validation got HTTP {}", response.status);
                false
            }
            Err(e) => {
                tracing::debug!("Stream validation failed: {}", e);
                false
            }
        }
    }

    async fn probe_duration(&self, url: &str) -> Option<u32> {
        let probe = self.probe.as_ref()?;
        match tokio::time::timeout(self.probe_timeout, probe.probe(url)).await {
            Ok(Some(secs)) if secs > 0 => Some(secs),
            Ok(_) => None,
            Err(_) => {
                tracing::debug!("Duration probe timed out after {:?}", self.probe_timeout);
                None
            }
        }
    }

    /// Resolve and materialize in one step. `force_refresh` skips the stream
    /// cache for the chosen id.
    pub async fn resolve_track(
        &self,
        track: &Track,
        force_refresh: bool,
    ) -> Option<ResolutionResult> {
        let candidate = self.resolve(track).await?;
        if force_refresh {
            self.forget_stream(&candidate.external_id);
        }

        let Some((playable_url, stream_duration)) =
            self.materialize_with_duration(&candidate.external_id).await
        else {
            tracing::warn!(
                "No stream for \"{}\" ({})",
                track.name,
                candidate.external_id
            );
            return None;
        };

        let mut duration_seconds = candidate.duration_seconds.or(stream_duration);
        if duration_seconds.is_none() {
            duration_seconds = self.probe_duration(&playable_url).await;
            if let Some(secs) = duration_seconds {
                tracing::debug!("Duration from stream metadata: {}s", secs);
            }
        }

        Some(ResolutionResult {
            external_id: candidate.external_id,
            playable_url,
            source: candidate.source,
            duration_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{HttpResponse, StreamInfo};
    use crate::testing::{video, FakeExtractor, FakeHttp, FakeLookup, FakeProbe};

    fn gateway(
        lookup: Arc<FakeLookup>,
        extractor: Arc<FakeExtractor>,
        http: Arc<FakeHttp>,
    ) -> SourceGateway {
        SourceGateway::new(lookup, extractor, http, &Config::default())
    }

    #[tokio::test]
    async fn test_search_query_is_whitespace_normalized() {
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            Arc::new(FakeExtractor::default()),
            Arc::new(FakeHttp::default()),
        );
        let track = Track::new("  Song   Title ", &["A", "B"]);
        assert_eq!(gw.search_query(&track), "Song Title A, B official audio");
    }

    #[tokio::test]
    async fn test_resolve_picks_best_candidate() {
        let lookup = Arc::new(FakeLookup::with_videos(vec![
            video("good", "Song (Official Audio)", "Artist", 205),
            video("remix", "Song Remix", "Artist", 40),
        ]));
        let gw = gateway(
            lookup.clone(),
            Arc::new(FakeExtractor::default()),
            Arc::new(FakeHttp::default()),
        );
        let track = Track::new("Song", &["Artist"]).with_duration_ms(200_000);

        let candidate = gw.resolve(&track).await.unwrap();
        assert_eq!(candidate.external_id, "good");
        assert_eq!(candidate.duration_seconds, Some(205));
        assert_eq!(candidate.source, ResolutionSource::Search);
        assert_eq!(lookup.queries(), vec!["Song Artist official audio"]);
    }

    #[tokio::test]
    async fn test_pinned_id_skips_lookup() {
        let lookup = Arc::new(FakeLookup::default());
        let extractor = Arc::new(FakeExtractor::default());
        let gw = gateway(lookup.clone(), extractor.clone(), Arc::new(FakeHttp::default()));
        let track = Track::new("Song", &["Artist"])
            .with_video_id("pinned01")
            .with_duration_ms(180_000);

        let result = gw.resolve_track(&track, false).await.unwrap();
        assert_eq!(result.external_id, "pinned01");
        assert_eq!(result.source, ResolutionSource::Pinned);
        assert_eq!(result.duration_seconds, Some(180));
        assert_eq!(lookup.calls(), 0);
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_error_gives_none() {
        let lookup = Arc::new(FakeLookup::failing(SourceError::Status(500)));
        let gw = gateway(
            lookup,
            Arc::new(FakeExtractor::default()),
            Arc::new(FakeHttp::default()),
        );
        assert!(gw.resolve(&Track::new("Song", &["Artist"])).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_extraction_retries_with_linear_backoff() {
        let extractor = Arc::new(FakeExtractor::default());
        extractor.push(Err(SourceError::RateLimited));
        extractor.push(Err(SourceError::RateLimited));
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor.clone(),
            Arc::new(FakeHttp::default()),
        );

        let start = tokio::time::Instant::now();
        let url = gw.materialize("abc").await.unwrap();
        assert_eq!(url, "https://cdn.test/abc.m4a");
        assert_eq!(extractor.calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_gives_up_after_three_retries() {
        let extractor = Arc::new(FakeExtractor::default());
        for _ in 0..5 {
            extractor.push(Err(SourceError::RateLimited));
        }
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor.clone(),
            Arc::new(FakeHttp::default()),
        );

        assert!(gw.materialize("abc").await.is_none());
        assert_eq!(extractor.calls(), 4);
    }

    #[tokio::test]
    async fn test_other_errors_do_not_retry() {
        let extractor = Arc::new(FakeExtractor::default());
        extractor.push(Err(SourceError::NotFound));
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor.clone(),
            Arc::new(FakeHttp::default()),
        );

        assert!(gw.materialize("abc").await.is_none());
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn test_stream_urls_are_cached_per_id() {
        let extractor = Arc::new(FakeExtractor::default());
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor.clone(),
            Arc::new(FakeHttp::default()),
        );

        gw.materialize("abc").await.unwrap();
        gw.materialize("abc").await.unwrap();
        assert_eq!(extractor.calls(), 1);

        gw.forget_stream("abc");
        gw.materialize("abc").await.unwrap();
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test]
    async fn test_proxied_cached_url_is_revalidated() {
        let proxied = "http://localhost:8888/proxy?url=https%3A%2F%2Fcdn%2Fa";
        let extractor = Arc::new(FakeExtractor::default());
        extractor.push(Ok(StreamInfo {
            audio_url: proxied.to_string(),
            title: None,
            duration: None,
        }));
        let http = Arc::new(FakeHttp::default());
        http.route(
            "http://localhost:8888/proxy",
            Ok(HttpResponse {
                status: 200,
                content_type: Some("text/html".to_string()),
                body: String::new(),
            }),
        );
        let gw = gateway(Arc::new(FakeLookup::default()), extractor.clone(), http.clone());

        assert_eq!(gw.materialize("abc").await.as_deref(), Some(proxied));
        // Cached entry answers with HTML, so it is dropped and re-extracted
        let again = gw.materialize("abc").await.unwrap();
        assert_eq!(again, "https://cdn.test/abc.m4a");
        assert_eq!(extractor.calls(), 2);
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_validate_stream_url_rules() {
        let http = Arc::new(FakeHttp::default());
        http.route(
            "https://corsproxy.io/?ok",
            Ok(HttpResponse {
                status: 206,
                content_type: Some("audio/mp4".to_string()),
                body: String::new(),
            }),
        );
        http.route(
            "https://corsproxy.io/?bad",
            Ok(HttpResponse {
                status: 403,
                content_type: Some("audio/mp4".to_string()),
                body: String::new(),
            }),
        );
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            Arc::new(FakeExtractor::default()),
            http.clone(),
        );

        assert!(gw.validate_stream_url("https://cdn.example/direct.m4a").await);
        assert!(gw.validate_stream_url("https://corsproxy.io/?ok").await);
        assert!(!gw.validate_stream_url("https://corsproxy.io/?bad").await);
        assert!(!gw.validate_stream_url("https://corsproxy.io/?unrouted").await);
        assert_eq!(http.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fills_unknown_duration() {
        let extractor = Arc::new(FakeExtractor::default());
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor,
            Arc::new(FakeHttp::default()),
        )
        .with_probe(Arc::new(FakeProbe::new(Some(241), Duration::from_millis(50))));
        let track = Track::new("Song", &["Artist"]).with_video_id("pinned01");

        let result = gw.resolve_track(&track, false).await.unwrap();
        assert_eq!(result.duration_seconds, Some(241));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_leaves_duration_unknown() {
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            Arc::new(FakeExtractor::default()),
            Arc::new(FakeHttp::default()),
        )
        .with_probe(Arc::new(FakeProbe::new(Some(241), Duration::from_secs(30))));
        let track = Track::new("Song", &["Artist"]).with_video_id("pinned01");

        let result = gw.resolve_track(&track, false).await.unwrap();
        assert_eq!(result.duration_seconds, None);
    }

    #[tokio::test]
    async fn test_stream_duration_used_before_probe() {
        let extractor = Arc::new(FakeExtractor::default());
        extractor.push(Ok(StreamInfo {
            audio_url: "https://cdn.test/x.m4a".to_string(),
            title: None,
            duration: Some(199.0),
        }));
        let probe = Arc::new(FakeProbe::new(Some(1), Duration::ZERO));
        let gw = gateway(
            Arc::new(FakeLookup::default()),
            extractor,
            Arc::new(FakeHttp::default()),
        )
        .with_probe(probe.clone());
        let track = Track::new("Song", &["Artist"]).with_video_id("pinned01");

        let result = gw.resolve_track(&track, false).await.unwrap();
        assert_eq!(result.duration_seconds, Some(199));
        assert_eq!(probe.calls(), 0);
    }
}
