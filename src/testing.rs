//! In-memory stand-ins for the external services and audio sinks

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::engine::{AudioSink, ReadyState, SinkError, SinkFactory, SinkId};
use crate::service::{
    DurationProbe, HttpFetch, HttpResponse, LookupService, SearchPage, SourceError,
    StreamExtractor, StreamInfo, Video,
};

pub fn video(id: &str, title: &str, author: &str, secs: u32) -> Video {
    Video {
        video_id: id.to_string(),
        title: title.to_string(),
        author: Some(author.to_string()),
        length_seconds: Some(secs),
        thumbnail: None,
    }
}

#[derive(Default)]
pub struct FakeLookup {
    videos: Vec<Video>,
    error: Option<SourceError>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl FakeLookup {
    pub fn with_videos(videos: Vec<Video>) -> Self {
        Self {
            videos,
            ..Self::default()
        }
    }

    pub fn failing(error: SourceError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl LookupService for FakeLookup {
    async fn search(&self, query: &str, _limit: usize, _offset: usize) -> Result<SearchPage, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.to_string());
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(SearchPage {
                videos: self.videos.clone(),
                has_more: false,
            }),
        }
    }
}

/// Answers scripted responses first, then a stream URL derived from the id
#[derive(Default)]
pub struct FakeExtractor {
    responses: Mutex<VecDeque<Result<StreamInfo, SourceError>>>,
    fallback_error: Mutex<Option<SourceError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn push(&self, response: Result<StreamInfo, SourceError>) {
        self.responses.lock().push_back(response);
    }

    /// Fail every unscripted call with `error`
    pub fn fail_always(&self, error: SourceError) {
        *self.fallback_error.lock() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamExtractor for FakeExtractor {
    async fn extract(&self, external_id: &str) -> Result<StreamInfo, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(response) = self.responses.lock().pop_front() {
            return response;
        }
        if let Some(error) = self.fallback_error.lock().clone() {
            return Err(error);
        }
        Ok(StreamInfo {
            audio_url: format!("https://cdn.test/{}.m4a", external_id),
            title: None,
            duration: None,
        })
    }
}

pub struct FakeProbe {
    result: Option<u32>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(result: Option<u32>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurationProbe for FakeProbe {
    async fn probe(&self, _url: &str) -> Option<u32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.result
    }
}

/// Routes GETs by URL prefix; unrouted URLs fail to connect
#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<Vec<(String, Result<HttpResponse, SourceError>)>>,
    requests: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub fn route(&self, prefix: &str, response: Result<HttpResponse, SourceError>) {
        let mut routes = self.routes.lock();
        match routes.iter_mut().find(|(p, _)| p == prefix) {
            Some(route) => route.1 = response,
            None => routes.push((prefix.to_string(), response)),
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|url| url.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl HttpFetch for FakeHttp {
    async fn get(
        &self,
        url: &str,
        _timeout: Duration,
        _headers: &[(&str, &str)],
    ) -> Result<HttpResponse, SourceError> {
        self.requests.lock().push(url.to_string());
        self.routes
            .lock()
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Err(SourceError::Connect("no route".to_string())))
    }
}

struct FakeSinkState {
    source: Option<String>,
    volume: f64,
    paused: bool,
    ended: bool,
    current_time: f64,
    duration: Option<f64>,
    play_calls: u32,
    failing_plays: u32,
    seeks: Vec<f64>,
    loads: u32,
}

/// A sink that never produces sound; tests drive its clock and readiness
pub struct FakeSink {
    id: SinkId,
    ready_on_load: bool,
    media_duration: Option<f64>,
    state: Mutex<FakeSinkState>,
    ready: watch::Sender<ReadyState>,
}

impl FakeSink {
    fn new(id: SinkId, ready_on_load: bool, media_duration: Option<f64>) -> Self {
        let (ready, _) = watch::channel(ReadyState::HaveNothing);
        Self {
            id,
            ready_on_load,
            media_duration,
            state: Mutex::new(FakeSinkState {
                source: None,
                volume: 1.0,
                paused: true,
                ended: false,
                current_time: 0.0,
                duration: None,
                play_calls: 0,
                failing_plays: 0,
                seeks: Vec::new(),
                loads: 0,
            }),
            ready,
        }
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.ready.send_replace(state);
    }

    pub fn set_current_time(&self, seconds: f64) {
        self.state.lock().current_time = seconds;
    }

    pub fn set_duration(&self, seconds: Option<f64>) {
        self.state.lock().duration = seconds;
    }

    pub fn set_ended(&self, ended: bool) {
        let mut state = self.state.lock();
        state.ended = ended;
        if ended {
            state.paused = true;
        }
    }

    pub fn fail_next_plays(&self, count: u32) {
        self.state.lock().failing_plays = count;
    }

    pub fn play_calls(&self) -> u32 {
        self.state.lock().play_calls
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().seeks.clone()
    }

    pub fn loads(&self) -> u32 {
        self.state.lock().loads
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn set_source(&self, url: &str) {
        self.state.lock().source = Some(url.to_string());
    }

    fn clear_source(&self) {
        let mut state = self.state.lock();
        state.source = None;
        state.duration = None;
        drop(state);
        self.set_ready_state(ReadyState::HaveNothing);
    }

    fn source(&self) -> Option<String> {
        self.state.lock().source.clone()
    }

    fn load(&self) {
        let mut state = self.state.lock();
        state.loads += 1;
        state.current_time = 0.0;
        state.ended = false;
        let ready = state.source.is_some() && self.ready_on_load;
        if ready {
            state.duration = self.media_duration;
        }
        drop(state);
        self.set_ready_state(if ready {
            ReadyState::HaveEnoughData
        } else {
            ReadyState::HaveNothing
        });
    }

    async fn play(&self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.play_calls += 1;
        if state.failing_plays > 0 {
            state.failing_plays -= 1;
            return Err(SinkError::Rejected("scripted failure".to_string()));
        }
        if state.source.is_none() {
            return Err(SinkError::NoSource);
        }
        state.paused = false;
        state.ended = false;
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn seek(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.current_time = seconds;
        state.seeks.push(seconds);
    }

    fn set_volume(&self, volume: f64) {
        self.state.lock().volume = volume;
    }

    fn volume(&self) -> f64 {
        self.state.lock().volume
    }

    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn duration(&self) -> Option<f64> {
        self.state.lock().duration
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.borrow()
    }

    async fn wait_for(&self, state: ReadyState) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|current| *current >= state).await;
    }
}

#[derive(Default)]
pub struct FakeSinkFactory {
    ready_on_load: bool,
    media_duration: Option<f64>,
    next_id: AtomicU64,
    created: Mutex<Vec<Arc<FakeSink>>>,
}

impl FakeSinkFactory {
    /// Sinks become ready as soon as a source is loaded
    pub fn ready() -> Self {
        Self {
            ready_on_load: true,
            ..Self::default()
        }
    }

    pub fn with_duration(seconds: f64) -> Self {
        Self {
            ready_on_load: true,
            media_duration: Some(seconds),
            ..Self::default()
        }
    }

    /// Every sink created so far, in creation order
    pub fn created(&self) -> Vec<Arc<FakeSink>> {
        self.created.lock().clone()
    }
}

impl SinkFactory for FakeSinkFactory {
    fn create(&self) -> Arc<dyn AudioSink> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = Arc::new(FakeSink::new(id, self.ready_on_load, self.media_duration));
        self.created.lock().push(sink.clone());
        sink
    }
}
