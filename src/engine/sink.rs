//! Audio sink abstraction
//!
//! A sink is one controllable output unit (a media element, a decoder pipeline,
//! a remote renderer). The engine drives two or three of them; adapting a real
//! output to this trait is left to the host.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::service::DurationProbe;

pub type SinkId = u64;

/// How much media a sink has buffered, in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

/// Media error codes reported by sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaErrorCode {
    Aborted = 1,
    Network = 2,
    Decode = 3,
    SrcNotSupported = 4,
}

impl MediaErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MediaErrorCode::Aborted),
            2 => Some(MediaErrorCode::Network),
            3 => Some(MediaErrorCode::Decode),
            4 => Some(MediaErrorCode::SrcNotSupported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("no source loaded")]
    NoSource,
    #[error("playback rejected: {0}")]
    Rejected(String),
    #[error("media error {0:?}")]
    Media(MediaErrorCode),
}

/// A controllable audio output.
///
/// Methods take `&self`; implementations keep their own interior state so a
/// sink can be shared between the engine and the tasks it spawns.
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn id(&self) -> SinkId;

    fn set_source(&self, url: &str);
    fn clear_source(&self);
    fn source(&self) -> Option<String>;
    /// (Re)load the current source from the start
    fn load(&self);

    async fn play(&self) -> Result<(), SinkError>;
    fn pause(&self);
    fn seek(&self, seconds: f64);

    /// Output gain in [0, 1]
    fn set_volume(&self, volume: f64);
    fn volume(&self) -> f64;

    /// Playback position in seconds
    fn current_time(&self) -> f64;
    /// Media duration in seconds, once metadata is known
    fn duration(&self) -> Option<f64>;
    fn is_paused(&self) -> bool;
    fn is_ended(&self) -> bool;
    fn ready_state(&self) -> ReadyState;

    /// Resolves once `ready_state() >= state`. Never resolves on its own if
    /// the sink cannot get there; callers bound it with a timeout.
    async fn wait_for(&self, state: ReadyState);
}

/// Creates fresh sinks for the engine and for metadata probes
pub trait SinkFactory: Send + Sync {
    fn create(&self) -> Arc<dyn AudioSink>;
}

/// Releases the probe sink however the probe ends, timeouts included
struct ProbeSink(Arc<dyn AudioSink>);

impl Drop for ProbeSink {
    fn drop(&mut self) {
        self.0.pause();
        self.0.clear_source();
        self.0.load();
    }
}

/// Reads stream durations by loading the URL into a throwaway sink
pub struct SinkProbe {
    factory: Arc<dyn SinkFactory>,
}

impl SinkProbe {
    pub fn new(factory: Arc<dyn SinkFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl DurationProbe for SinkProbe {
    async fn probe(&self, url: &str) -> Option<u32> {
        let sink = ProbeSink(self.factory.create());
        sink.0.set_source(url);
        sink.0.load();
        sink.0.wait_for(ReadyState::HaveMetadata).await;

        sink.0
            .duration()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| secs.floor() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSink, FakeSinkFactory};
    use std::time::Duration;

    #[test]
    fn test_ready_state_ordering() {
        assert!(ReadyState::HaveEnoughData > ReadyState::HaveFutureData);
        assert!(ReadyState::HaveMetadata >= ReadyState::HaveMetadata);
        assert!(ReadyState::HaveNothing < ReadyState::HaveCurrentData);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MediaErrorCode::from_code(1), Some(MediaErrorCode::Aborted));
        assert_eq!(MediaErrorCode::from_code(4), Some(MediaErrorCode::SrcNotSupported));
        assert_eq!(MediaErrorCode::from_code(9), None);
    }

    #[tokio::test]
    async fn test_probe_reads_duration_and_discards_sink() {
        let factory = Arc::new(FakeSinkFactory::with_duration(212.7));
        let probe = SinkProbe::new(factory.clone());

        assert_eq!(probe.probe("https://cdn.test/a.m4a").await, Some(212));

        let sinks = factory.created();
        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[0].source(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_sink_released_on_timeout() {
        let factory = Arc::new(FakeSinkFactory::default());
        let probe = SinkProbe::new(factory.clone());

        let result =
            tokio::time::timeout(Duration::from_secs(5), probe.probe("https://cdn.test/a")).await;
        assert!(result.is_err());

        let sinks = factory.created();
        let sink: &FakeSink = &sinks[0];
        assert_eq!(sink.source(), None);
        assert!(sink.is_paused());
    }
}
