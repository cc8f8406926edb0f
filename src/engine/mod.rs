pub mod crossfade;
pub mod sink;
pub mod transition;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PlaybackConfig;
use crate::retry::RetryPolicy;
use crossfade::{FadeLevels, FadeRamp};

pub use crossfade::CrossfadeState;

pub use sink::{AudioSink, MediaErrorCode, ReadyState, SinkError, SinkFactory, SinkId, SinkProbe};
pub use transition::{transition_key, TransitionGuard, TransitionTimings};

/// Generation snapshot taken when a play intent starts.
///
/// Any newer intent bumps the shared counter, after which every continuation
/// holding this token must stop without touching sinks or player state.
#[derive(Debug, Clone)]
pub struct PlayToken {
    generation: u64,
    counter: Arc<AtomicU64>,
}

impl PlayToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.counter.load(Ordering::SeqCst) != self.generation
    }

    pub fn is_current(&self) -> bool {
        !self.is_stale()
    }
}

/// How a crossfade request began
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossfadeStart {
    /// Played directly instead, with the result of that
    Direct(bool),
    /// The incoming sink is live; the payload is the outgoing sink
    Started(SinkId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Playing,
    Crossfading,
    Ended,
    Error,
}

struct Sinks {
    active: Arc<dyn AudioSink>,
    standby: Option<Arc<dyn AudioSink>>,
    /// Outgoing sink, only during a crossfade
    fading: Option<Arc<dyn AudioSink>>,
    levels: FadeLevels,
    crossfade: CrossfadeState,
    state: EngineState,
    user_volume: f64,
    current_url: Option<String>,
    /// Errors from a sink are ignored until its entry expires
    ignore_errors_until: HashMap<SinkId, Instant>,
}

impl Sinks {
    fn apply_volumes(&self) {
        self.active.set_volume(self.user_volume * self.levels.fade_in);
        if let Some(fading) = &self.fading {
            fading.set_volume(self.user_volume * self.levels.fade_out);
        }
    }

    /// Pause, unload and reload `sink`, ignoring the errors that causes
    fn reset(&mut self, sink: &Arc<dyn AudioSink>, ignore_for: Duration) {
        self.ignore_errors_until
            .insert(sink.id(), Instant::now() + ignore_for);
        sink.pause();
        sink.clear_source();
        sink.load();
    }

    /// Move the fading sink back to standby once its ramp is over
    fn recycle_fading(&mut self, ignore_for: Duration) {
        if let Some(fading) = self.fading.take() {
            self.reset(&fading, ignore_for);
            self.standby = Some(fading);
        }
        self.levels = FadeLevels::DONE;
        self.crossfade = CrossfadeState::Inactive;
        if self.state == EngineState::Crossfading {
            self.state = EngineState::Playing;
        }
        self.apply_volumes();
    }
}

/// Two interchangeable sinks with crossfaded handoff between them
pub struct PlaybackEngine {
    factory: Arc<dyn SinkFactory>,
    sinks: Mutex<Sinks>,
    generation: Arc<AtomicU64>,
    ramp: FadeRamp,
    reset_delay: Duration,
    error_ignore: Duration,
    play_retry: RetryPolicy,
}

impl PlaybackEngine {
    pub fn new(factory: Arc<dyn SinkFactory>, config: &PlaybackConfig, play_retry: RetryPolicy) -> Self {
        let active = factory.create();
        let standby = factory.create();
        let user_volume = (config.default_volume.min(100) as f64) / 100.0;

        Self {
            factory,
            sinks: Mutex::new(Sinks {
                active,
                standby: Some(standby),
                fading: None,
                levels: FadeLevels::DONE,
                crossfade: CrossfadeState::Inactive,
                state: EngineState::Idle,
                user_volume,
                current_url: None,
                ignore_errors_until: HashMap::new(),
            }),
            generation: Arc::new(AtomicU64::new(0)),
            ramp: FadeRamp::new(
                Duration::from_millis(config.crossfade_ms),
                Duration::from_millis(config.crossfade_step_ms),
            ),
            reset_delay: Duration::from_millis(config.reset_delay_ms),
            error_ignore: Duration::from_millis(config.error_ignore_ms),
            play_retry,
        }
    }

    /// Start a new play intent, invalidating every earlier token
    pub fn begin_play(&self) -> PlayToken {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        PlayToken {
            generation,
            counter: self.generation.clone(),
        }
    }

    pub fn current_token(&self) -> PlayToken {
        PlayToken {
            generation: self.generation.load(Ordering::SeqCst),
            counter: self.generation.clone(),
        }
    }

    pub fn active_sink(&self) -> Arc<dyn AudioSink> {
        self.sinks.lock().active.clone()
    }

    pub fn is_active_sink(&self, id: SinkId) -> bool {
        self.sinks.lock().active.id() == id
    }

    pub fn state(&self) -> EngineState {
        self.sinks.lock().state
    }

    pub fn set_state(&self, state: EngineState) {
        self.sinks.lock().state = state;
    }

    pub fn crossfade_state(&self) -> CrossfadeState {
        self.sinks.lock().crossfade
    }

    pub fn current_url(&self) -> Option<String> {
        self.sinks.lock().current_url.clone()
    }

    pub fn user_volume(&self) -> f64 {
        self.sinks.lock().user_volume
    }

    /// Set the user volume (clamped to 0-1); fade ratios are kept
    pub fn set_user_volume(&self, volume: f64) -> f64 {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let mut sinks = self.sinks.lock();
        sinks.user_volume = volume;
        sinks.apply_volumes();
        volume
    }

    /// Something is loaded, unpaused and not finished on the active sink
    pub fn is_audible(&self) -> bool {
        let active = self.active_sink();
        active.source().is_some() && !active.is_paused() && !active.is_ended()
    }

    /// Errors with the aborted code, from an inactive sink, or from a sink
    /// inside its reset window are not worth acting on
    pub fn should_ignore_error(&self, sink_id: SinkId, code: MediaErrorCode) -> bool {
        if code == MediaErrorCode::Aborted {
            return true;
        }
        let mut sinks = self.sinks.lock();
        if sinks.active.id() != sink_id {
            return true;
        }
        match sinks.ignore_errors_until.get(&sink_id) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                sinks.ignore_errors_until.remove(&sink_id);
                false
            }
            None => false,
        }
    }

    /// Reset the active sink and play `url` on it
    pub async fn play_direct(&self, url: &str, token: &PlayToken) -> bool {
        if token.is_stale() {
            return false;
        }

        let sink = {
            let mut sinks = self.sinks.lock();
            sinks.recycle_fading(self.error_ignore);
            sinks.state = EngineState::Loading;
            let active = sinks.active.clone();
            sinks.reset(&active, self.error_ignore);
            active
        };

        tokio::time::sleep(self.reset_delay).await;
        if token.is_stale() {
            return false;
        }

        sink.set_source(url);
        sink.load();
        {
            let mut sinks = self.sinks.lock();
            sinks.levels = FadeLevels::DONE;
            sinks.current_url = Some(url.to_string());
            sinks.apply_volumes();
        }

        let started = self.start_sink(&sink, token).await;
        if token.is_stale() {
            return false;
        }
        self.set_state(if started {
            EngineState::Playing
        } else {
            EngineState::Error
        });
        started
    }

    /// Fade from whatever is playing to `url`; plays directly when nothing is
    /// audible or the standby sink refuses to start
    pub async fn play_crossfade(&self, url: &str, token: &PlayToken) -> bool {
        match self.start_crossfade(url, token).await {
            CrossfadeStart::Direct(played) => played,
            CrossfadeStart::Started(outgoing) => self.run_crossfade(outgoing, token).await,
        }
    }

    /// Start `url` on the standby sink and swap it in at volume 0
    pub async fn start_crossfade(&self, url: &str, token: &PlayToken) -> CrossfadeStart {
        if !self.is_audible() {
            return CrossfadeStart::Direct(self.play_direct(url, token).await);
        }
        if token.is_stale() {
            return CrossfadeStart::Direct(false);
        }

        let incoming = {
            let mut sinks = self.sinks.lock();
            sinks.recycle_fading(self.error_ignore);
            let incoming = sinks.standby.take().unwrap_or_else(|| self.factory.create());
            sinks.reset(&incoming, self.error_ignore);
            incoming
        };
        incoming.set_source(url);
        incoming.load();
        incoming.set_volume(0.0);

        if !self.start_sink(&incoming, token).await {
            self.return_standby(incoming);
            if token.is_stale() {
                return CrossfadeStart::Direct(false);
            }
            tracing::warn!("Standby sink failed to start, playing directly");
            return CrossfadeStart::Direct(self.play_direct(url, token).await);
        }
        if token.is_stale() {
            self.return_standby(incoming);
            return CrossfadeStart::Direct(false);
        }

        let mut sinks = self.sinks.lock();
        let outgoing = std::mem::replace(&mut sinks.active, incoming);
        let outgoing_id = outgoing.id();
        sinks.fading = Some(outgoing);
        sinks.levels = FadeLevels::SILENT_START;
        sinks.crossfade = CrossfadeState::Active;
        sinks.state = EngineState::Crossfading;
        sinks.current_url = Some(url.to_string());
        sinks.apply_volumes();
        CrossfadeStart::Started(outgoing_id)
    }

    /// Ramp the levels until the fade completes or `token` goes stale
    pub async fn run_crossfade(&self, outgoing_id: SinkId, token: &PlayToken) -> bool {
        tracing::info!("Crossfading over {:?}", self.ramp.duration());

        let start = Instant::now();
        let mut ticker = tokio::time::interval(self.ramp.step());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if token.is_stale() {
                self.end_crossfade(outgoing_id);
                return false;
            }

            let elapsed = start.elapsed();
            {
                let mut sinks = self.sinks.lock();
                if sinks.fading.as_ref().map(|s| s.id()) != Some(outgoing_id) {
                    // Someone else already finished this crossfade
                    return true;
                }
                sinks.levels = self.ramp.levels_at(elapsed);
                sinks.apply_volumes();
            }
            if self.ramp.is_complete(elapsed) {
                break;
            }
        }

        self.sinks.lock().crossfade = CrossfadeState::Completed;
        self.end_crossfade(outgoing_id);
        true
    }

    fn end_crossfade(&self, outgoing_id: SinkId) {
        let mut sinks = self.sinks.lock();
        if sinks.fading.as_ref().map(|s| s.id()) == Some(outgoing_id) {
            sinks.recycle_fading(self.error_ignore);
        }
    }

    fn return_standby(&self, sink: Arc<dyn AudioSink>) {
        let mut sinks = self.sinks.lock();
        sinks.reset(&sink, self.error_ignore);
        if sinks.standby.is_none() {
            sinks.standby = Some(sink);
        }
    }

    /// Finish any running crossfade immediately
    pub fn cancel_crossfade(&self) {
        self.sinks.lock().recycle_fading(self.error_ignore);
    }

    /// `play()` with the retry schedule; stops early once the token is stale
    pub async fn start_sink(&self, sink: &Arc<dyn AudioSink>, token: &PlayToken) -> bool {
        let mut failures = 0;
        loop {
            if token.is_stale() {
                return false;
            }
            match sink.play().await {
                Ok(()) => return true,
                Err(e) => {
                    failures += 1;
                    if !self.play_retry.should_retry(failures) {
                        tracing::warn!("Sink {} refused to play after {} attempts: {}", sink.id(), failures, e);
                        return false;
                    }
                    tokio::time::sleep(self.play_retry.delay_for(failures)).await;
                }
            }
        }
    }

    /// Reset the active sink and load `url` without starting it
    pub fn replace_source(&self, url: &str) {
        let mut sinks = self.sinks.lock();
        let active = sinks.active.clone();
        sinks.reset(&active, self.error_ignore);
        active.set_source(url);
        active.load();
        sinks.current_url = Some(url.to_string());
        sinks.apply_volumes();
    }

    /// Reset the active sink and forget the current source
    pub fn reset_active(&self) {
        let mut sinks = self.sinks.lock();
        sinks.recycle_fading(self.error_ignore);
        let active = sinks.active.clone();
        sinks.reset(&active, self.error_ignore);
        sinks.current_url = None;
    }

    pub fn pause(&self) {
        let mut sinks = self.sinks.lock();
        sinks.recycle_fading(self.error_ignore);
        sinks.active.pause();
    }

    pub async fn resume(&self, token: &PlayToken) -> bool {
        let sink = self.active_sink();
        if sink.source().is_none() {
            return false;
        }
        let started = self.start_sink(&sink, token).await;
        if started && token.is_current() {
            let mut sinks = self.sinks.lock();
            if sinks.state != EngineState::Crossfading {
                sinks.state = EngineState::Playing;
            }
        }
        started
    }

    /// Stop everything and go idle
    pub fn stop(&self) {
        self.reset_active();
        self.set_state(EngineState::Idle);
    }
}
