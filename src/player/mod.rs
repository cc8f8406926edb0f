//! The player: queue, play requests and the signals a host feeds back
//!
//! `Player` is a cheap handle over shared state. Play requests resolve the
//! track through the resolver, hand the URL to the engine and keep the
//! resilience controller pointed at the live sink.

mod events;
mod playback;
mod queue;
mod recovery;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, ResilienceConfig};
use crate::engine::{
    transition_key, AudioSink, CrossfadeState, MediaErrorCode, PlaybackEngine, SinkFactory, SinkId,
    TransitionGuard, TransitionTimings,
};
use crate::resilience::{ErrorDisposition, RecoveryHost, ResilienceController};
use crate::resolver::{ResolveOptions, ResolverCache};
use crate::track::{ResolutionResult, Track};

pub use events::PlayerEvent;
pub use queue::Queue;

const EVENT_CAPACITY: usize = 64;

/// Media error recovery limits
#[derive(Debug, Clone, Copy)]
struct RecoveryTimings {
    error_window: Duration,
    max_attempts: u32,
    ready_timeout: Duration,
    rewind: f64,
    retry_delay: Duration,
}

impl RecoveryTimings {
    fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            error_window: Duration::from_millis(config.error_window_ms),
            max_attempts: config.max_recovery_attempts,
            ready_timeout: Duration::from_millis(config.recovery_ready_timeout_ms),
            rewind: config.recovery_rewind_ms as f64 / 1000.0,
            retry_delay: Duration::from_millis(config.recovery_retry_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ErrorCount {
    count: u32,
    last: Instant,
}

#[derive(Default)]
struct Session {
    playing: bool,
    loading: bool,
    recovering: bool,
    /// An automatic crossfade is resolving or starting its next track
    crossfade_pending: bool,
    /// `play_next_from` is walking the queue
    advancing: bool,
    guard: TransitionGuard,
    watchdog: Option<JoinHandle<()>>,
    error_counts: HashMap<usize, ErrorCount>,
}

impl Session {
    fn cancel_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    /// Count a media error for `index`, starting over after a quiet window
    fn record_error(&mut self, index: usize, window: Duration) -> u32 {
        let now = Instant::now();
        let count = match self.error_counts.get(&index) {
            Some(entry) if now.duration_since(entry.last) < window => entry.count + 1,
            _ => 1,
        };
        self.error_counts.insert(index, ErrorCount { count, last: now });
        count
    }
}

pub(crate) struct PlayerShared {
    this: Weak<PlayerShared>,
    resolver: Arc<ResolverCache>,
    engine: PlaybackEngine,
    resilience: ResilienceController,
    queue: Mutex<Queue>,
    session: Mutex<Session>,
    transitions: TransitionTimings,
    recovery: RecoveryTimings,
    reset_delay: Duration,
    events: broadcast::Sender<PlayerEvent>,
}

/// Handle to a player; clones share the same queue and sinks
#[derive(Clone)]
pub struct Player {
    shared: Arc<PlayerShared>,
}

impl Player {
    pub fn new(resolver: Arc<ResolverCache>, sinks: Arc<dyn SinkFactory>, config: &Config) -> Self {
        let reset_delay = Duration::from_millis(config.playback.reset_delay_ms);
        let shared = Arc::new_cyclic(|this: &Weak<PlayerShared>| {
            let host: Weak<dyn RecoveryHost> = this.clone();
            PlayerShared {
                this: this.clone(),
                resolver,
                engine: PlaybackEngine::new(sinks, &config.playback, config.retry.play),
                resilience: ResilienceController::new(
                    host,
                    &config.resilience,
                    config.retry.reconnect,
                    reset_delay,
                ),
                queue: Mutex::new(Queue::new(config.playback.repeat)),
                session: Mutex::new(Session::default()),
                transitions: TransitionTimings::from_config(&config.playback),
                recovery: RecoveryTimings::from_config(&config.resilience),
                reset_delay,
                events: broadcast::channel(EVENT_CAPACITY).0,
            }
        });
        Self { shared }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.shared.events.subscribe()
    }

    pub fn engine(&self) -> &PlaybackEngine {
        &self.shared.engine
    }

    pub fn resilience(&self) -> &ResilienceController {
        &self.shared.resilience
    }

    /// Replace the queue, stopping whatever was playing
    pub fn load_playlist(&self, playlist_id: &str, tracks: Vec<Track>) {
        tracing::info!("Loading playlist {} ({} tracks)", playlist_id, tracks.len());
        self.shared.stop_playback();
        self.shared.queue.lock().load(playlist_id, tracks);
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.shared.queue.lock().tracks().to_vec()
    }

    pub fn track(&self, index: usize) -> Option<Track> {
        self.shared.queue.lock().get(index).cloned()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.shared.queue.lock().current()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.session.lock().playing
    }

    pub fn is_loading(&self) -> bool {
        self.shared.session.lock().loading
    }

    pub fn repeat(&self) -> bool {
        self.shared.queue.lock().repeat()
    }

    pub fn set_repeat(&self, repeat: bool) {
        self.shared.queue.lock().set_repeat(repeat);
    }

    /// Returns the clamped volume actually applied
    pub fn set_user_volume(&self, volume: f64) -> f64 {
        self.shared.engine.set_user_volume(volume)
    }

    /// Playable URL for the track at `index`, if it can be resolved
    pub async fn resolve_track(&self, index: usize) -> Option<String> {
        self.shared.resolve_url(index).await
    }

    /// Play the track at `index`, skipping forward when it cannot be played
    pub async fn play_track(&self, index: usize) -> bool {
        self.shared.play_track(index).await
    }

    /// Play the first playable track at or after `start`
    pub async fn play_next_from(&self, start: usize) -> bool {
        self.shared.play_next_from(start).await
    }

    /// Pause when playing, otherwise resume (or start the queue). Returns
    /// whether the player is playing afterwards.
    pub async fn toggle_playback(&self) -> bool {
        self.shared.toggle_playback().await
    }

    /// Clear the unavailable flag and cached artefacts of a track, then play it
    pub async fn retry_unavailable(&self, index: usize) -> bool {
        self.shared.retry_unavailable(index).await
    }

    pub fn on_stalled(&self) {
        self.shared.resilience.on_stalled();
    }

    pub fn on_buffering(&self) {
        self.shared.resilience.on_buffering();
    }

    pub fn on_playing(&self) {
        self.shared.resilience.on_playing();
        self.shared.schedule_watchdog();
    }

    pub fn on_can_play_through(&self) {
        self.shared.resilience.on_can_play_through();
    }

    pub fn on_error(&self, sink_id: SinkId, code: MediaErrorCode) -> ErrorDisposition {
        self.shared.resilience.on_error(sink_id, code)
    }

    pub fn on_ended(&self) {
        self.shared.resilience.on_ended();
    }

    pub fn on_time_update(&self) {
        self.shared.on_time_update();
    }

    /// The active sink learned its media duration
    pub fn on_duration_change(&self, duration_secs: f64) {
        self.shared.on_duration_change(duration_secs);
    }

    pub fn on_offline(&self) {
        self.shared.resilience.on_offline();
    }

    pub fn on_online(&self) {
        self.shared.resilience.on_online();
    }
}

impl PlayerShared {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn current_index(&self) -> Option<usize> {
        self.queue.lock().current()
    }

    fn is_current(&self, index: usize) -> bool {
        self.current_index() == Some(index)
    }

    /// Resolve the track at `index` and write what was learned back into the
    /// queue, provided the slot still holds the same track
    async fn resolve_at(&self, index: usize, options: ResolveOptions) -> Option<ResolutionResult> {
        let mut track = self.queue.lock().get(index)?.clone();
        let key = track.key();
        let result = self.resolver.get_or_create(&mut track, index, options).await;

        let mut queue = self.queue.lock();
        if let Some(slot) = queue.get_mut(index).filter(|slot| slot.key() == key) {
            slot.duration_ms = track.duration_ms;
            slot.unavailable = track.unavailable;
        }
        result
    }

    /// Cached URL if it still plays, else a fresh resolution, else a forced one
    async fn resolve_url(&self, index: usize) -> Option<String> {
        let track = self.queue.lock().get(index)?.clone();

        if let Some(cached) = self.resolver.get(&track.key()) {
            if self
                .resolver
                .gateway()
                .validate_stream_url(&cached.playable_url)
                .await
            {
                return self
                    .resolve_at(index, ResolveOptions::default())
                    .await
                    .map(|r| r.playable_url);
            }
            tracing::debug!("Cached stream for track {} no longer plays", index);
            self.resolver.invalidate(&track);
        }

        if let Some(result) = self.resolve_at(index, ResolveOptions::default()).await {
            return Some(result.playable_url);
        }
        self.resolve_at(index, ResolveOptions::refresh())
            .await
            .map(|r| r.playable_url)
    }

    fn stop_playback(&self) {
        self.engine.begin_play();
        self.engine.stop();
        self.resilience.reset();
        let was_playing = {
            let mut session = self.session.lock();
            session.cancel_watchdog();
            session.guard.reset();
            session.loading = false;
            session.crossfade_pending = false;
            session.error_counts.clear();
            std::mem::take(&mut session.playing)
        };
        self.queue.lock().set_current(None);
        if was_playing {
            self.emit(PlayerEvent::PlaybackStateChanged { playing: false });
        }
    }

    /// Schedule the end-of-track watchdog from the active sink's position
    fn schedule_watchdog(&self) {
        let sink = self.engine.active_sink();
        let Some(duration) = sink.duration() else {
            return;
        };
        let Some(delay) = self.transitions.watchdog_delay(sink.current_time(), duration) else {
            return;
        };

        let mut session = self.session.lock();
        session.cancel_watchdog();
        if !session.playing {
            return;
        }
        let this = self.this.clone();
        session.watchdog = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = this.upgrade() {
                shared.session.lock().watchdog = None;
                shared.maybe_force_end();
            }
        }));
    }

    fn on_duration_change(&self, duration_secs: f64) {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return;
        }
        if let Some(index) = self.current_index() {
            let duration_ms = (duration_secs * 1000.0) as u64;
            if let Some(track) = self.queue.lock().get_mut(index) {
                if track.refresh_duration(duration_ms) {
                    tracing::debug!("Track {} duration is {}ms", index, duration_ms);
                }
            }
        }
        self.schedule_watchdog();
    }

    fn on_time_update(&self) {
        let sink = self.engine.active_sink();
        let current = sink.current_time();
        self.maybe_auto_crossfade(&sink, current);

        let duration = sink.duration().unwrap_or(f64::NAN);
        if sink.is_ended() || self.transitions.near_end(current, duration) {
            self.maybe_force_end();
        }
    }

    /// Start fading into the next track when the current one is close enough
    /// to its end
    fn maybe_auto_crossfade(&self, sink: &Arc<dyn AudioSink>, current: f64) {
        if self.engine.crossfade_state() != CrossfadeState::Inactive {
            return;
        }
        if sink.is_paused() || sink.is_ended() {
            return;
        }

        let (index, next, playlist, track_duration) = {
            let queue = self.queue.lock();
            let Some(index) = queue.current() else {
                return;
            };
            let track_duration = queue
                .get(index)
                .and_then(|t| t.duration_ms)
                .map(|ms| ms as f64 / 1000.0);
            (
                index,
                queue.next_for_crossfade(),
                queue.playlist_id().to_string(),
                track_duration,
            )
        };

        let Some(duration) = sink
            .duration()
            .filter(|d| d.is_finite() && *d > 0.0)
            .or(track_duration)
        else {
            return;
        };
        if !self.transitions.should_crossfade(current, duration) {
            return;
        }
        let Some(next) = next else {
            return;
        };

        let key = transition_key(&playlist, index, duration);
        {
            let mut session = self.session.lock();
            if !session.playing
                || session.loading
                || session.crossfade_pending
                || session.advancing
                || !session.guard.claim_crossfade(&key)
            {
                return;
            }
            session.crossfade_pending = true;
        }

        tracing::info!("Auto crossfade from track {} to {}", index, next);
        if let Some(shared) = self.this.upgrade() {
            tokio::spawn(async move { shared.crossfade_to(next).await });
        }
    }

    /// End-of-track fallback when the natural end signal never arrived
    fn maybe_force_end(&self) {
        if self.engine.crossfade_state() != CrossfadeState::Inactive {
            return;
        }
        {
            let session = self.session.lock();
            if session.crossfade_pending
                || session.loading
                || session.advancing
                || session.guard.is_advancing()
                || !session.playing
            {
                return;
            }
        }
        let Some(index) = self.current_index() else {
            return;
        };

        let sink = self.engine.active_sink();
        let Some(duration) = sink.duration().filter(|d| d.is_finite() && *d > 0.0) else {
            return;
        };
        let remaining = duration - sink.current_time();
        if remaining > self.transitions.end_tolerance.as_secs_f64() && !sink.is_ended() {
            return;
        }

        tracing::info!("Track {} end detected by fallback ({:.3}s left)", index, remaining);
        self.handle_track_end(index);
    }

    /// Advance past a finished track, once per ending
    fn handle_track_end(&self, index: usize) {
        if self.engine.crossfade_state() == CrossfadeState::Active {
            return;
        }
        let key = format!("end:{}", transition_key(self.queue.lock().playlist_id(), index, 0.0));
        {
            let mut session = self.session.lock();
            if session.crossfade_pending || session.loading || session.advancing {
                return;
            }
            if !session.guard.claim_end(&key) {
                return;
            }
            session.playing = false;
            session.cancel_watchdog();
        }

        tracing::info!("Track {} ended, playing next", index);
        if let Some(shared) = self.this.upgrade() {
            tokio::spawn(async move { shared.play_next_from(index + 1).await });
        }
    }
}
