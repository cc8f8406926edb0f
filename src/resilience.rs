//! Connection supervision for the active sink
//!
//! Health signals from the host (stalled, waiting, playing, errors, network
//! changes) drive a small per-track state machine. When playback degrades the
//! controller re-resolves the stream URL and resumes from the saved position,
//! giving up after a bounded number of attempts.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ResilienceConfig;
use crate::engine::{MediaErrorCode, PlayToken, ReadyState, SinkId};
use crate::retry::RetryPolicy;

/// What the controller needs from the player
#[async_trait]
pub trait RecoveryHost: Send + Sync {
    fn current_index(&self) -> Option<usize>;
    fn current_token(&self) -> PlayToken;
    /// A play request is still loading its track
    fn is_loading(&self) -> bool;
    /// Media error recovery is running
    fn is_recovering(&self) -> bool;

    fn current_time(&self) -> f64;
    fn ready_state(&self) -> ReadyState;
    fn is_paused(&self) -> bool;
    fn is_ended(&self) -> bool;
    fn should_ignore_error(&self, sink_id: SinkId, code: MediaErrorCode) -> bool;

    fn pause(&self);
    fn seek(&self, seconds: f64);
    fn replace_source(&self, url: &str);
    async fn play(&self, token: &PlayToken) -> bool;
    /// Wait until the active sink can play, false on timeout
    async fn wait_ready(&self, timeout: Duration) -> bool;
    async fn refresh_url(&self, index: usize, force_refresh: bool) -> Option<String>;

    /// Mark the track unavailable and move past it
    fn abandon_track(&self, index: usize);
    fn advance_after_end(&self, index: usize);
    fn recover_from_error(&self, index: usize);
    fn report_slow_connection(&self, buffered: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    StalledPending,
    Buffering,
    Offline,
    Reconnecting(u32),
    Abandoned,
}

/// How `on_error` handled a media error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    Ignored,
    /// Offline; a reconnect check is scheduled
    AwaitingConnection,
    /// A reconnect is already running
    DuringReconnect,
    /// Handed to the player's error recovery
    Recover,
}

#[derive(Debug, Clone, Copy)]
struct Timings {
    stall_delay: Duration,
    buffering_timeout: Duration,
    slow_connection: Duration,
    ready_timeout: Duration,
    rewind: f64,
    offline_retry: Duration,
    reset_delay: Duration,
}

#[derive(Default)]
struct State {
    offline: bool,
    connection_lost: bool,
    reconnect_attempts: u32,
    saved_playback_time: f64,
    buffering_since: Option<Instant>,
    abandoned: bool,
    /// Bumped whenever reconnect state is reset; attempts from an older
    /// episode stop at their next checkpoint
    episode: u64,
    /// Bumped whenever stall/buffering timers are cleared
    timer_epoch: u64,
    stall_timer: Option<JoinHandle<()>>,
    buffering_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl State {
    fn clear_buffering_timers(&mut self) {
        self.timer_epoch += 1;
        if let Some(timer) = self.stall_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.buffering_timer.take() {
            timer.abort();
        }
        self.buffering_since = None;
    }

    fn reset_reconnect(&mut self) {
        self.episode += 1;
        self.reconnect_attempts = 0;
        self.saved_playback_time = 0.0;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    host: Weak<dyn RecoveryHost>,
    state: Mutex<State>,
    timings: Timings,
    retry: RetryPolicy,
}

/// Stall, buffering and reconnect supervision for the current track
#[derive(Clone)]
pub struct ResilienceController {
    inner: Arc<Inner>,
}

impl ResilienceController {
    pub fn new(
        host: Weak<dyn RecoveryHost>,
        config: &ResilienceConfig,
        retry: RetryPolicy,
        reset_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                state: Mutex::new(State::default()),
                timings: Timings {
                    stall_delay: Duration::from_millis(config.stall_delay_ms),
                    buffering_timeout: Duration::from_millis(config.buffering_timeout_ms),
                    slow_connection: Duration::from_millis(config.slow_connection_ms),
                    ready_timeout: Duration::from_millis(config.ready_timeout_ms),
                    rewind: config.rewind_ms as f64 / 1000.0,
                    offline_retry: Duration::from_millis(config.offline_retry_ms),
                    reset_delay,
                },
                retry,
            }),
        }
    }

    pub fn health(&self) -> Health {
        let state = self.inner.state.lock();
        if state.reconnect_attempts > 0 {
            Health::Reconnecting(state.reconnect_attempts)
        } else if state.offline || state.connection_lost {
            Health::Offline
        } else if state.abandoned {
            Health::Abandoned
        } else if state.stall_timer.is_some() {
            Health::StalledPending
        } else if state.buffering_since.is_some() {
            Health::Buffering
        } else {
            Health::Healthy
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_attempts() > 0
    }

    pub fn is_online(&self) -> bool {
        !self.inner.state.lock().offline
    }

    /// Forget everything about the previous track
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.clear_buffering_timers();
        state.reset_reconnect();
        state.abandoned = false;
    }

    pub fn on_stalled(&self) {
        let Some(host) = self.inner.host.upgrade() else {
            return;
        };
        if host.current_index().is_none() || host.is_loading() || host.current_time() <= 0.0 {
            return;
        }

        let mut state = self.inner.state.lock();
        if state.connection_lost || state.reconnect_attempts > 0 || state.stall_timer.is_some() {
            return;
        }

        let epoch = state.timer_epoch;
        let inner = self.inner.clone();
        state.stall_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timings.stall_delay).await;
            inner.stall_check(epoch);
        }));
    }

    pub fn on_buffering(&self) {
        let Some(host) = self.inner.host.upgrade() else {
            return;
        };
        if host.current_index().is_none() || host.is_loading() {
            return;
        }

        let mut state = self.inner.state.lock();
        if state.connection_lost || state.reconnect_attempts > 0 || state.buffering_since.is_some() {
            return;
        }
        if host.current_time() > 0.0 {
            tracing::warn!("Buffering...");
        }
        state.buffering_since = Some(Instant::now());

        let epoch = state.timer_epoch;
        let inner = self.inner.clone();
        state.buffering_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.timings.buffering_timeout).await;
            inner.buffering_check(epoch);
        }));
    }

    pub fn on_playing(&self) {
        let slow = {
            let mut state = self.inner.state.lock();
            let buffered = state.buffering_since.map(|since| since.elapsed());
            if buffered.is_some() {
                state.clear_buffering_timers();
            }
            if state.reconnect_attempts > 0 {
                tracing::info!("Playback resumed during reconnect");
                state.reset_reconnect();
            }
            state.abandoned = false;
            buffered.filter(|d| *d > self.inner.timings.slow_connection)
        };

        if let Some(buffered) = slow {
            tracing::warn!("Slow connection: buffering took {:.1}s", buffered.as_secs_f64());
            if let Some(host) = self.inner.host.upgrade() {
                host.report_slow_connection(buffered);
            }
        }
    }

    /// The sink can play through; any buffering episode is over
    pub fn on_can_play_through(&self) {
        self.inner.state.lock().clear_buffering_timers();
    }

    pub fn on_error(&self, sink_id: SinkId, code: MediaErrorCode) -> ErrorDisposition {
        let Some(host) = self.inner.host.upgrade() else {
            return ErrorDisposition::Ignored;
        };
        let Some(index) = host.current_index() else {
            return ErrorDisposition::Ignored;
        };
        if host.should_ignore_error(sink_id, code) {
            tracing::debug!("Ignoring {:?} from sink {}", code, sink_id);
            return ErrorDisposition::Ignored;
        }

        let current_time = host.current_time();
        {
            let mut state = self.inner.state.lock();
            if state.offline || state.connection_lost {
                tracing::warn!("Media error while offline, waiting for the connection");
                state.connection_lost = true;
                state.saved_playback_time = current_time;
                if state.reconnect_timer.is_none() {
                    let inner = self.inner.clone();
                    state.reconnect_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(inner.timings.offline_retry).await;
                        inner.state.lock().reconnect_timer = None;
                        if !inner.state.lock().offline {
                            inner.attempt_reconnect().await;
                        }
                    }));
                }
                return ErrorDisposition::AwaitingConnection;
            }
            if state.reconnect_attempts > 0 {
                tracing::debug!("Media error during reconnect ignored");
                return ErrorDisposition::DuringReconnect;
            }
        }

        host.recover_from_error(index);
        ErrorDisposition::Recover
    }

    pub fn on_ended(&self) {
        self.inner.state.lock().clear_buffering_timers();
        if let Some(host) = self.inner.host.upgrade() {
            if let Some(index) = host.current_index() {
                host.advance_after_end(index);
            }
        }
    }

    pub fn on_offline(&self) {
        let mut state = self.inner.state.lock();
        state.offline = true;
        let Some(host) = self.inner.host.upgrade() else {
            return;
        };
        if host.current_index().is_none() {
            return;
        }

        tracing::warn!("Connection lost");
        state.connection_lost = true;
        state.saved_playback_time = host.current_time();
        state.clear_buffering_timers();
        drop(state);
        host.pause();
    }

    pub fn on_online(&self) {
        let resume = {
            let mut state = self.inner.state.lock();
            state.offline = false;
            let has_track = self
                .inner
                .host
                .upgrade()
                .is_some_and(|host| host.current_index().is_some());
            if state.connection_lost && has_track {
                state.connection_lost = false;
                if let Some(timer) = state.reconnect_timer.take() {
                    timer.abort();
                }
                true
            } else {
                false
            }
        };

        if resume {
            tracing::info!("Connection restored, reconnecting");
            tokio::spawn(self.inner.clone().attempt_reconnect());
        }
    }
}

impl Inner {
    fn stall_check(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.state.lock();
            if state.timer_epoch != epoch {
                return;
            }
            state.stall_timer = None;
        }
        let Some(host) = self.host.upgrade() else {
            return;
        };
        let still_stalled = host.ready_state() < ReadyState::HaveFutureData
            && !host.is_paused()
            && !host.is_ended()
            && host.current_index().is_some()
            && !host.is_loading()
            && host.current_time() > 0.0;
        if still_stalled {
            tracing::warn!("Persistent stall, reconnecting");
            self.handle_slow_connection(host.as_ref());
        }
    }

    fn buffering_check(self: &Arc<Self>, epoch: u64) {
        let still_buffering = {
            let mut state = self.state.lock();
            if state.timer_epoch != epoch {
                return;
            }
            state.buffering_timer = None;
            state.buffering_since.is_some()
        };
        let Some(host) = self.host.upgrade() else {
            return;
        };
        if still_buffering && host.current_index().is_some() && !host.is_loading() {
            tracing::warn!("Buffering for over {:?}, reconnecting", self.timings.buffering_timeout);
            self.handle_slow_connection(host.as_ref());
        }
    }

    fn handle_slow_connection(self: &Arc<Self>, host: &dyn RecoveryHost) {
        if host.is_recovering() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.reconnect_attempts > 0 {
                return;
            }
            state.saved_playback_time = host.current_time();
            state.clear_buffering_timers();
        }
        tokio::spawn(self.clone().attempt_reconnect());
    }

    fn is_stale(&self, episode: u64, token: &PlayToken, index: usize, host: &dyn RecoveryHost) -> bool {
        self.state.lock().episode != episode
            || token.is_stale()
            || host.current_index() != Some(index)
    }

    /// One reconnect attempt; schedules the next one on failure
    fn attempt_reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            let Some(host) = self.host.upgrade() else {
                return;
            };
            let Some(index) = host.current_index() else {
                return;
            };

            let (attempt, episode, saved) = {
                let mut state = self.state.lock();
                state.reconnect_timer = None;
                if state.offline {
                    tracing::warn!("Still offline, waiting for the connection");
                    state.connection_lost = true;
                    return;
                }
                if !host.is_paused() && host.ready_state() >= ReadyState::HaveFutureData {
                    tracing::debug!("Already playing, reconnect not needed");
                    state.reset_reconnect();
                    state.clear_buffering_timers();
                    return;
                }
                if host.is_ended() {
                    state.reset_reconnect();
                    state.clear_buffering_timers();
                    drop(state);
                    host.advance_after_end(index);
                    return;
                }
                state.reconnect_attempts += 1;
                (state.reconnect_attempts, state.episode, state.saved_playback_time)
            };
            tracing::info!(
                "Reconnect attempt {}/{} for track {}",
                attempt,
                self.retry.max_attempts,
                index
            );

            let token = host.current_token();
            host.pause();
            tokio::time::sleep(self.timings.reset_delay).await;
            if self.is_stale(episode, &token, index, host.as_ref()) {
                return;
            }

            let resumed = match host.refresh_url(index, attempt > 1).await {
                Some(url) if !self.is_stale(episode, &token, index, host.as_ref()) => {
                    host.replace_source(&url);
                    if host.wait_ready(self.timings.ready_timeout).await
                        && !self.is_stale(episode, &token, index, host.as_ref())
                    {
                        if saved > 0.0 && saved.is_finite() {
                            host.seek((saved - self.timings.rewind).max(0.0));
                        }
                        host.play(&token).await
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if self.is_stale(episode, &token, index, host.as_ref()) {
                return;
            }

            if resumed {
                tracing::info!("Reconnected track {} on attempt {}", index, attempt);
                let mut state = self.state.lock();
                state.reset_reconnect();
                state.clear_buffering_timers();
                return;
            }

            tracing::warn!("Reconnect attempt {} failed for track {}", attempt, index);
            if self.retry.should_retry(attempt) {
                let delay = self.retry.delay_for(attempt);
                tracing::debug!("Next reconnect attempt in {:?}", delay);
                let inner = self.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if inner.state.lock().episode == episode {
                        inner.attempt_reconnect().await;
                    }
                });
                let mut state = self.state.lock();
                if state.episode == episode {
                    state.reconnect_timer = Some(timer);
                } else {
                    timer.abort();
                }
            } else {
                tracing::error!(
                    "Giving up on track {} after {} reconnect attempts",
                    index,
                    attempt
                );
                {
                    let mut state = self.state.lock();
                    state.reset_reconnect();
                    state.clear_buffering_timers();
                    state.abandoned = true;
                }
                host.abandon_track(index);
            }
        }
        .boxed()
    }
}
