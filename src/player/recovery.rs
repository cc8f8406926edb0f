use async_trait::async_trait;
use std::time::Duration;

use crate::engine::{MediaErrorCode, PlayToken, ReadyState, SinkId};
use crate::resilience::RecoveryHost;
use crate::resolver::ResolveOptions;

use super::{PlayerEvent, PlayerShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryStep {
    Recovered,
    Abandoned,
    /// The user moved on while recovering
    Stale,
    RetryLater,
}

impl PlayerShared {
    fn recovery_is_stale(&self, index: usize, token: &PlayToken) -> bool {
        token.is_stale() || !self.is_current(index)
    }

    /// Media error recovery for the track at `index`: refresh its stream and
    /// resume where it broke off, falling back to another candidate and
    /// finally marking it unavailable
    pub(super) async fn recover(&self, index: usize) {
        {
            let mut session = self.session.lock();
            if session.recovering {
                return;
            }
            session.recovering = true;
        }

        let token = self.engine.current_token();
        loop {
            if self.recovery_attempt(index, &token).await != RecoveryStep::RetryLater {
                break;
            }
            tokio::time::sleep(self.recovery.retry_delay).await;
            if self.recovery_is_stale(index, &token) || self.engine.is_audible() {
                break;
            }
        }

        self.session.lock().recovering = false;
    }

    async fn recovery_attempt(&self, index: usize, token: &PlayToken) -> RecoveryStep {
        let attempt = self
            .session
            .lock()
            .record_error(index, self.recovery.error_window);
        if attempt > self.recovery.max_attempts {
            tracing::error!("Track {} keeps failing, skipping it", index);
            self.abandon_track_now(index);
            return RecoveryStep::Abandoned;
        }
        tracing::warn!(
            "Media error on track {}, recovery attempt {}/{}",
            index,
            attempt,
            self.recovery.max_attempts
        );

        let result = self.resolve_at(index, ResolveOptions::recovery()).await;
        if self.recovery_is_stale(index, token) {
            return RecoveryStep::Stale;
        }
        let Some(result) = result else {
            return self.recover_with_alternative(index, token).await;
        };

        let saved = self.engine.active_sink().current_time();
        self.engine.reset_active();
        tokio::time::sleep(self.reset_delay).await;
        if self.recovery_is_stale(index, token) {
            return RecoveryStep::Stale;
        }

        self.engine.replace_source(&result.playable_url);
        let sink = self.engine.active_sink();
        if tokio::time::timeout(
            self.recovery.ready_timeout,
            sink.wait_for(ReadyState::HaveFutureData),
        )
        .await
        .is_err()
        {
            tracing::debug!("Sink not ready after {:?}, playing anyway", self.recovery.ready_timeout);
        }
        if self.recovery_is_stale(index, token) {
            return RecoveryStep::Stale;
        }
        if saved > 1.0 && saved.is_finite() {
            sink.seek((saved - self.recovery.rewind).max(0.0));
        }

        let resumed = self.engine.resume(token).await;
        if self.recovery_is_stale(index, token) {
            return RecoveryStep::Stale;
        }
        if resumed {
            tracing::info!("Recovered track {} at {:.1}s", index, saved);
            self.mark_recovered(index);
            return RecoveryStep::Recovered;
        }

        if attempt >= self.recovery.max_attempts {
            self.abandon_track_now(index);
            return RecoveryStep::Abandoned;
        }
        RecoveryStep::RetryLater
    }

    /// The chosen stream cannot be refreshed; search for a different one
    /// while ignoring the track's pinned id
    async fn recover_with_alternative(&self, index: usize, token: &PlayToken) -> RecoveryStep {
        let Some(track) = self.queue.lock().get(index).cloned() else {
            return RecoveryStep::Stale;
        };
        self.resolver.invalidate(&track);

        let pinned = track.video_id.clone();
        let mut unpinned = track.clone();
        unpinned.video_id = None;
        let alternative = self
            .resolver
            .gateway()
            .resolve_track(&unpinned, true)
            .await
            .filter(|result| pinned.as_deref() != Some(result.external_id.as_str()));
        if self.recovery_is_stale(index, token) {
            return RecoveryStep::Stale;
        }

        if let Some(result) = alternative {
            tracing::info!("Trying alternative {} for track {}", result.external_id, index);
            self.resolver.set(track.key(), result.clone());
            if self.engine.play_direct(&result.playable_url, token).await {
                if self.recovery_is_stale(index, token) {
                    return RecoveryStep::Stale;
                }
                self.mark_recovered(index);
                return RecoveryStep::Recovered;
            }
            if self.recovery_is_stale(index, token) {
                return RecoveryStep::Stale;
            }
        }

        tracing::warn!("No alternative stream for track {}", index);
        self.abandon_track_now(index);
        RecoveryStep::Abandoned
    }

    fn mark_recovered(&self, index: usize) {
        {
            let mut session = self.session.lock();
            session.error_counts.remove(&index);
            session.playing = true;
        }
        self.emit(PlayerEvent::PlaybackStateChanged { playing: true });
        self.schedule_watchdog();
    }
}

#[async_trait]
impl RecoveryHost for PlayerShared {
    fn current_index(&self) -> Option<usize> {
        self.queue.lock().current()
    }

    fn current_token(&self) -> PlayToken {
        self.engine.current_token()
    }

    fn is_loading(&self) -> bool {
        self.session.lock().loading
    }

    fn is_recovering(&self) -> bool {
        self.session.lock().recovering
    }

    fn current_time(&self) -> f64 {
        self.engine.active_sink().current_time()
    }

    fn ready_state(&self) -> ReadyState {
        self.engine.active_sink().ready_state()
    }

    fn is_paused(&self) -> bool {
        self.engine.active_sink().is_paused()
    }

    fn is_ended(&self) -> bool {
        self.engine.active_sink().is_ended()
    }

    fn should_ignore_error(&self, sink_id: SinkId, code: MediaErrorCode) -> bool {
        self.engine.should_ignore_error(sink_id, code)
    }

    fn pause(&self) {
        self.engine.pause();
    }

    fn seek(&self, seconds: f64) {
        self.engine.active_sink().seek(seconds);
    }

    fn replace_source(&self, url: &str) {
        self.engine.replace_source(url);
    }

    async fn play(&self, token: &PlayToken) -> bool {
        if !self.engine.resume(token).await {
            return false;
        }
        if token.is_current() {
            self.session.lock().playing = true;
            self.emit(PlayerEvent::PlaybackStateChanged { playing: true });
            self.schedule_watchdog();
        }
        true
    }

    async fn wait_ready(&self, timeout: Duration) -> bool {
        let sink = self.engine.active_sink();
        tokio::time::timeout(timeout, sink.wait_for(ReadyState::HaveFutureData))
            .await
            .is_ok()
    }

    async fn refresh_url(&self, index: usize, force_refresh: bool) -> Option<String> {
        let options = ResolveOptions {
            force_refresh,
            preserve_failures: true,
        };
        self.resolve_at(index, options)
            .await
            .map(|result| result.playable_url)
    }

    fn abandon_track(&self, index: usize) {
        if self.is_current(index) {
            self.abandon_track_now(index);
        }
    }

    fn advance_after_end(&self, index: usize) {
        self.handle_track_end(index);
    }

    fn recover_from_error(&self, index: usize) {
        if let Some(shared) = self.this.upgrade() {
            tokio::spawn(async move { shared.recover(index).await });
        }
    }

    fn report_slow_connection(&self, buffered: Duration) {
        self.emit(PlayerEvent::SlowConnection {
            buffered_ms: buffered.as_millis() as u64,
        });
    }
}
