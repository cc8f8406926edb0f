use crate::engine::{CrossfadeStart, PlayToken};
use crate::resolver::ResolveOptions;

use super::{PlayerEvent, PlayerShared};

/// How one play request for one index ended
#[derive(Debug)]
pub(super) enum PlayOutcome {
    Played,
    /// A newer play request took over
    Stale,
    /// The track was marked unavailable by the request holding this token
    Unavailable(PlayToken),
    /// No track at that index
    Missing,
}

impl PlayerShared {
    pub(super) async fn play_track(&self, index: usize) -> bool {
        match self.play_index(index, false).await {
            PlayOutcome::Played => true,
            PlayOutcome::Unavailable(token) if token.is_current() => {
                self.play_next_from(index + 1).await
            }
            _ => false,
        }
    }

    pub(super) async fn play_next_from(&self, start: usize) -> bool {
        {
            let mut session = self.session.lock();
            if session.advancing {
                return false;
            }
            session.advancing = true;
        }
        let played = self.walk_queue(start).await;
        self.session.lock().advancing = false;
        played
    }

    /// Try tracks from `start` on until one plays or the queue runs out
    async fn walk_queue(&self, start: usize) -> bool {
        let mut start = start;
        loop {
            let next = self.queue.lock().next_playable_from(start);
            let Some(index) = next else {
                self.finish_queue();
                return false;
            };
            match self.play_index(index, false).await {
                PlayOutcome::Played => return true,
                PlayOutcome::Unavailable(token) if token.is_current() => start = index + 1,
                _ => return false,
            }
        }
    }

    fn finish_queue(&self) {
        tracing::info!("Reached the end of the queue");
        self.engine.stop();
        self.resilience.reset();
        {
            let mut session = self.session.lock();
            session.cancel_watchdog();
            session.guard.reset();
            session.playing = false;
            session.loading = false;
            session.crossfade_pending = false;
        }
        self.queue.lock().set_current(None);
        self.emit(PlayerEvent::PlaybackStateChanged { playing: false });
        self.emit(PlayerEvent::QueueFinished);
    }

    /// Fade into `next` from the track that is ending
    pub(super) async fn crossfade_to(&self, next: usize) {
        if let PlayOutcome::Unavailable(token) = self.play_index(next, true).await {
            if token.is_current() {
                self.play_next_from(next + 1).await;
            }
        }
    }

    /// One play request: resolve, start (directly or crossfaded), and on
    /// failure refresh the stream once before giving up on the track
    pub(super) async fn play_index(&self, index: usize, crossfade: bool) -> PlayOutcome {
        let Some(track) = self.queue.lock().get(index).cloned() else {
            self.session.lock().crossfade_pending = false;
            return PlayOutcome::Missing;
        };

        self.engine.cancel_crossfade();
        let token = self.engine.begin_play();
        if track.unavailable {
            self.session.lock().crossfade_pending = false;
            return PlayOutcome::Unavailable(token);
        }

        let previous = self.queue.lock().current();
        self.resilience.reset();
        {
            let mut session = self.session.lock();
            session.cancel_watchdog();
            session.loading = true;
            session.crossfade_pending = crossfade;
            session.guard.clear_end();
        }
        self.queue.lock().set_current(Some(index));
        tracing::info!("Playing track {}: {} - {}", index, track.artist_names(), track.name);
        self.emit(PlayerEvent::NowPlayingChanged {
            index,
            name: track.name.clone(),
            artists: track.artist_names(),
        });
        self.emit(PlayerEvent::LoadingChanged { index, loading: true });

        let url = self.resolve_url(index).await;
        if token.is_stale() {
            return PlayOutcome::Stale;
        }
        let Some(url) = url else {
            self.give_up(index, &token);
            return PlayOutcome::Unavailable(token);
        };

        let mut played = self.start_url(&url, index, previous, crossfade, &token).await;
        if token.is_stale() {
            return PlayOutcome::Stale;
        }
        if !played {
            tracing::warn!("Track {} failed to start, refreshing its stream", index);
            let fresh = self.resolve_at(index, ResolveOptions::refresh()).await;
            if let Some(fresh) = fresh.filter(|_| token.is_current()) {
                played = self
                    .start_url(&fresh.playable_url, index, previous, crossfade, &token)
                    .await;
            }
            if token.is_stale() {
                return PlayOutcome::Stale;
            }
        }

        if !played {
            self.give_up(index, &token);
            return PlayOutcome::Unavailable(token);
        }
        PlayOutcome::Played
    }

    async fn start_url(
        &self,
        url: &str,
        index: usize,
        previous: Option<usize>,
        crossfade: bool,
        token: &PlayToken,
    ) -> bool {
        if !crossfade {
            let played = self.engine.play_direct(url, token).await;
            if played && token.is_current() {
                self.mark_started(index, false);
            }
            return played;
        }

        match self.engine.start_crossfade(url, token).await {
            CrossfadeStart::Direct(played) => {
                if played && token.is_current() {
                    self.mark_started(index, false);
                }
                played
            }
            CrossfadeStart::Started(outgoing) => {
                self.emit(PlayerEvent::CrossfadeStarted {
                    from: previous,
                    to: index,
                });
                self.mark_started(index, true);
                if self.engine.run_crossfade(outgoing, token).await && token.is_current() {
                    self.session.lock().guard.reset();
                    self.schedule_watchdog();
                }
                true
            }
        }
    }

    fn mark_started(&self, index: usize, crossfading: bool) {
        {
            let mut session = self.session.lock();
            session.playing = true;
            session.loading = false;
            session.crossfade_pending = false;
            session.error_counts.remove(&index);
            if crossfading {
                session.guard.clear_end();
            } else {
                session.guard.reset();
            }
        }
        self.emit(PlayerEvent::LoadingChanged { index, loading: false });
        self.emit(PlayerEvent::PlaybackStateChanged { playing: true });
        self.schedule_watchdog();
    }

    /// Mark the track unavailable on behalf of `token`'s request
    pub(super) fn give_up(&self, index: usize, token: &PlayToken) {
        if token.is_stale() {
            return;
        }
        let track = self.queue.lock().mark_unavailable(index).cloned();
        {
            let mut session = self.session.lock();
            session.loading = false;
            session.crossfade_pending = false;
        }
        let Some(track) = track else {
            return;
        };

        tracing::warn!("Track {} (\"{}\") is unavailable", index, track.name);
        self.resolver.invalidate(&track);
        self.emit(PlayerEvent::LoadingChanged { index, loading: false });
        self.emit(PlayerEvent::TrackUnavailable {
            index,
            name: track.name,
        });
    }

    /// Give up on the playing track and move on to the next one
    pub(super) fn abandon_track_now(&self, index: usize) {
        let token = self.engine.current_token();
        self.give_up(index, &token);
        {
            let mut session = self.session.lock();
            session.playing = false;
            session.cancel_watchdog();
        }
        self.engine.reset_active();
        if let Some(shared) = self.this.upgrade() {
            tokio::spawn(async move { shared.play_next_from(index + 1).await });
        }
    }

    pub(super) async fn toggle_playback(&self) -> bool {
        let sink = self.engine.active_sink();
        if !sink.is_paused() {
            self.engine.pause();
            {
                let mut session = self.session.lock();
                session.playing = false;
                session.cancel_watchdog();
            }
            self.emit(PlayerEvent::PlaybackStateChanged { playing: false });
            return false;
        }

        let resumable = sink.source().is_some() && sink.current_time() > 0.0;
        if self.queue.lock().current().is_none() && !resumable {
            return self.play_next_from(0).await;
        }

        let token = self.engine.current_token();
        if !self.engine.resume(&token).await {
            return false;
        }
        self.session.lock().playing = true;
        self.emit(PlayerEvent::PlaybackStateChanged { playing: true });
        self.schedule_watchdog();
        true
    }

    pub(super) async fn retry_unavailable(&self, index: usize) -> bool {
        let track = {
            let mut queue = self.queue.lock();
            let Some(track) = queue.get_mut(index) else {
                return false;
            };
            track.unavailable = false;
            track.clone()
        };
        tracing::info!("Retrying \"{}\"", track.name);
        self.resolver.invalidate(&track);
        self.session.lock().error_counts.remove(&index);

        match self.play_index(index, false).await {
            PlayOutcome::Played => true,
            PlayOutcome::Unavailable(token) if token.is_current() => {
                self.play_next_from(index + 1).await;
                false
            }
            _ => false,
        }
    }
}
