use std::time::Duration;

use crate::config::PlaybackConfig;

/// Identity of one play-through: `playlist:index:duration_ms`
pub fn transition_key(playlist: &str, index: usize, duration_secs: f64) -> String {
    format!(
        "{}:{}:{}",
        playlist,
        index,
        (duration_secs * 1000.0).round() as u64
    )
}

/// When to start an automatic crossfade and when a track counts as finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTimings {
    pub crossfade: Duration,
    pub crossfade_lead: Duration,
    pub min_crossfade_trigger: Duration,
    pub min_crossfade_track: Duration,
    pub watchdog_grace: Duration,
    pub end_tolerance: Duration,
}

impl TransitionTimings {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            crossfade: Duration::from_millis(config.crossfade_ms),
            crossfade_lead: Duration::from_millis(config.crossfade_lead_ms),
            min_crossfade_trigger: Duration::from_millis(config.min_crossfade_trigger_ms),
            min_crossfade_track: Duration::from_millis(config.min_crossfade_track_ms),
            watchdog_grace: Duration::from_millis(config.watchdog_grace_ms),
            end_tolerance: Duration::from_millis(config.end_tolerance_ms),
        }
    }

    /// Remaining time at which an automatic crossfade starts
    pub fn crossfade_window(&self) -> Duration {
        self.min_crossfade_trigger
            .max(self.crossfade.saturating_sub(self.crossfade_lead))
    }

    pub fn should_crossfade(&self, current_secs: f64, duration_secs: f64) -> bool {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return false;
        }
        if duration_secs < self.min_crossfade_track.as_secs_f64() {
            return false;
        }
        let remaining = duration_secs - current_secs;
        remaining > 0.0 && remaining <= self.crossfade_window().as_secs_f64()
    }

    /// Position is within the end tolerance of a known duration
    pub fn near_end(&self, current_secs: f64, duration_secs: f64) -> bool {
        duration_secs.is_finite()
            && duration_secs > 0.0
            && duration_secs - current_secs <= self.end_tolerance.as_secs_f64()
    }

    /// Delay until the end-of-track watchdog should fire
    pub fn watchdog_delay(&self, current_secs: f64, duration_secs: f64) -> Option<Duration> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return None;
        }
        let remaining = (duration_secs - current_secs).max(0.0);
        Some(Duration::from_secs_f64(remaining) + self.watchdog_grace)
    }
}

impl Default for TransitionTimings {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

/// De-duplicates automatic crossfades and end-of-track advances.
///
/// The natural end signal, the watchdog and the time-update poll can all
/// report the same ending; only the first claim for a key wins.
#[derive(Debug, Default)]
pub struct TransitionGuard {
    crossfade_key: Option<String>,
    end_key: Option<String>,
    advancing: bool,
}

impl TransitionGuard {
    pub fn claim_crossfade(&mut self, key: &str) -> bool {
        if self.advancing || self.crossfade_key.as_deref() == Some(key) {
            return false;
        }
        self.crossfade_key = Some(key.to_string());
        true
    }

    pub fn crossfade_claimed(&self, key: &str) -> bool {
        self.crossfade_key.as_deref() == Some(key)
    }

    pub fn claim_end(&mut self, key: &str) -> bool {
        if self.advancing || self.end_key.as_deref() == Some(key) {
            return false;
        }
        self.end_key = Some(key.to_string());
        self.advancing = true;
        true
    }

    pub fn is_advancing(&self) -> bool {
        self.advancing
    }

    pub fn finish_advance(&mut self) {
        self.advancing = false;
    }

    /// Forget the end key, keeping the crossfade claim
    pub fn clear_end(&mut self) {
        self.end_key = None;
        self.advancing = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
