//! Fade levels for the handoff between two sinks
//!
//! The ramp is linear, so at any instant the incoming and outgoing levels sum
//! to one. Progress comes from elapsed time, not from the number of ticks.

use std::time::Duration;

/// Crossfade state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeState {
    /// No crossfade active, normal playback
    #[default]
    Inactive,
    /// Both sinks audible, levels ramping
    Active,
    /// Ramp finished, outgoing sink waiting to be recycled
    Completed,
}

/// Gain multipliers for the incoming and outgoing sink
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeLevels {
    pub fade_in: f64,
    pub fade_out: f64,
}

impl FadeLevels {
    pub const SILENT_START: FadeLevels = FadeLevels {
        fade_in: 0.0,
        fade_out: 1.0,
    };
    pub const DONE: FadeLevels = FadeLevels {
        fade_in: 1.0,
        fade_out: 0.0,
    };
}

/// A linear crossfade of fixed duration, sampled every `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FadeRamp {
    duration: Duration,
    step: Duration,
}

impl FadeRamp {
    pub fn new(duration: Duration, step: Duration) -> Self {
        Self {
            duration,
            step: step.max(Duration::from_millis(1)),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Normalized position (0.0 to 1.0) after `elapsed`
    pub fn progress(&self, elapsed: Duration) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        (elapsed.as_secs_f64() / self.duration.as_secs_f64()).clamp(0.0, 1.0)
    }

    pub fn levels_at(&self, elapsed: Duration) -> FadeLevels {
        let position = self.progress(elapsed);
        FadeLevels {
            fade_in: position,
            fade_out: 1.0 - position,
        }
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }
}
