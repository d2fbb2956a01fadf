//! Playback scheduler.
//!
//! Walks an index through a slice of the series. The wait before each step is
//! the real gap between the current and next sample, divided by the speed
//! factor and clamped into `[min_delay, max_delay]`. At most one advance is
//! pending at a time: every change to the index, slice, play state or speed
//! bumps a generation counter, so an advance scheduled earlier is refused when
//! it fires.

use std::time::Duration;

use tracing::debug;

use crate::config::EngineConfig;
use crate::observation::Observation;

/// A scheduled index advance. Only valid for the generation it was issued in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingAdvance {
    generation: u64,
    pub from: usize,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub struct PlaybackScheduler {
    index: usize,
    len: usize,
    playing: bool,
    speed: f64,
    min_speed: f64,
    min_delay: Duration,
    max_delay: Duration,
    generation: u64,
    pending: Option<PendingAdvance>,
}

impl PlaybackScheduler {
    pub fn new(min_delay: Duration, max_delay: Duration, min_speed: f64) -> Self {
        Self {
            index: 0,
            len: 0,
            playing: false,
            speed: 1.0_f64.max(min_speed),
            min_speed,
            min_delay,
            max_delay: max_delay.max(min_delay),
            generation: 0,
            pending: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.min_delay(), config.max_delay(), config.min_speed)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn pending(&self) -> Option<PendingAdvance> {
        self.pending
    }

    /// Position in `[0, 1]`; zero for slices shorter than two samples.
    pub fn progress(&self) -> f64 {
        if self.len <= 1 {
            0.0
        } else {
            self.index as f64 / (self.len - 1) as f64
        }
    }

    pub fn play(&mut self) {
        if !self.playing {
            self.playing = true;
            self.invalidate();
        }
    }

    pub fn pause(&mut self) {
        if self.playing {
            self.playing = false;
            self.invalidate();
        }
    }

    /// Clamped to the configured minimum; non-finite input falls back to it.
    pub fn set_speed(&mut self, speed: f64) {
        let speed = if speed.is_finite() {
            speed.max(self.min_speed)
        } else {
            self.min_speed
        };
        if speed != self.speed {
            self.speed = speed;
            self.invalidate();
        }
    }

    /// Scrub: `index = round(p * (len - 1))`, bypassing the delay model.
    pub fn set_progress(&mut self, progress: f64) {
        let p = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let target = if self.len == 0 {
            0
        } else {
            (p * (self.len - 1) as f64).round() as usize
        };
        self.set_index(target);
    }

    pub fn step_forward(&mut self) {
        self.set_index(self.index.saturating_add(1));
    }

    pub fn step_backward(&mut self) {
        self.set_index(self.index.saturating_sub(1));
    }

    fn set_index(&mut self, index: usize) {
        let clamped = index.min(self.len.saturating_sub(1));
        self.index = clamped;
        self.invalidate();
    }

    /// The slice changed length; keep the relative position when possible.
    pub fn set_slice_len(&mut self, len: usize) {
        if len == self.len {
            return;
        }
        self.len = len;
        self.index = self.index.min(len.saturating_sub(1));
        self.invalidate();
    }

    /// A new window means a new session: start from the first sample.
    pub fn restart(&mut self, len: usize) {
        self.len = len;
        self.index = 0;
        self.invalidate();
    }

    /// Replace the pending advance with one computed from `slice`, or clear it
    /// when playback is paused, the slice has fewer than two samples, or the
    /// index already sits on the last sample.
    pub fn tick(&mut self, slice: &[Observation]) -> Option<PendingAdvance> {
        if slice.len() != self.len {
            self.len = slice.len();
            self.index = self.index.min(self.len.saturating_sub(1));
        }
        self.invalidate();
        if !self.playing || slice.len() < 2 || self.index + 1 >= slice.len() {
            return None;
        }
        let delay = self.advance_delay(&slice[self.index], &slice[self.index + 1]);
        let pending = PendingAdvance {
            generation: self.generation,
            from: self.index,
            delay,
        };
        debug!(from = self.index, delay_ms = delay.as_millis() as u64, "scheduled advance");
        self.pending = Some(pending);
        Some(pending)
    }

    /// Fire a pending advance. Refused if anything changed since it was issued.
    pub fn advance(&mut self, pending: PendingAdvance) -> bool {
        if pending.generation != self.generation || !self.playing {
            return false;
        }
        if pending.from + 1 >= self.len {
            return false;
        }
        self.index = pending.from + 1;
        self.invalidate();
        true
    }

    /// Drop any pending advance without touching the index.
    pub fn cancel(&mut self) {
        self.invalidate();
    }

    pub fn advance_delay(&self, current: &Observation, next: &Observation) -> Duration {
        let scaled = scaled_delay(next.instant() - current.instant(), self.speed);
        clamp_delay(scaled, self.min_delay, self.max_delay)
    }

    fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.pending = None;
    }
}

/// Real gap divided by speed, before clamping. Negative gaps count as zero.
pub fn scaled_delay(gap: chrono::Duration, speed: f64) -> Duration {
    let gap_ms = gap.num_milliseconds().max(0) as f64;
    let speed = if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        1.0
    };
    Duration::from_secs_f64(gap_ms / speed / 1000.0)
}

pub fn clamp_delay(delay: Duration, min: Duration, max: Duration) -> Duration {
    delay.clamp(min, max.max(min))
}
