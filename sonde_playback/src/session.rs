//! Control surface handed to the presentation layer.
//!
//! A [`Session`] owns one [`StreamEngine`] and one [`PlaybackScheduler`] and
//! keeps the scheduler's view of the windowed slice in step with the series
//! after every mutation, so playback never reads a half-merged series.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::EngineConfig;
use crate::observation::{Observation, SeriesSummary};
use crate::playback::{PendingAdvance, PlaybackScheduler};
use crate::presentation::{map_observation, PresentationFrame};
use crate::source::{FetchPage, ObservationSource};
use crate::stream::{PollOutcome, PollTicket, StreamEngine, StreamStatus};
use crate::window::PlaybackWindow;
use crate::StreamError;

/// Everything a renderer needs to draw one moment of the session.
#[derive(Clone, Debug, Serialize)]
pub struct Snapshot {
    pub status: StreamStatus,
    pub error_message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub series_len: usize,
    pub slice_len: usize,
    /// The window selects nothing. Informational, not an error.
    pub empty_window: bool,
    pub window: PlaybackWindow,
    pub mission_filter: Option<String>,
    pub index: usize,
    pub progress: f64,
    pub is_playing: bool,
    pub speed: f64,
    pub current: Option<Observation>,
}

/// One replayed sample with its presentation mapping.
#[derive(Clone, Debug, Serialize)]
pub struct Frame {
    pub index: usize,
    pub progress: f64,
    pub observation: Observation,
    pub presentation: PresentationFrame,
}

#[derive(Debug)]
pub struct Session {
    engine: StreamEngine,
    playback: PlaybackScheduler,
    window: PlaybackWindow,
    bounds: Range<usize>,
    seen_revision: u64,
}

impl Session {
    pub fn new(config: &EngineConfig) -> Self {
        Self::from_parts(StreamEngine::new(config), PlaybackScheduler::from_config(config))
    }

    pub fn from_parts(engine: StreamEngine, playback: PlaybackScheduler) -> Self {
        let mut session = Self {
            engine,
            playback,
            window: PlaybackWindow::full(),
            bounds: 0..0,
            seen_revision: 0,
        };
        session.sync_slice();
        session
    }

    pub fn engine(&self) -> &StreamEngine {
        &self.engine
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn window(&self) -> PlaybackWindow {
        self.window
    }

    pub fn series(&self) -> &[Observation] {
        self.engine.series()
    }

    /// The windowed slice playback walks through.
    pub fn slice(&self) -> &[Observation] {
        &self.engine.series()[self.bounds.clone()]
    }

    pub fn current_observation(&self) -> Option<&Observation> {
        self.slice().get(self.playback.index())
    }

    pub fn progress(&self) -> f64 {
        self.playback.progress()
    }

    pub fn summary(&self) -> Option<SeriesSummary> {
        SeriesSummary::from_slice(self.slice())
    }

    pub fn frame(&self) -> Option<Frame> {
        let observation = self.current_observation()?.clone();
        Some(Frame {
            index: self.playback.index(),
            progress: self.playback.progress(),
            presentation: map_observation(&observation),
            observation,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let slice_len = self.bounds.len();
        Snapshot {
            status: self.engine.status(),
            error_message: self.engine.error_message().map(str::to_string),
            last_updated: self.engine.last_updated(),
            degraded: self.engine.is_degraded(),
            series_len: self.engine.series().len(),
            slice_len,
            empty_window: slice_len == 0 && !self.engine.series().is_empty(),
            window: self.window,
            mission_filter: self.engine.mission_filter().map(str::to_string),
            index: self.playback.index(),
            progress: self.playback.progress(),
            is_playing: self.playback.is_playing(),
            speed: self.playback.speed(),
            current: self.current_observation().cloned(),
        }
    }

    pub fn play(&mut self) {
        self.playback.play();
    }

    pub fn pause(&mut self) {
        self.playback.pause();
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.playback.set_speed(speed);
    }

    pub fn set_progress(&mut self, progress: f64) {
        self.playback.set_progress(progress);
    }

    pub fn step_backward(&mut self) {
        self.playback.step_backward();
    }

    pub fn step_forward(&mut self) {
        self.playback.step_forward();
    }

    /// New window parameters start playback over from the first sample.
    pub fn set_window(&mut self, window: PlaybackWindow) {
        if window == self.window {
            return;
        }
        info!(start_hour = window.start_hour(), duration_hours = ?window.duration_hours(), "window changed");
        self.window = window;
        self.bounds = self.window.bounds(self.engine.series());
        self.playback.restart(self.bounds.len());
    }

    pub fn set_mission_filter(&mut self, mission: Option<String>) -> bool {
        let changed = self.engine.set_mission_filter(mission);
        if changed {
            self.sync_slice();
        }
        changed
    }

    pub fn set_lookback_hours(&mut self, hours: f64) -> bool {
        let changed = self.engine.set_lookback_hours(hours);
        if changed {
            self.sync_slice();
        }
        changed
    }

    pub fn reset(&mut self) {
        self.engine.reset();
        self.sync_slice();
    }

    /// Poll synchronously on the calling thread.
    pub fn refresh_now<S: ObservationSource + ?Sized>(&mut self, source: &S) -> PollOutcome {
        let outcome = self.engine.poll(source);
        self.sync_slice();
        outcome
    }

    pub fn begin_poll(&mut self) -> Option<PollTicket> {
        self.engine.begin_poll()
    }

    pub fn complete_poll(
        &mut self,
        ticket: PollTicket,
        result: Result<FetchPage, StreamError>,
    ) -> PollOutcome {
        let outcome = self.engine.complete_poll(ticket, result);
        self.sync_slice();
        outcome
    }

    /// Replace the pending advance based on the current slice.
    pub fn schedule_advance(&mut self) -> Option<PendingAdvance> {
        let range = self.bounds.clone();
        self.playback.tick(&self.engine.series()[range])
    }

    pub fn advance(&mut self, pending: PendingAdvance) -> bool {
        self.playback.advance(pending)
    }

    /// Release the pending advance; the session stays usable.
    pub fn teardown(&mut self) {
        self.playback.cancel();
    }

    fn sync_slice(&mut self) {
        self.bounds = self.window.bounds(self.engine.series());
        self.playback.set_slice_len(self.bounds.len());
        if self.engine.revision() != self.seen_revision {
            self.seen_revision = self.engine.revision();
            self.playback.cancel();
        }
    }
}
