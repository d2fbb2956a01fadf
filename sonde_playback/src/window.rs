use std::ops::Range;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::observation::Observation;

/// Hour-based view over the series, anchored at its first observation.
///
/// Only constructed through [`PlaybackWindow::new`], so both fields are
/// always finite and the start is never negative.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlaybackWindow {
    start_hour: f64,
    /// `None` runs to the end of the series.
    duration_hours: Option<f64>,
}

impl Default for PlaybackWindow {
    fn default() -> Self {
        Self::full()
    }
}

impl PlaybackWindow {
    pub fn full() -> Self {
        Self {
            start_hour: 0.0,
            duration_hours: None,
        }
    }

    /// Negative or non-finite starts clamp to zero; a non-positive or
    /// non-finite duration means "to the end".
    pub fn new(start_hour: f64, duration_hours: Option<f64>) -> Self {
        let start_hour = if start_hour.is_finite() {
            start_hour.max(0.0)
        } else {
            0.0
        };
        let duration_hours = duration_hours.filter(|d| d.is_finite() && *d > 0.0);
        Self {
            start_hour,
            duration_hours,
        }
    }

    pub fn start_hour(&self) -> f64 {
        self.start_hour
    }

    pub fn duration_hours(&self) -> Option<f64> {
        self.duration_hours
    }

    /// Index range of `series` (sorted by instant) that falls in the window.
    /// Offsets past the representable time range select to the end.
    pub fn bounds(&self, series: &[Observation]) -> Range<usize> {
        let Some(anchor) = series.first().map(Observation::instant) else {
            return 0..0;
        };
        let Some(start) = offset(anchor, self.start_hour) else {
            return series.len()..series.len();
        };
        let lo = series.partition_point(|obs| obs.instant() < start);
        let hi = match self.duration_hours.and_then(|d| offset(start, d)) {
            Some(end) => series.partition_point(|obs| obs.instant() < end),
            None => series.len(),
        };
        lo..hi.max(lo)
    }

    pub fn slice<'a>(&self, series: &'a [Observation]) -> &'a [Observation] {
        &series[self.bounds(series)]
    }
}

/// `None` when `hours` does not fit in a chrono duration or the sum overflows.
fn offset(from: DateTime<Utc>, hours: f64) -> Option<DateTime<Utc>> {
    let millis = (hours * 3_600_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    from.checked_add_signed(Duration::try_milliseconds(millis as i64)?)
}
