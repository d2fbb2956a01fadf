//! Fallback flight profile used when the live source is unreachable.
//!
//! The shape is fixed (an ascent from near the ground to the stratosphere
//! over one day, warming aloft, cyclic humidity and wind) while the noise is
//! unseeded, so callers should only rely on ranges and trends.

use std::f64::consts::TAU;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::observation::Observation;

pub const SPAN_HOURS: i64 = 24;
pub const MAX_JITTER_SECS: i64 = 120;
pub const SYNTHETIC_MISSION: &str = "synthetic";

const ALTITUDE_FLOOR_M: f64 = 500.0;
const ALTITUDE_CEILING_M: f64 = 29_500.0;
const ALTITUDE_NOISE_M: f64 = 150.0;
const TEMPERATURE_START_C: f64 = -65.0;
const TEMPERATURE_END_C: f64 = -25.0;
const TEMPERATURE_NOISE_C: f64 = 1.5;
const MAX_WIND_SPEED_MPS: f64 = 60.0;

/// `count` observations spread over [`SPAN_HOURS`] from `origin`.
pub fn generate(origin: DateTime<Utc>, count: usize) -> Vec<Observation> {
    generate_with(&mut rand::thread_rng(), origin, count)
}

pub fn generate_with<R: Rng + ?Sized>(
    rng: &mut R,
    origin: DateTime<Utc>,
    count: usize,
) -> Vec<Observation> {
    let span_ms = SPAN_HOURS * 3_600_000;
    let step_ms = span_ms as f64 / count.max(1) as f64;
    let jitter_ms = MAX_JITTER_SECS * 1000;

    (0..count)
        .map(|i| {
            let p = if count > 1 {
                i as f64 / (count - 1) as f64
            } else {
                0.0
            };
            let offset_ms = (i as f64 * step_ms).round() as i64 + rng.gen_range(-jitter_ms..=jitter_ms);
            let instant = origin + Duration::milliseconds(offset_ms);

            let ease = p * p * (3.0 - 2.0 * p);
            let altitude = (ALTITUDE_FLOOR_M
                + (ALTITUDE_CEILING_M - ALTITUDE_FLOOR_M) * ease
                + rng.gen_range(-ALTITUDE_NOISE_M..=ALTITUDE_NOISE_M))
                .max(0.0);
            let temperature = TEMPERATURE_START_C
                + (TEMPERATURE_END_C - TEMPERATURE_START_C) * p
                + rng.gen_range(-TEMPERATURE_NOISE_C..=TEMPERATURE_NOISE_C);
            let humidity =
                (45.0 + 35.0 * (TAU * 3.0 * p).sin() + rng.gen_range(-5.0..=5.0)).clamp(0.0, 100.0);
            let speed = (14.0 + 10.0 * (TAU * 2.0 * p + 0.6).sin() + rng.gen_range(-2.0..=2.0))
                .clamp(0.0, MAX_WIND_SPEED_MPS);

            // Meteorological convention: direction is where the wind blows from.
            let direction = (360.0 * p + rng.gen_range(-10.0..=10.0)).to_radians();
            let wind_u = -speed * direction.sin();
            let wind_v = -speed * direction.cos();

            Observation::new(
                format!("{SYNTHETIC_MISSION}-{}-{i:04}", origin.timestamp()),
                SYNTHETIC_MISSION,
                instant,
                altitude,
                temperature,
                humidity,
                wind_u,
                wind_v,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn mean(values: impl Iterator<Item = f64>) -> f64 {
        let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        sum / n.max(1) as f64
    }

    #[test]
    fn values_stay_in_physical_ranges() {
        let series = generate(origin(), 240);
        assert_eq!(series.len(), 240);
        for obs in &series {
            assert!((0.0..=ALTITUDE_CEILING_M + ALTITUDE_NOISE_M).contains(&obs.altitude()));
            assert!((-67.0..=-23.0).contains(&obs.temperature()));
            assert!((0.0..=100.0).contains(&obs.humidity()));
            assert!(obs.wind_speed() <= MAX_WIND_SPEED_MPS + 1e-9);
            assert!((obs.wind_speed() - obs.wind_u().hypot(obs.wind_v())).abs() < 1e-12);
            assert_eq!(obs.mission_id(), SYNTHETIC_MISSION);
        }
    }

    #[test]
    fn timestamps_cover_one_day_with_bounded_jitter() {
        let series = generate(origin(), 96);
        let earliest = origin() - Duration::seconds(MAX_JITTER_SECS);
        let latest = origin() + Duration::hours(SPAN_HOURS) + Duration::seconds(MAX_JITTER_SECS);
        assert!(series
            .iter()
            .all(|obs| obs.instant() >= earliest && obs.instant() <= latest));
        let last = series.last().unwrap().instant();
        assert!(last - origin() > Duration::hours(23));
    }

    #[test]
    fn altitude_trends_upward() {
        let mut rng = StdRng::seed_from_u64(7);
        let series = generate_with(&mut rng, origin(), 200);
        let quarter = series.len() / 4;
        let early = mean(series[..quarter].iter().map(Observation::altitude));
        let late = mean(series[series.len() - quarter..].iter().map(Observation::altitude));
        assert!(late > early + 20_000.0, "early={early} late={late}");
        assert!(series.first().unwrap().altitude() < 1_000.0);
        assert!(series.last().unwrap().altitude() > 29_000.0);
    }

    #[test]
    fn ids_are_unique() {
        let series = generate(origin(), 500);
        let ids: HashSet<&str> = series.iter().map(Observation::id).collect();
        assert_eq!(ids.len(), series.len());
    }

    #[test]
    fn degenerate_counts() {
        assert!(generate(origin(), 0).is_empty());
        let single = generate(origin(), 1);
        assert_eq!(single.len(), 1);
        assert!(single[0].altitude() < 1_000.0);
    }
}
