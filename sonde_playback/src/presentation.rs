//! Deterministic mapping from one observation to scene and audio parameters.
//!
//! Renderers and synthesizers consume these values directly; nothing here
//! holds state.

use serde::Serialize;

use crate::observation::Observation;

pub const ALTITUDE_SCALE_M: f64 = 32_000.0;
pub const COLD_C: f64 = -70.0;
pub const WARM_C: f64 = 40.0;
pub const WIND_SCALE_MPS: f64 = 50.0;

const BASE_FREQUENCY_HZ: f64 = 110.0;
const PITCH_OCTAVES: f64 = 4.0;
const COLD_RGB: [f64; 3] = [40.0, 90.0, 255.0];
const WARM_RGB: [f64; 3] = [255.0, 70.0, 40.0];

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VisualParams {
    /// Altitude over [`ALTITUDE_SCALE_M`], clamped to `[0, 1]`.
    pub altitude_norm: f64,
    pub color_rgb: [u8; 3],
    /// Relative humidity as fog density, `[0, 1]`.
    pub haze: f64,
    /// Direction the wind blows from, degrees clockwise from north.
    pub wind_heading_deg: f64,
    /// Wind speed over [`WIND_SCALE_MPS`], clamped to `[0, 1]`.
    pub wind_magnitude: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AudioParams {
    pub frequency_hz: f64,
    pub cutoff_hz: f64,
    pub gain: f64,
    /// -1 (left, westward flow) to 1 (right, eastward flow).
    pub pan: f64,
    pub tempo_bpm: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PresentationFrame {
    pub visual: VisualParams,
    pub audio: AudioParams,
}

pub fn map_observation(obs: &Observation) -> PresentationFrame {
    let altitude_norm = unit(obs.altitude() / ALTITUDE_SCALE_M);
    let warmth = unit((obs.temperature() - COLD_C) / (WARM_C - COLD_C));
    let humidity = unit(obs.humidity() / 100.0);
    let speed = obs.wind_speed();

    let visual = VisualParams {
        altitude_norm,
        color_rgb: color_ramp(warmth),
        haze: humidity,
        wind_heading_deg: wind_heading(obs.wind_u(), obs.wind_v()),
        wind_magnitude: unit(speed / WIND_SCALE_MPS),
    };
    let audio = AudioParams {
        frequency_hz: BASE_FREQUENCY_HZ * 2f64.powf(PITCH_OCTAVES * altitude_norm),
        cutoff_hz: 200.0 + 7_800.0 * warmth,
        gain: 0.2 + 0.6 * humidity,
        pan: if speed > 0.0 {
            (obs.wind_u() / speed).clamp(-1.0, 1.0)
        } else {
            0.0
        },
        tempo_bpm: (60.0 + 3.0 * speed).min(240.0),
    };
    PresentationFrame { visual, audio }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn color_ramp(t: f64) -> [u8; 3] {
    let mut rgb = [0u8; 3];
    for (channel, (cold, warm)) in rgb.iter_mut().zip(COLD_RGB.iter().zip(WARM_RGB.iter())) {
        *channel = (cold + (warm - cold) * t).round().clamp(0.0, 255.0) as u8;
    }
    rgb
}

fn wind_heading(u: f64, v: f64) -> f64 {
    if u == 0.0 && v == 0.0 {
        return 0.0;
    }
    (-u).atan2(-v).to_degrees().rem_euclid(360.0)
}
