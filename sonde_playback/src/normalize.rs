//! Raw upstream record -> [`Observation`].
//!
//! The upstream feed has shipped several field spellings over time. Each
//! quantity is resolved by walking its alias list in order and taking the
//! first value that is a finite number (numeric strings included). The order
//! of every list is part of the contract: it decides which unit-bearing field
//! wins when a record carries more than one. New aliases go into the tables,
//! never into branching code.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::observation::{render_timestamp, Observation};
use crate::source::RawRecord;

/// Values below this are Unix seconds, at or above it Unix milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

pub const UNKNOWN_MISSION: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Quantity {
    Altitude,
    Temperature,
    Humidity,
    WindU,
    WindV,
}

const NUMERIC_ALIASES: &[(Quantity, &[&str])] = &[
    (
        Quantity::Altitude,
        &["altitude", "alt", "altitude_m", "height", "geopotential_height"],
    ),
    (
        Quantity::Temperature,
        &["temperature", "temp", "temperature_c", "air_temperature"],
    ),
    (
        Quantity::Humidity,
        &["humidity", "relative_humidity", "rh", "humidity_pct"],
    ),
    (
        Quantity::WindU,
        &["speed_u", "wind_u", "windComponentU", "u_wind", "speed_x"],
    ),
    (
        Quantity::WindV,
        &["speed_v", "wind_v", "windComponentV", "v_wind", "speed_y"],
    ),
];

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "time", "observed_at", "datetime"];
const ID_KEYS: &[&str] = &["id", "observation_id"];
const MISSION_KEYS: &[&str] = &["mission_id", "missionId", "mission", "flight_id"];

/// Aggregate speed fields. Never used as a value, only to spot records that
/// report speed without components.
const WIND_SPEED_KEYS: &[&str] = &["wind_speed", "windSpeed", "speed"];

/// Convert one raw record into the canonical shape. Total over any input.
pub fn normalize(raw: &RawRecord) -> Observation {
    let instant = resolve_instant(raw).unwrap_or_else(unix_epoch);
    let has_timestamp = TIMESTAMP_KEYS.iter().any(|key| present(raw.get(*key)));
    let id = first_text(raw, ID_KEYS)
        .or_else(|| has_timestamp.then(|| render_timestamp(instant)))
        .unwrap_or_else(random_id);
    let mission_id =
        first_text(raw, MISSION_KEYS).unwrap_or_else(|| UNKNOWN_MISSION.to_string());

    Observation::new(
        id,
        mission_id,
        instant,
        coalesce(raw, Quantity::Altitude),
        coalesce(raw, Quantity::Temperature),
        coalesce(raw, Quantity::Humidity),
        coalesce(raw, Quantity::WindU),
        coalesce(raw, Quantity::WindV),
    )
}

/// True when the record carries an aggregate wind speed but no usable
/// component, so the normalized speed collapses to zero.
pub fn reports_speed_without_components(raw: &RawRecord) -> bool {
    let has_speed = WIND_SPEED_KEYS
        .iter()
        .any(|key| raw.get(*key).and_then(finite_number).is_some());
    let has_component = [Quantity::WindU, Quantity::WindV]
        .into_iter()
        .flat_map(aliases)
        .any(|key| raw.get(*key).and_then(finite_number).is_some());
    has_speed && !has_component
}

fn aliases(quantity: Quantity) -> &'static [&'static str] {
    NUMERIC_ALIASES
        .iter()
        .find(|(q, _)| *q == quantity)
        .map(|(_, keys)| *keys)
        .unwrap_or(&[])
}

fn coalesce(raw: &RawRecord, quantity: Quantity) -> f64 {
    aliases(quantity)
        .iter()
        .find_map(|key| raw.get(*key).and_then(finite_number))
        .unwrap_or(0.0)
}

fn finite_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

fn present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn first_text(raw: &RawRecord, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match raw.get(*key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn resolve_instant(raw: &RawRecord) -> Option<DateTime<Utc>> {
    TIMESTAMP_KEYS.iter().find_map(|key| match raw.get(*key)? {
        Value::Number(n) => n.as_f64().and_then(instant_from_epoch),
        Value::String(s) => parse_time_text(s.trim()),
        _ => None,
    })
}

/// Seconds below [`EPOCH_MILLIS_THRESHOLD`], milliseconds above it.
pub fn instant_from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let millis = if value.abs() < EPOCH_MILLIS_THRESHOLD {
        value * 1000.0
    } else {
        value
    };
    DateTime::from_timestamp_millis(millis.round() as i64)
}

fn parse_time_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(numeric) = text.parse::<f64>() {
        return instant_from_epoch(numeric);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(std::time::UNIX_EPOCH)
}

fn random_id() -> String {
    format!("obs-{:016x}", rand::random::<u64>())
}
