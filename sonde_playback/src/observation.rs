use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// One normalized telemetry sample.
///
/// Fields are private so the ISO `timestamp` can never drift from `instant`,
/// and wind speed is always derived from the vector components.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    id: String,
    mission_id: String,
    timestamp: String,
    instant: DateTime<Utc>,
    altitude: f64,
    temperature: f64,
    humidity: f64,
    wind_u: f64,
    wind_v: f64,
}

impl Observation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        mission_id: impl Into<String>,
        instant: DateTime<Utc>,
        altitude: f64,
        temperature: f64,
        humidity: f64,
        wind_u: f64,
        wind_v: f64,
    ) -> Self {
        Self {
            id: id.into(),
            mission_id: mission_id.into(),
            timestamp: render_timestamp(instant),
            instant,
            altitude,
            temperature,
            humidity,
            wind_u,
            wind_v,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    /// ISO-8601 rendering of [`Observation::instant`].
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.instant
    }

    pub fn instant_ms(&self) -> i64 {
        self.instant.timestamp_millis()
    }

    /// Meters.
    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    /// Degrees Celsius.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Relative humidity, percent.
    pub fn humidity(&self) -> f64 {
        self.humidity
    }

    /// East-west wind component, m/s.
    pub fn wind_u(&self) -> f64 {
        self.wind_u
    }

    /// North-south wind component, m/s.
    pub fn wind_v(&self) -> f64 {
        self.wind_v
    }

    pub fn wind_speed(&self) -> f64 {
        self.wind_u.hypot(self.wind_v)
    }

    /// Identity used when merging: the id, or the timestamp when the id is blank.
    pub fn merge_key(&self) -> &str {
        if self.id.is_empty() {
            &self.timestamp
        } else {
            &self.id
        }
    }
}

pub(crate) fn render_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Serialize for Observation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Observation", 9)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("mission_id", &self.mission_id)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("altitude", &self.altitude)?;
        state.serialize_field("temperature", &self.temperature)?;
        state.serialize_field("humidity", &self.humidity)?;
        state.serialize_field("wind_u", &self.wind_u)?;
        state.serialize_field("wind_v", &self.wind_v)?;
        state.serialize_field("wind_speed", &self.wind_speed())?;
        state.end()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SeriesSummary {
    pub count: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub altitude_range_m: (f64, f64),
    pub temperature_range_c: (f64, f64),
    pub peak_wind_speed_mps: f64,
}

impl SeriesSummary {
    /// Summarize an ordered slice. `None` when the slice is empty.
    pub fn from_slice(series: &[Observation]) -> Option<Self> {
        let first = series.first()?;
        let last = series.last()?;
        let mut altitude = (f64::INFINITY, f64::NEG_INFINITY);
        let mut temperature = (f64::INFINITY, f64::NEG_INFINITY);
        let mut peak_wind = 0.0_f64;
        for obs in series {
            altitude = (altitude.0.min(obs.altitude), altitude.1.max(obs.altitude));
            temperature = (
                temperature.0.min(obs.temperature),
                temperature.1.max(obs.temperature),
            );
            peak_wind = peak_wind.max(obs.wind_speed());
        }
        Some(Self {
            count: series.len(),
            first: first.instant,
            last: last.instant,
            altitude_range_m: altitude,
            temperature_range_c: temperature,
            peak_wind_speed_mps: peak_wind,
        })
    }

    pub fn span_seconds(&self) -> f64 {
        (self.last - self.first).num_milliseconds() as f64 / 1000.0
    }
}
