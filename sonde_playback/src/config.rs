use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::StreamError;

/// Hard ceiling on records per request, whatever the caller asks for.
pub const MAX_BATCH_LIMIT: usize = 500;

/// Ten years.
pub const MAX_LOOKBACK_HOURS: f64 = 87_600.0;

pub const CLIENT_ID_ENV: &str = "SONDE_CLIENT_ID";
pub const API_KEY_ENV: &str = "SONDE_API_KEY";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub source_url: String,
    pub batch_limit: usize,
    pub mission_filter: Option<String>,
    pub lookback_hours: f64,
    pub poll_interval_idle_ms: u64,
    pub poll_interval_playing_ms: u64,
    pub request_timeout_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub min_speed: f64,
    pub synthetic_count: usize,
    pub fallback_to_synthetic: bool,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_url: "http://127.0.0.1:8080/api/observations".to_string(),
            batch_limit: MAX_BATCH_LIMIT,
            mission_filter: None,
            lookback_hours: 24.0,
            poll_interval_idle_ms: 60_000,
            poll_interval_playing_ms: 15_000,
            request_timeout_ms: 10_000,
            min_delay_ms: 400,
            max_delay_ms: 10_000,
            min_speed: 0.25,
            synthetic_count: 240,
            fallback_to_synthetic: true,
            credentials: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.poll_interval_idle_ms == 0 || self.poll_interval_playing_ms == 0 {
            return Err(StreamError::InvalidParameter(
                "poll intervals must be positive".into(),
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(StreamError::InvalidParameter(format!(
                "min_delay_ms ({}) exceeds max_delay_ms ({})",
                self.min_delay_ms, self.max_delay_ms
            )));
        }
        if !(self.min_speed.is_finite() && self.min_speed > 0.0) {
            return Err(StreamError::InvalidParameter(format!(
                "min_speed must be positive, got {}",
                self.min_speed
            )));
        }
        if !(self.lookback_hours.is_finite()
            && (0.0..=MAX_LOOKBACK_HOURS).contains(&self.lookback_hours))
        {
            return Err(StreamError::InvalidParameter(format!(
                "lookback_hours must be within 0..={MAX_LOOKBACK_HOURS}, got {}",
                self.lookback_hours
            )));
        }
        if self.synthetic_count == 0 {
            return Err(StreamError::InvalidParameter(
                "synthetic_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Requested batch size clamped into `1..=MAX_BATCH_LIMIT`.
    pub fn effective_batch_limit(&self) -> usize {
        self.batch_limit.clamp(1, MAX_BATCH_LIMIT)
    }

    pub fn poll_interval(&self, playing: bool) -> Duration {
        if playing {
            Duration::from_millis(self.poll_interval_playing_ms)
        } else {
            Duration::from_millis(self.poll_interval_idle_ms)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Client id / API key pair sent as HTTP Basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub api_key: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: api_key.into(),
        }
    }

    /// Reads `SONDE_CLIENT_ID` and `SONDE_API_KEY`; `None` if either is unset.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var(CLIENT_ID_ENV).ok()?;
        let api_key = std::env::var(API_KEY_ENV).ok()?;
        Some(Self::new(client_id, api_key))
    }

    pub fn is_blank(&self) -> bool {
        self.client_id.trim().is_empty() || self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_delay(), Duration::from_millis(400));
        assert_eq!(config.max_delay(), Duration::from_secs(10));
        assert!(config.poll_interval(true) < config.poll_interval(false));
    }

    #[test]
    fn batch_limit_is_capped() {
        let config = EngineConfig {
            batch_limit: 10_000,
            ..EngineConfig::default()
        };
        assert_eq!(config.effective_batch_limit(), MAX_BATCH_LIMIT);
        let zero = EngineConfig {
            batch_limit: 0,
            ..EngineConfig::default()
        };
        assert_eq!(zero.effective_batch_limit(), 1);
    }

    #[test]
    fn rejects_inverted_delay_window() {
        let config = EngineConfig {
            min_delay_ms: 5_000,
            max_delay_ms: 100,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StreamError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_lookback() {
        for hours in [-1.0, 1e13, f64::NAN] {
            let config = EngineConfig {
                lookback_hours: hours,
                ..EngineConfig::default()
            };
            assert!(
                matches!(config.validate(), Err(StreamError::InvalidParameter(_))),
                "{hours} accepted"
            );
        }
        let decade = EngineConfig {
            lookback_hours: MAX_LOOKBACK_HOURS,
            ..EngineConfig::default()
        };
        assert!(decade.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "mission_filter": "W-12", "min_speed": 0.5 }"#).unwrap();
        assert_eq!(config.mission_filter.as_deref(), Some("W-12"));
        assert_eq!(config.min_speed, 0.5);
        assert_eq!(config.max_delay_ms, 10_000);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn debug_redacts_api_key() {
        let creds = Credentials::new("client", "secret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("client"));
        assert!(!rendered.contains("secret"));
    }
}
