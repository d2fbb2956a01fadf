//! Upstream fetch primitive.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{Credentials, EngineConfig};
use crate::StreamError;

/// One record as delivered upstream, before normalization.
pub type RawRecord = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchQuery {
    pub limit: usize,
    /// Inclusive lower bound, Unix seconds.
    pub since: i64,
    pub mission_id: Option<String>,
}

impl FetchQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("limit", self.limit.to_string()),
            ("since", self.since.max(0).to_string()),
            ("include_ids", "true".to_string()),
        ];
        if let Some(mission) = self.mission_id.as_ref() {
            pairs.push(("mission_id", mission.clone()));
        }
        pairs
    }
}

/// Response body. Both fields may be absent or null.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FetchPage {
    #[serde(default)]
    pub observations: Option<Vec<RawRecord>>,
    #[serde(default)]
    pub next_since: Option<f64>,
}

impl FetchPage {
    pub fn new(observations: Vec<RawRecord>, next_since: Option<f64>) -> Self {
        Self {
            observations: Some(observations),
            next_since,
        }
    }

    pub fn records(&self) -> &[RawRecord] {
        self.observations.as_deref().unwrap_or(&[])
    }
}

/// Anything that can answer a bounded "records since cursor" request.
///
/// Implementations block; async drivers run them on a blocking pool.
pub trait ObservationSource: Send + Sync {
    fn fetch(&self, query: &FetchQuery) -> Result<FetchPage, StreamError>;
}

impl<S: ObservationSource + ?Sized> ObservationSource for Arc<S> {
    fn fetch(&self, query: &FetchQuery) -> Result<FetchPage, StreamError> {
        (**self).fetch(query)
    }
}

impl<S: ObservationSource + ?Sized> ObservationSource for Box<S> {
    fn fetch(&self, query: &FetchQuery) -> Result<FetchPage, StreamError> {
        (**self).fetch(query)
    }
}

pub struct HttpSource {
    agent: ureq::Agent,
    url: String,
    authorization: String,
}

impl HttpSource {
    /// Fails with [`StreamError::Configuration`] before any request when
    /// credentials are missing or blank.
    pub fn new(
        url: impl Into<String>,
        credentials: Option<&Credentials>,
        timeout: Duration,
    ) -> Result<Self, StreamError> {
        let credentials = credentials.filter(|c| !c.is_blank()).ok_or_else(|| {
            StreamError::Configuration(
                "client id and API key are required to query the observation source".into(),
            )
        })?;
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            url: url.into(),
            authorization: basic_authorization(credentials),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, StreamError> {
        Self::new(
            config.source_url.clone(),
            config.credentials.as_ref(),
            config.request_timeout(),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ObservationSource for HttpSource {
    fn fetch(&self, query: &FetchQuery) -> Result<FetchPage, StreamError> {
        let mut request = self
            .agent
            .get(&self.url)
            .set("Authorization", &self.authorization)
            .set("Accept", "application/json");
        for (key, value) in query.query_pairs() {
            request = request.query(key, &value);
        }
        debug!(url = %self.url, since = query.since, limit = query.limit, "requesting observations");

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(code, _) => {
                StreamError::SourceUnavailable(format!("upstream returned HTTP {code}"))
            }
            ureq::Error::Transport(transport) => {
                StreamError::SourceUnavailable(format!("transport error: {transport}"))
            }
        })?;
        decode_page(response.into_reader())
    }
}

pub fn decode_page<R: std::io::Read>(reader: R) -> Result<FetchPage, StreamError> {
    serde_json::from_reader(reader)
        .map_err(|e| StreamError::SourceUnavailable(format!("malformed response body: {e}")))
}

fn basic_authorization(credentials: &Credentials) -> String {
    let pair = format!("{}:{}", credentials.client_id, credentials.api_key);
    format!("Basic {}", STANDARD.encode(pair))
}
