//! Telemetry stream merging and variable-rate playback for balloon-borne sondes.
//!
//! Raw upstream records are normalized into [`Observation`]s, merged into a
//! time-ordered, deduplicated series by the [`StreamEngine`], and replayed by
//! the [`PlaybackScheduler`] at a pace derived from the real gaps between
//! samples. [`Session`] ties both together behind the control surface a
//! presentation layer drives, and [`driver::run`] schedules it on a
//! single-threaded tokio loop.

use thiserror::Error;

pub mod config;
pub mod driver;
pub mod normalize;
pub mod observation;
pub mod playback;
pub mod presentation;
pub mod session;
pub mod source;
pub mod stream;
pub mod synthetic;
pub mod window;

pub use config::{Credentials, EngineConfig};
pub use normalize::normalize;
pub use observation::{Observation, SeriesSummary};
pub use playback::{PendingAdvance, PlaybackScheduler};
pub use presentation::{map_observation, AudioParams, PresentationFrame, VisualParams};
pub use session::{Frame, Session, Snapshot};
pub use source::{FetchPage, FetchQuery, HttpSource, ObservationSource, RawRecord};
pub use stream::{PollOutcome, PollTicket, StreamEngine, StreamStatus};
pub use window::PlaybackWindow;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl StreamError {
    /// Configuration problems never clear up by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Configuration(_))
    }
}
