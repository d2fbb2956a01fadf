//! Stream cursor and merge engine.
//!
//! Owns the resident series and the upstream cursor. Every mutation of either
//! goes through this type, so a reader that holds `&StreamEngine` always sees a
//! sorted, deduplicated series.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::normalize::{normalize, reports_speed_without_components};
use crate::observation::Observation;
use crate::source::{FetchPage, FetchQuery, ObservationSource};
use crate::synthetic;
use crate::StreamError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

/// Issued by [`StreamEngine::begin_poll`]; hand it back with the fetch result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollTicket {
    pub query: FetchQuery,
    epoch: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    /// A fetch was already in flight, or polling is halted.
    Skipped,
    /// The result belonged to a query issued before the last reset.
    Discarded,
    Ingested { received: usize, added: usize },
    /// Live source failed with nothing resident; synthetic data took over.
    Degraded { generated: usize },
    /// Live source failed but earlier data is still displayed.
    Transient(String),
    Failed(String),
}

#[derive(Debug)]
pub struct StreamEngine {
    series: Vec<Observation>,
    cursor: i64,
    origin: DateTime<Utc>,
    mission_filter: Option<String>,
    batch_limit: usize,
    synthetic_count: usize,
    fallback_to_synthetic: bool,
    status: StreamStatus,
    error_message: Option<String>,
    last_updated: Option<DateTime<Utc>>,
    fetch_in_flight: bool,
    degraded: bool,
    halted: bool,
    epoch: u64,
    revision: u64,
}

impl StreamEngine {
    /// Cursor origin is `now - lookback_hours`.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_origin(config, lookback_origin(Utc::now(), config.lookback_hours))
    }

    pub fn with_origin(config: &EngineConfig, origin: DateTime<Utc>) -> Self {
        Self {
            series: Vec::new(),
            cursor: origin.timestamp().max(0),
            origin,
            mission_filter: config.mission_filter.clone(),
            batch_limit: config.effective_batch_limit(),
            synthetic_count: config.synthetic_count,
            fallback_to_synthetic: config.fallback_to_synthetic,
            status: StreamStatus::Idle,
            error_message: None,
            last_updated: None,
            fetch_in_flight: false,
            degraded: false,
            halted: false,
            epoch: 0,
            revision: 0,
        }
    }

    pub fn series(&self) -> &[Observation] {
        &self.series
    }

    /// Unix seconds; inclusive lower bound of the next request.
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    pub fn mission_filter(&self) -> Option<&str> {
        self.mission_filter.as_deref()
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn is_fetch_in_flight(&self) -> bool {
        self.fetch_in_flight
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Bumped whenever the series contents change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn query(&self) -> FetchQuery {
        FetchQuery {
            limit: self.batch_limit,
            since: self.cursor,
            mission_id: self.mission_filter.clone(),
        }
    }

    /// One bounded request from the current cursor. Advances the cursor on
    /// success and returns the normalized batch without ingesting it.
    pub fn fetch_next<S: ObservationSource + ?Sized>(
        &mut self,
        source: &S,
    ) -> Result<Vec<Observation>, StreamError> {
        let page = source.fetch(&self.query())?;
        Ok(self.accept_page(page))
    }

    fn accept_page(&mut self, page: FetchPage) -> Vec<Observation> {
        let records = page.records();
        let speed_only = records
            .iter()
            .filter(|raw| reports_speed_without_components(raw))
            .count();
        if speed_only > 0 {
            warn!(
                records = speed_only,
                "records report wind speed without components; speed normalized to zero"
            );
        }

        let batch: Vec<Observation> = records.iter().map(normalize).collect();
        let before = self.cursor;
        let candidate = match batch.iter().map(Observation::instant_ms).max() {
            Some(latest_ms) => Some(latest_ms.div_euclid(1000) + 1),
            None => page
                .next_since
                .filter(|hint| hint.is_finite())
                .map(|hint| hint.floor() as i64),
        };
        if let Some(next) = candidate {
            self.cursor = self.cursor.max(next);
        }
        debug!(
            received = batch.len(),
            cursor_before = before,
            cursor_after = self.cursor,
            "fetched batch"
        );
        batch
    }

    /// Merge by id (timestamp when the id is blank), overwriting duplicates,
    /// then stable-sort by instant. Returns how many keys were new.
    pub fn ingest(&mut self, batch: Vec<Observation>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        self.revision += 1;
        let mut positions: HashMap<String, usize> = self
            .series
            .iter()
            .enumerate()
            .map(|(idx, obs)| (obs.merge_key().to_string(), idx))
            .collect();
        let mut added = 0;
        for obs in batch {
            let key = obs.merge_key().to_string();
            match positions.get(&key) {
                Some(&idx) => self.series[idx] = obs,
                None => {
                    positions.insert(key, self.series.len());
                    self.series.push(obs);
                    added += 1;
                }
            }
        }
        self.series.sort_by_key(Observation::instant);
        added
    }

    /// Start a poll. `None` while another fetch is in flight, after a fatal
    /// configuration error, or once degraded mode is active.
    pub fn begin_poll(&mut self) -> Option<PollTicket> {
        if self.halted || self.degraded {
            return None;
        }
        if self.fetch_in_flight {
            debug!("poll skipped: fetch already in flight");
            return None;
        }
        self.fetch_in_flight = true;
        if self.series.is_empty() {
            self.status = StreamStatus::Loading;
        }
        Some(PollTicket {
            query: self.query(),
            epoch: self.epoch,
        })
    }

    /// Apply the result of the fetch started by `ticket`.
    pub fn complete_poll(
        &mut self,
        ticket: PollTicket,
        result: Result<FetchPage, StreamError>,
    ) -> PollOutcome {
        self.fetch_in_flight = false;
        if ticket.epoch != self.epoch {
            debug!("discarding fetch result issued before reset");
            return PollOutcome::Discarded;
        }

        match result {
            Ok(page) => {
                let batch = self.accept_page(page);
                let received = batch.len();
                let added = self.ingest(batch);
                self.status = StreamStatus::Ready;
                self.error_message = None;
                self.last_updated = Some(Utc::now());
                if added > 0 {
                    info!(received, added, total = self.series.len(), cursor = self.cursor, "ingested observations");
                }
                PollOutcome::Ingested { received, added }
            }
            Err(err) if err.is_fatal() => {
                warn!(error = %err, "polling halted");
                self.halted = true;
                self.status = StreamStatus::Error;
                self.error_message = Some(err.to_string());
                PollOutcome::Failed(err.to_string())
            }
            Err(err) if self.series.is_empty() => {
                if self.fallback_to_synthetic {
                    self.enter_degraded_mode(&err)
                } else {
                    warn!(error = %err, "initial fetch failed");
                    self.status = StreamStatus::Error;
                    self.error_message = Some(err.to_string());
                    PollOutcome::Failed(err.to_string())
                }
            }
            Err(err) => {
                warn!(error = %err, "refresh failed; keeping resident series");
                let message = format!("refresh failed: {err}");
                self.status = StreamStatus::Ready;
                self.error_message = Some(message.clone());
                PollOutcome::Transient(message)
            }
        }
    }

    /// Synchronous `begin_poll` + fetch + `complete_poll`.
    pub fn poll<S: ObservationSource + ?Sized>(&mut self, source: &S) -> PollOutcome {
        match self.begin_poll() {
            Some(ticket) => {
                let result = source.fetch(&ticket.query);
                self.complete_poll(ticket, result)
            }
            None => PollOutcome::Skipped,
        }
    }

    fn enter_degraded_mode(&mut self, err: &StreamError) -> PollOutcome {
        let generated = synthetic::generate(self.origin, self.synthetic_count);
        let count = generated.len();
        self.ingest(generated);
        self.degraded = true;
        self.status = StreamStatus::Ready;
        self.error_message = Some(format!("{err}; showing synthetic data"));
        self.last_updated = Some(Utc::now());
        warn!(error = %err, generated = count, "live source unavailable, switched to synthetic data");
        PollOutcome::Degraded { generated: count }
    }

    /// Clear the series and rewind the cursor to the lookback origin.
    ///
    /// A fetch still in flight keeps the in-flight flag set, but its result
    /// is discarded when it lands.
    pub fn reset(&mut self) {
        info!(
            origin = %self.origin,
            mission = self.mission_filter.as_deref().unwrap_or("*"),
            "resetting stream"
        );
        self.series.clear();
        self.cursor = self.origin.timestamp().max(0);
        self.status = StreamStatus::Idle;
        self.error_message = None;
        self.last_updated = None;
        self.degraded = false;
        self.epoch += 1;
        self.revision += 1;
    }

    /// Resets when the filter actually changes. Returns whether it did.
    pub fn set_mission_filter(&mut self, mission: Option<String>) -> bool {
        let mission = mission.filter(|m| !m.trim().is_empty());
        if mission == self.mission_filter {
            return false;
        }
        self.mission_filter = mission;
        self.reset();
        true
    }

    /// Resets when the origin actually changes. Returns whether it did.
    pub fn set_origin(&mut self, origin: DateTime<Utc>) -> bool {
        if origin == self.origin {
            return false;
        }
        self.origin = origin;
        self.reset();
        true
    }

    pub fn set_lookback_hours(&mut self, hours: f64) -> bool {
        self.set_origin(lookback_origin(Utc::now(), hours))
    }
}

/// `now - hours`, saturating at the Unix epoch.
pub fn lookback_origin(now: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
    let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
    let hours = if hours.is_finite() { hours.max(0.0) } else { 0.0 };
    let millis = (hours * 3_600_000.0).round();
    if millis >= i64::MAX as f64 {
        return epoch;
    }
    Duration::try_milliseconds(millis as i64)
        .and_then(|back| now.checked_sub_signed(back))
        .map_or(epoch, |origin| origin.max(epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::source::RawRecord;

    struct Scripted {
        replies: Mutex<VecDeque<Result<FetchPage, StreamError>>>,
        queries: Mutex<Vec<FetchQuery>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<FetchPage, StreamError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    impl ObservationSource for Scripted {
        fn fetch(&self, query: &FetchQuery) -> Result<FetchPage, StreamError> {
            self.queries.lock().unwrap().push(query.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FetchPage::default()))
        }
    }

    fn raw(id: &str, secs: i64) -> RawRecord {
        match json!({ "id": id, "timestamp": secs, "altitude": secs as f64 }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn obs(id: &str, secs: i64) -> Observation {
        normalize(&raw(id, secs))
    }

    fn unavailable() -> StreamError {
        StreamError::SourceUnavailable("connection refused".into())
    }

    fn origin() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn engine() -> StreamEngine {
        StreamEngine::with_origin(&EngineConfig::default(), origin())
    }

    #[test]
    fn cursor_moves_one_second_past_latest_instant() {
        let mut engine = engine();
        let page = FetchPage::new(vec![raw("a", 1_700_000_100), raw("b", 1_700_000_050)], None);
        let source = Scripted::new(vec![Ok(page)]);
        let batch = engine.fetch_next(&source).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(engine.cursor(), 1_700_000_101);
        assert!(engine.series().is_empty(), "fetch_next must not ingest");
    }

    #[test]
    fn cursor_adopts_hint_only_for_empty_pages() {
        let mut engine = engine();
        let source = Scripted::new(vec![
            Ok(FetchPage::new(Vec::new(), Some(1_700_000_500.0))),
            Ok(FetchPage::default()),
            Ok(FetchPage::new(Vec::new(), Some(1_600_000_000.0))),
        ]);
        engine.fetch_next(&source).unwrap();
        assert_eq!(engine.cursor(), 1_700_000_500);
        engine.fetch_next(&source).unwrap();
        assert_eq!(engine.cursor(), 1_700_000_500);
        engine.fetch_next(&source).unwrap();
        assert_eq!(engine.cursor(), 1_700_000_500, "cursor never moves backwards");
    }

    #[test]
    fn batch_limit_is_capped_in_queries() {
        let config = EngineConfig {
            batch_limit: 5_000,
            mission_filter: Some("W-1".into()),
            ..EngineConfig::default()
        };
        let engine = StreamEngine::with_origin(&config, origin());
        let query = engine.query();
        assert_eq!(query.limit, 500);
        assert_eq!(query.since, 1_700_000_000);
        assert_eq!(query.mission_id.as_deref(), Some("W-1"));
    }

    #[test]
    fn ingest_is_idempotent_and_sorted() {
        let mut engine = engine();
        let batch = vec![obs("c", 30), obs("a", 10), obs("b", 20)];
        assert_eq!(engine.ingest(batch.clone()), 3);
        let once = engine.series().to_vec();
        assert_eq!(engine.ingest(batch), 0);
        assert_eq!(engine.series(), once.as_slice());
        let ids: Vec<_> = once.iter().map(Observation::id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn ingest_overwrites_duplicates_and_resorts() {
        let mut engine = engine();
        engine.ingest(vec![obs("a", 10), obs("b", 20)]);
        engine.ingest(vec![obs("a", 30)]);
        let ids: Vec<_> = engine.series().iter().map(Observation::id).collect();
        assert_eq!(ids, ["b", "a"]);
        assert_eq!(engine.series().len(), 2);
    }

    #[test]
    fn degraded_mode_when_empty() {
        let mut engine = engine();
        let source = Scripted::new(vec![Err(unavailable())]);
        let outcome = engine.poll(&source);
        assert!(matches!(outcome, PollOutcome::Degraded { generated: 240 }));
        assert_eq!(engine.status(), StreamStatus::Ready);
        assert!(engine.error_message().is_some());
        assert!(engine.is_degraded());
        assert_eq!(engine.series().len(), 240);

        assert_eq!(engine.poll(&source), PollOutcome::Skipped);
        assert_eq!(source.queries.lock().unwrap().len(), 1);
    }

    #[test]
    fn transient_error_keeps_series() {
        let mut engine = engine();
        engine.ingest(vec![obs("a", 1_700_000_010)]);
        let before = engine.series().to_vec();
        let source = Scripted::new(vec![Err(unavailable())]);
        assert!(matches!(engine.poll(&source), PollOutcome::Transient(_)));
        assert_eq!(engine.series(), before.as_slice());
        assert_eq!(engine.status(), StreamStatus::Ready);
        assert!(engine.error_message().unwrap().contains("refresh failed"));
        assert!(!engine.is_degraded());
    }

    #[test]
    fn error_state_without_fallback() {
        let config = EngineConfig {
            fallback_to_synthetic: false,
            ..EngineConfig::default()
        };
        let mut engine = StreamEngine::with_origin(&config, origin());
        let source = Scripted::new(vec![Err(unavailable()), Ok(FetchPage::new(vec![raw("a", 1_700_000_001)], None))]);
        assert!(matches!(engine.poll(&source), PollOutcome::Failed(_)));
        assert_eq!(engine.status(), StreamStatus::Error);
        assert!(matches!(engine.poll(&source), PollOutcome::Ingested { received: 1, added: 1 }));
        assert_eq!(engine.status(), StreamStatus::Ready);
        assert!(engine.error_message().is_none());
    }

    #[test]
    fn configuration_error_halts_polling() {
        let mut engine = engine();
        let source = Scripted::new(vec![Err(StreamError::Configuration("no key".into()))]);
        assert!(matches!(engine.poll(&source), PollOutcome::Failed(_)));
        assert_eq!(engine.status(), StreamStatus::Error);
        assert!(engine.series().is_empty());
        assert_eq!(engine.poll(&source), PollOutcome::Skipped);
    }

    #[test]
    fn one_fetch_in_flight_at_a_time() {
        let mut engine = engine();
        let ticket = engine.begin_poll().unwrap();
        assert_eq!(engine.status(), StreamStatus::Loading);
        assert!(engine.begin_poll().is_none());
        let outcome = engine.complete_poll(ticket, Ok(FetchPage::default()));
        assert_eq!(outcome, PollOutcome::Ingested { received: 0, added: 0 });
        assert!(engine.begin_poll().is_some());
    }

    #[test]
    fn results_from_before_reset_are_discarded() {
        let mut engine = engine();
        let ticket = engine.begin_poll().unwrap();
        assert!(engine.set_mission_filter(Some("W-2".into())));
        let page = FetchPage::new(vec![raw("stale", 1_700_000_005)], None);
        assert_eq!(engine.complete_poll(ticket, Ok(page)), PollOutcome::Discarded);
        assert!(engine.series().is_empty());
        assert_eq!(engine.cursor(), 1_700_000_000);
        assert!(!engine.is_fetch_in_flight());
    }

    #[test]
    fn reset_rewinds_cursor_and_clears_degraded_mode() {
        let mut engine = engine();
        let source = Scripted::new(vec![Err(unavailable())]);
        engine.poll(&source);
        assert!(engine.is_degraded());

        assert!(!engine.set_mission_filter(None));
        let new_origin = origin() + Duration::hours(1);
        assert!(engine.set_origin(new_origin));
        assert!(engine.series().is_empty());
        assert!(!engine.is_degraded());
        assert_eq!(engine.status(), StreamStatus::Idle);
        assert_eq!(engine.cursor(), new_origin.timestamp());
    }

    #[test]
    fn lookback_origin_subtracts_hours() {
        let now = origin();
        assert_eq!(lookback_origin(now, 2.5), now - Duration::minutes(150));
        assert_eq!(lookback_origin(now, -1.0), now);
        let epoch = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        assert_eq!(lookback_origin(now, 1e13), epoch);
        assert_eq!(lookback_origin(now, 1e9), epoch);
        assert_eq!(lookback_origin(now, f64::MAX), epoch);
    }
}
