use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::frame::Frame;
use crate::pipeline_state::PipelineState;
use crate::rate_limit::{RateLimiter, RetryPolicy};
use crate::source::RemoteSource;

pub const MATCH_DATE_COLUMN: &str = "DateLocal";
pub const TOURNAMENT_DATE_COLUMNS: &[&str] = &["EndDate", "StartDate"];

/// Trailing span of days, ending today, that freshly extracted rows are
/// kept for.
#[derive(Debug, Clone, Copy)]
pub struct RollingWindow {
    pub days: u32,
    pub today: NaiveDate,
}

impl RollingWindow {
    pub fn new(days: u32, today: NaiveDate) -> Self {
        Self { days, today }
    }

    pub fn cutoff(&self) -> NaiveDate {
        self.today - ChronoDuration::days(i64::from(self.days))
    }
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub frame: Frame,
    /// Ids that returned data, in fetch order.
    pub succeeded: Vec<i64>,
    pub failed: Vec<i64>,
    pub empty: Vec<i64>,
    pub skipped_already_fetched: usize,
}

pub struct Extractor<S> {
    source: S,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl<S: RemoteSource> Extractor<S> {
    pub fn new(source: S, limiter: RateLimiter, policy: RetryPolicy) -> Self {
        Self {
            source,
            limiter,
            policy,
        }
    }

    pub fn from_settings(source: S, settings: &Settings) -> Self {
        Self::new(
            source,
            RateLimiter::new(settings.min_interval()),
            settings.retry_policy(),
        )
    }

    pub fn extract_tournaments(&mut self, window: RollingWindow) -> Result<Frame> {
        let records = self
            .limited("tournaments", |s| s.tournaments())
            .context("extract tournaments")?;
        let frame = Frame::from_json_records(&records);
        let date_column = TOURNAMENT_DATE_COLUMNS
            .iter()
            .copied()
            .find(|c| frame.has_column(c))
            .unwrap_or(TOURNAMENT_DATE_COLUMNS[0]);
        let filtered = filter_rolling_window(&frame, date_column, window);
        info!(
            fetched = frame.len(),
            kept = filtered.len(),
            cutoff = %window.cutoff(),
            "extracted tournaments"
        );
        Ok(filtered)
    }

    pub fn extract_matches(&mut self, window: RollingWindow) -> Result<Frame> {
        let records = self
            .limited("matches", |s| s.matches())
            .context("extract matches")?;
        let frame = Frame::from_json_records(&records);
        let filtered = filter_rolling_window(&frame, MATCH_DATE_COLUMN, window);
        info!(
            fetched = frame.len(),
            kept = filtered.len(),
            cutoff = %window.cutoff(),
            "extracted matches"
        );
        Ok(filtered)
    }

    /// Fetches details for matches not yet recorded in `state`. Rows carry
    /// `NoMatch`, filled from the match number when absent. `No` is filled
    /// only for a single-row payload; a multi-row payload without its own
    /// `No` on every row counts as a failed item.
    pub fn extract_match_details_batch(
        &mut self,
        match_nos: &[i64],
        state: &PipelineState,
    ) -> BatchOutcome {
        self.extract_batch(
            "match_detail",
            match_nos,
            &state.fetched_match_nos,
            BatchTags {
                always: &["NoMatch"],
                row_key: Some("No"),
            },
            |s, no| s.match_detail(no),
        )
    }

    /// Fetches rankings for tournaments not yet recorded in `state`. Rows
    /// carry `NoTournament`.
    pub fn extract_tournament_rankings_batch(
        &mut self,
        tournament_nos: &[i64],
        state: &PipelineState,
    ) -> BatchOutcome {
        self.extract_batch(
            "tournament_ranking",
            tournament_nos,
            &state.fetched_tournament_nos,
            BatchTags {
                always: &["NoTournament"],
                row_key: None,
            },
            |s, no| s.tournament_ranking(no),
        )
    }

    fn limited(
        &mut self,
        what: &'static str,
        call: impl Fn(&S) -> Result<Vec<JsonValue>>,
    ) -> Result<Vec<JsonValue>> {
        let source = &self.source;
        let mut log_failure = |err: &anyhow::Error, attempt: u32| {
            debug!(what, attempt, error = %format!("{err:#}"), "remote attempt failed");
        };
        self.limiter
            .execute(&self.policy, || call(source), Some(&mut log_failure))
    }

    fn extract_batch(
        &mut self,
        kind: &'static str,
        requested: &[i64],
        already_fetched: &BTreeSet<i64>,
        tags: BatchTags,
        fetch: impl Fn(&S, i64) -> Result<Vec<JsonValue>>,
    ) -> BatchOutcome {
        let wanted = requested.iter().copied().collect::<BTreeSet<_>>();
        let to_fetch = wanted
            .difference(already_fetched)
            .copied()
            .collect::<Vec<_>>();
        let mut outcome = BatchOutcome {
            skipped_already_fetched: wanted.len() - to_fetch.len(),
            ..BatchOutcome::default()
        };
        info!(
            kind,
            requested = wanted.len(),
            to_fetch = to_fetch.len(),
            skipped = outcome.skipped_already_fetched,
            "starting batch extraction"
        );

        let mut records = Vec::new();
        for id in to_fetch {
            match self.limited(kind, |s| fetch(s, id)) {
                Ok(items) if items.is_empty() => {
                    debug!(kind, id, "no data returned");
                    outcome.empty.push(id);
                }
                Ok(items) => match tags.apply(id, items) {
                    Ok(tagged) => {
                        records.extend(tagged);
                        outcome.succeeded.push(id);
                    }
                    Err(err) => {
                        warn!(kind, id, error = %format!("{err:#}"), "item payload rejected, skipping");
                        outcome.failed.push(id);
                    }
                },
                Err(err) => {
                    warn!(kind, id, error = %format!("{err:#}"), "item extraction failed, skipping");
                    outcome.failed.push(id);
                }
            }
        }

        outcome.frame = Frame::from_json_records(&records);
        info!(
            kind,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            empty = outcome.empty.len(),
            rows = outcome.frame.len(),
            "batch extraction finished"
        );
        outcome
    }
}

/// Columns stamped with the requested id on every fetched row.
#[derive(Debug, Clone, Copy)]
struct BatchTags {
    /// Filled on every row that lacks them.
    always: &'static [&'static str],
    /// Per-row key: filled from the id only when the payload is one row.
    row_key: Option<&'static str>,
}

impl BatchTags {
    fn apply(&self, id: i64, mut items: Vec<JsonValue>) -> Result<Vec<JsonValue>> {
        let rows = items.len();
        for item in &mut items {
            let Some(obj) = item.as_object_mut() else {
                continue;
            };
            for col in self.always {
                obj.entry(col.to_string())
                    .or_insert_with(|| JsonValue::from(id));
            }
            if let Some(key) = self.row_key {
                let present = obj.get(key).is_some_and(|v| !v.is_null());
                if rows == 1 && !present {
                    obj.insert(key.to_string(), JsonValue::from(id));
                } else if !present {
                    bail!("{rows} rows returned without `{key}`");
                }
            }
        }
        Ok(items)
    }
}

/// Drops rows dated before the window's cutoff, and rows whose date is
/// missing or unparsable. A frame without `date_column` is returned as is.
pub fn filter_rolling_window(frame: &Frame, date_column: &str, window: RollingWindow) -> Frame {
    if frame.is_empty() {
        return frame.clone();
    }
    let Some(idx) = frame.column_index(date_column) else {
        warn!(date_column, "date column missing, rolling window not applied");
        return frame.clone();
    };
    let cutoff = window.cutoff();
    frame.filter(|row| row[idx].as_date().is_some_and(|d| d >= cutoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct DetailSource;

    impl RemoteSource for DetailSource {
        fn tournaments(&self) -> Result<Vec<JsonValue>> {
            Ok(Vec::new())
        }

        fn matches(&self) -> Result<Vec<JsonValue>> {
            Ok(Vec::new())
        }

        fn match_detail(&self, match_no: i64) -> Result<Vec<JsonValue>> {
            Ok(match match_no {
                1 => vec![json!({"Court": "1"})],
                2 => vec![json!({"Set": 1}), json!({"Set": 2})],
                3 => vec![json!({"No": 31, "Set": 1}), json!({"No": 32, "Set": 2})],
                _ => Vec::new(),
            })
        }

        fn tournament_ranking(&self, _tournament_no: i64) -> Result<Vec<JsonValue>> {
            Ok(vec![json!({"Rank": 1}), json!({"Rank": 2})])
        }
    }

    fn extractor() -> Extractor<DetailSource> {
        let policy = RetryPolicy {
            max_retries: 1,
            backoff_base: 2.0,
            backoff_unit: Duration::from_millis(1),
        };
        Extractor::new(DetailSource, RateLimiter::new(Duration::ZERO), policy)
    }

    #[test]
    fn rolling_window_keeps_recent_rows() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let days_ago = |n: i64| (today - ChronoDuration::days(n)).format("%Y-%m-%d").to_string();
        let frame = Frame::from_json_records(&[
            json!({"No": 1, "DateLocal": days_ago(400)}),
            json!({"No": 2, "DateLocal": days_ago(200)}),
            json!({"No": 3, "DateLocal": days_ago(10)}),
        ]);
        let kept = filter_rolling_window(&frame, "DateLocal", RollingWindow::new(365, today));
        assert_eq!(kept.distinct_i64("No"), vec![2, 3]);
    }

    #[test]
    fn rolling_window_on_empty_frame_is_empty() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let kept = filter_rolling_window(&Frame::default(), "DateLocal", RollingWindow::new(30, today));
        assert!(kept.is_empty());
    }

    #[test]
    fn rows_without_dates_are_dropped() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let frame = Frame::from_json_records(&[
            json!({"No": 1, "DateLocal": null}),
            json!({"No": 2, "DateLocal": "not a date"}),
            json!({"No": 3, "DateLocal": "2026-05-30"}),
        ]);
        let kept = filter_rolling_window(&frame, "DateLocal", RollingWindow::new(30, today));
        assert_eq!(kept.distinct_i64("No"), vec![3]);
    }

    #[test]
    fn single_row_detail_is_keyed_by_match_number() {
        let outcome = extractor().extract_match_details_batch(&[1], &PipelineState::default());
        assert_eq!(outcome.succeeded, vec![1]);
        assert_eq!(outcome.frame.distinct_i64("No"), vec![1]);
        assert_eq!(outcome.frame.distinct_i64("NoMatch"), vec![1]);
    }

    #[test]
    fn multi_row_detail_without_row_keys_fails_the_item() {
        let outcome =
            extractor().extract_match_details_batch(&[2, 3, 4], &PipelineState::default());
        assert_eq!(outcome.succeeded, vec![3]);
        assert_eq!(outcome.failed, vec![2]);
        assert_eq!(outcome.empty, vec![4]);
        assert_eq!(outcome.frame.distinct_i64("No"), vec![31, 32]);
        assert_eq!(outcome.frame.distinct_i64("NoMatch"), vec![3]);
    }

    #[test]
    fn ranking_rows_all_carry_the_tournament() {
        let outcome =
            extractor().extract_tournament_rankings_batch(&[7], &PipelineState::default());
        assert_eq!(outcome.succeeded, vec![7]);
        assert_eq!(outcome.frame.len(), 2);
        assert_eq!(outcome.frame.distinct_i64("NoTournament"), vec![7]);
    }
}
