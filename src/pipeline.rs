use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::elo::{self, EloConfig, EloHistoryRecord, HISTORY_TABLE};
use crate::error::PipelineError;
use crate::extract::{BatchOutcome, Extractor, RollingWindow};
use crate::frame::Frame;
use crate::lake::Lake;
use crate::pipeline_state::PipelineState;
use crate::quality::{self, QualityReport};
use crate::source::RemoteSource;
use crate::upsets::{self, UPSETS_TABLE, UpsetRecord};
use crate::warehouse::{self, RunRecord};

pub const TOURNAMENTS: &str = "tournaments";
pub const MATCHES: &str = "matches";
pub const MATCH_DETAILS: &str = "match_details";
pub const TOURNAMENT_RANKINGS: &str = "tournament_rankings";

const PARTITION_COLUMN: &str = "NoTournament";

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub run_id: i64,
    pub window_days: u32,
    pub tournaments_extracted: usize,
    pub matches_extracted: usize,
    pub details_fetched: usize,
    pub details_failed: Vec<i64>,
    pub rankings_fetched: usize,
    pub rankings_failed: Vec<i64>,
    pub quality: QualityReport,
    pub matches_rated: usize,
    pub upsets: Vec<UpsetRecord>,
    pub final_ratings: Vec<(String, f64)>,
    pub views_applied: usize,
}

/// Rating outputs recomputed from whatever `stg_matches` currently holds.
#[derive(Debug, Clone, Default)]
pub struct RatingOutputs {
    pub history: Vec<EloHistoryRecord>,
    pub upsets: Vec<UpsetRecord>,
}

impl RatingOutputs {
    pub fn matches_rated(&self) -> usize {
        self.history.len() / 2
    }
}

/// Drives one end-to-end run: extract, land in the lake, stage, check,
/// rate, persist, and finally record the fetched ids.
pub struct Pipeline<S> {
    settings: Settings,
    extractor: Extractor<S>,
    lake: Lake,
    today: NaiveDate,
    backfill: bool,
}

impl<S: RemoteSource> Pipeline<S> {
    pub fn new(settings: Settings, source: S) -> Self {
        let extractor = Extractor::from_settings(source, &settings);
        Self::with_extractor(settings, extractor)
    }

    pub fn with_extractor(settings: Settings, extractor: Extractor<S>) -> Self {
        let lake = Lake::new(settings.storage.lake_root.clone());
        Self {
            settings,
            extractor,
            lake,
            today: Utc::now().date_naive(),
            backfill: false,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn with_backfill(mut self, backfill: bool) -> Self {
        self.backfill = backfill;
        self
    }

    /// Runs every step in order and records the outcome in `pipeline_runs`.
    /// The state file is only written once everything else has succeeded.
    pub fn run(&mut self) -> Result<RunSummary> {
        let mut conn = step("open_warehouse", || {
            warehouse::open_warehouse(&self.settings.storage.warehouse_path)
        })?;
        let run_id = step("begin_run", || warehouse::begin_run(&conn))?;
        info!(run_id, backfill = self.backfill, "pipeline run started");

        match self.run_steps(&mut conn, run_id) {
            Ok(summary) => {
                let record = RunRecord {
                    status: "succeeded".to_string(),
                    failed_step: None,
                    matches_rated: summary.matches_rated,
                    upsets_found: summary.upsets.len(),
                    errors: summary
                        .details_failed
                        .iter()
                        .map(|no| format!("match_detail {no}"))
                        .chain(
                            summary
                                .rankings_failed
                                .iter()
                                .map(|no| format!("tournament_ranking {no}")),
                        )
                        .collect(),
                };
                step("finish_run", || warehouse::finish_run(&conn, run_id, &record))?;
                info!(
                    run_id,
                    matches_rated = summary.matches_rated,
                    upsets = summary.upsets.len(),
                    "pipeline run succeeded"
                );
                Ok(summary)
            }
            Err(err) => {
                let failed_step = err
                    .downcast_ref::<PipelineError>()
                    .and_then(PipelineError::step_name)
                    .map(str::to_string);
                error!(run_id, step = ?failed_step, error = %format!("{err:#}"), "pipeline run failed");
                let record = RunRecord {
                    status: "failed".to_string(),
                    failed_step,
                    errors: vec![format!("{err:#}")],
                    ..RunRecord::default()
                };
                if let Err(ledger_err) = warehouse::finish_run(&conn, run_id, &record) {
                    warn!(run_id, error = %format!("{ledger_err:#}"), "could not record failed run");
                }
                Err(err)
            }
        }
    }

    fn run_steps(&mut self, conn: &mut Connection, run_id: i64) -> Result<RunSummary> {
        let window_days = self.settings.window_days(self.backfill);
        let window = RollingWindow::new(window_days, self.today);
        let state_path = self.settings.storage.state_path.clone();
        let lake = &self.lake;
        let extractor = &mut self.extractor;

        let state = step("load_state", || PipelineState::load(&state_path))?;

        let tournaments = step("extract_tournaments", || {
            let frame = extractor.extract_tournaments(window)?;
            lake.write(&frame, TOURNAMENTS, &[])?;
            Ok(frame)
        })?;

        let matches = step("extract_matches", || {
            let frame = extractor.extract_matches(window)?;
            lake.write(&frame, MATCHES, partition_for(&frame))?;
            Ok(frame)
        })?;

        let details = step("extract_match_details", || {
            let outcome = extractor.extract_match_details_batch(&matches.distinct_i64("No"), &state);
            merge_into_lake(lake, &outcome, MATCH_DETAILS, &["No"])?;
            Ok(outcome)
        })?;

        let rankings = step("extract_tournament_rankings", || {
            let outcome = extractor
                .extract_tournament_rankings_batch(&tournaments.distinct_i64("No"), &state);
            // A successful fetch carries the full ranking of a tournament.
            merge_into_lake(lake, &outcome, TOURNAMENT_RANKINGS, &[PARTITION_COLUMN])?;
            Ok(outcome)
        })?;

        step("stage", || stage_from_lake(lake, conn))?;

        let quality = step("quality_gate", || {
            quality::check(conn, &self.settings.quality_config())
        })?;

        let elo_config = self.settings.elo_config();
        let history = step("compute_ratings", || {
            let matches = elo::load_matches(conn)?;
            Ok(elo::compute_elo_history(&matches, &elo_config))
        })?;

        let upsets = step("detect_upsets", || Ok(upsets::detect_upsets(&history)))?;

        step("persist_ratings", || persist_ratings(conn, &history, &upsets))?;

        let views_applied = step("derived_views", || match &self.settings.pipeline.views_dir {
            Some(dir) => {
                let definitions = warehouse::load_view_definitions(dir)?;
                warehouse::execute_derived_views(conn, &definitions)
            }
            None => Ok(0),
        })?;

        step("save_state", || {
            let mut next = state.merge(
                details.succeeded.iter().copied(),
                rankings.succeeded.iter().copied(),
            );
            next.save(&state_path)
        })?;

        let final_ratings = elo::final_ratings(&history);
        for (rank, (team, rating)) in final_ratings.iter().take(10).enumerate() {
            info!(rank = rank + 1, team = %team, rating = %format!("{rating:.1}"), "final rating");
        }

        Ok(RunSummary {
            run_id,
            window_days,
            tournaments_extracted: tournaments.len(),
            matches_extracted: matches.len(),
            details_fetched: details.succeeded.len(),
            details_failed: details.failed,
            rankings_fetched: rankings.succeeded.len(),
            rankings_failed: rankings.failed,
            quality,
            matches_rated: history.len() / 2,
            upsets,
            final_ratings,
            views_applied,
        })
    }
}

/// Tags an error with the step it was raised in.
fn step<T>(name: &'static str, body: impl FnOnce() -> Result<T>) -> Result<T> {
    body().map_err(|cause| PipelineError::Step { step: name, cause }.into())
}

fn partition_for(frame: &Frame) -> &'static [&'static str] {
    if frame.has_column(PARTITION_COLUMN) {
        &[PARTITION_COLUMN]
    } else {
        &[]
    }
}

fn merge_into_lake(lake: &Lake, outcome: &BatchOutcome, entity: &str, key: &[&str]) -> Result<()> {
    if outcome.frame.is_empty() {
        info!(entity, "no new rows to merge into lake");
        return Ok(());
    }
    lake.merge_write(&outcome.frame, entity, key, partition_for(&outcome.frame))
        .with_context(|| format!("merge {entity} into lake"))?;
    Ok(())
}

/// Loads every lake entity into its staging table. Entities the lake has
/// never seen are left alone.
pub fn stage_from_lake(lake: &Lake, conn: &mut Connection) -> Result<()> {
    for (entity, table) in [
        (TOURNAMENTS, "stg_tournaments"),
        (MATCHES, "stg_matches"),
        (MATCH_DETAILS, "stg_match_details"),
    ] {
        let Some(frame) = lake.read(entity)? else {
            info!(entity, "entity not in lake yet, staging skipped");
            continue;
        };
        let rows = warehouse::upsert_table(conn, table, &frame, &["No"])
            .map_err(|e| PipelineError::storage(format!("stage {table}"), e))?;
        info!(table, rows, "staged");
    }

    if let Some(frame) = lake.read(TOURNAMENT_RANKINGS)? {
        let rows = warehouse::create_table(conn, "stg_tournament_rankings", &frame, None)
            .map_err(|e| PipelineError::storage("stage stg_tournament_rankings", e))?;
        info!(table = "stg_tournament_rankings", rows, "staged");
    }
    Ok(())
}

/// Replaces `team_elo_history` and `upsets` with freshly computed rows.
pub fn persist_ratings(
    conn: &mut Connection,
    history: &[EloHistoryRecord],
    upsets: &[UpsetRecord],
) -> Result<()> {
    let history_frame = elo::history_frame(history)?;
    warehouse::replace_table(conn, HISTORY_TABLE, &history_frame, None)
        .map_err(|e| PipelineError::storage(format!("write {HISTORY_TABLE}"), e))?;
    let upsets_frame = upsets::upsets_frame(upsets)?;
    warehouse::replace_table(conn, UPSETS_TABLE, &upsets_frame, None)
        .map_err(|e| PipelineError::storage(format!("write {UPSETS_TABLE}"), e))?;
    Ok(())
}

/// Recomputes the rating tables from the staged matches without touching
/// the remote source, the lake or the state file.
pub fn rebuild_ratings(conn: &mut Connection, config: &EloConfig) -> Result<RatingOutputs> {
    let matches = elo::load_matches(conn)?;
    let history = elo::compute_elo_history(&matches, config);
    let upsets = upsets::detect_upsets(&history);
    persist_ratings(conn, &history, &upsets)?;
    info!(
        matches = matches.len(),
        rated = history.len() / 2,
        upsets = upsets.len(),
        "ratings rebuilt"
    );
    Ok(RatingOutputs { history, upsets })
}
