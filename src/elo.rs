use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::frame::{Column, ColumnType, Frame, Value};
use crate::warehouse::{read_table, table_exists};

pub const MATCHES_TABLE: &str = "stg_matches";
pub const HISTORY_TABLE: &str = "team_elo_history";

#[derive(Debug, Clone, Copy)]
pub struct EloConfig {
    pub base_rating: f64,
    pub k_factor: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            base_rating: 1500.0,
            k_factor: 20.0,
        }
    }
}

/// One staged match. Team names and points stay optional: incomplete rows
/// are carried through and skipped by the engine, not rejected on load.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    pub match_no: i64,
    pub date: NaiveDate,
    pub team_a: Option<String>,
    pub team_b: Option<String>,
    pub points_a: Option<f64>,
    pub points_b: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EloHistoryRecord {
    pub match_no: i64,
    pub date: NaiveDate,
    pub team_name: String,
    pub opponent: String,
    pub elo_before: f64,
    pub elo_after: f64,
    pub expected_score: f64,
    pub actual_score: f64,
    /// `None` on a tie.
    pub win_flag: Option<bool>,
}

pub type RatingMap = HashMap<String, f64>;

pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10.0_f64.powf((opponent - rating) / 400.0))
}

/// Applies one match to `ratings`. Both sides are updated from the same
/// pre-match pair. Returns the two history records (A first), or nothing
/// when a team name or a score is missing.
pub fn rate_match(
    mut ratings: RatingMap,
    m: &MatchRow,
    cfg: &EloConfig,
) -> (RatingMap, Option<[EloHistoryRecord; 2]>) {
    let (Some(team_a), Some(team_b), Some(points_a), Some(points_b)) =
        (m.team_a.as_ref(), m.team_b.as_ref(), m.points_a, m.points_b)
    else {
        debug!(match_no = m.match_no, "incomplete match skipped");
        return (ratings, None);
    };

    let before_a = *ratings.get(team_a).unwrap_or(&cfg.base_rating);
    let before_b = *ratings.get(team_b).unwrap_or(&cfg.base_rating);

    let expected_a = expected_score(before_a, before_b);
    let expected_b = 1.0 - expected_a;
    let (actual_a, actual_b, win_a) = if points_a > points_b {
        (1.0, 0.0, Some(true))
    } else if points_a < points_b {
        (0.0, 1.0, Some(false))
    } else {
        (0.5, 0.5, None)
    };

    let after_a = before_a + cfg.k_factor * (actual_a - expected_a);
    let after_b = before_b + cfg.k_factor * (actual_b - expected_b);
    ratings.insert(team_a.clone(), after_a);
    ratings.insert(team_b.clone(), after_b);

    let records = [
        EloHistoryRecord {
            match_no: m.match_no,
            date: m.date,
            team_name: team_a.clone(),
            opponent: team_b.clone(),
            elo_before: before_a,
            elo_after: after_a,
            expected_score: expected_a,
            actual_score: actual_a,
            win_flag: win_a,
        },
        EloHistoryRecord {
            match_no: m.match_no,
            date: m.date,
            team_name: team_b.clone(),
            opponent: team_a.clone(),
            elo_before: before_b,
            elo_after: after_b,
            expected_score: expected_b,
            actual_score: actual_b,
            win_flag: win_a.map(|w| !w),
        },
    ];
    (ratings, Some(records))
}

/// Seeds every team in `matches` at the base rating, then folds the matches
/// in `(date, match_no)` order.
pub fn compute_elo_history(matches: &[MatchRow], cfg: &EloConfig) -> Vec<EloHistoryRecord> {
    if matches.is_empty() {
        return Vec::new();
    }
    let mut ordered = matches.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| a.date.cmp(&b.date).then(a.match_no.cmp(&b.match_no)));

    let seeded = matches
        .iter()
        .flat_map(|m| [m.team_a.as_ref(), m.team_b.as_ref()])
        .flatten()
        .map(|name| (name.clone(), cfg.base_rating))
        .collect::<RatingMap>();

    let (_, history) = ordered.into_iter().fold(
        (seeded, Vec::with_capacity(matches.len() * 2)),
        |(ratings, mut history), m| {
            let (ratings, records) = rate_match(ratings, m, cfg);
            if let Some(records) = records {
                history.extend(records);
            }
            (ratings, history)
        },
    );
    info!(
        matches = matches.len(),
        records = history.len(),
        "computed elo history"
    );
    history
}

/// Latest rating per team, highest first.
pub fn final_ratings(history: &[EloHistoryRecord]) -> Vec<(String, f64)> {
    let mut latest: BTreeMap<&str, f64> = BTreeMap::new();
    for rec in history {
        latest.insert(rec.team_name.as_str(), rec.elo_after);
    }
    let mut out = latest
        .into_iter()
        .map(|(name, rating)| (name.to_string(), rating))
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

/// Reads `stg_matches`. Rows without a match number or a parsable
/// `DateLocal` cannot be ordered and are left out.
pub fn load_matches(conn: &Connection) -> Result<Vec<MatchRow>> {
    if !table_exists(conn, MATCHES_TABLE)? {
        return Ok(Vec::new());
    }
    let frame = read_table(conn, MATCHES_TABLE).context("read staged matches")?;
    Ok(matches_from_frame(&frame))
}

pub fn matches_from_frame(frame: &Frame) -> Vec<MatchRow> {
    let get = |row: usize, col: &str| frame.value(row, col).cloned().unwrap_or(Value::Null);
    let team = |v: Value| {
        v.as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    };
    let points = |v: Value| v.as_f64().filter(|p| p.is_finite());

    let mut out = Vec::with_capacity(frame.len());
    let mut dropped = 0usize;
    for row in 0..frame.len() {
        let (Some(match_no), Some(date)) = (get(row, "No").as_i64(), get(row, "DateLocal").as_date())
        else {
            dropped += 1;
            continue;
        };
        out.push(MatchRow {
            match_no,
            date,
            team_a: team(get(row, "TeamNameA")),
            team_b: team(get(row, "TeamNameB")),
            points_a: points(get(row, "MatchPointsA")),
            points_b: points(get(row, "MatchPointsB")),
        });
    }
    if dropped > 0 {
        debug!(dropped, "matches without number or date left out of rating");
    }
    out
}

pub fn history_frame(history: &[EloHistoryRecord]) -> Result<Frame> {
    let mut frame = Frame::new(vec![
        Column::new("MatchNo", ColumnType::Int64),
        Column::new("DateLocal", ColumnType::Utf8),
        Column::new("TeamName", ColumnType::Utf8),
        Column::new("Opponent", ColumnType::Utf8),
        Column::new("EloBefore", ColumnType::Float64),
        Column::new("EloAfter", ColumnType::Float64),
        Column::new("ExpectedScore", ColumnType::Float64),
        Column::new("ActualScore", ColumnType::Float64),
        Column::new("WinFlag", ColumnType::Bool),
    ]);
    for rec in history {
        frame.push_row(vec![
            Value::Int(rec.match_no),
            Value::Text(rec.date.format("%Y-%m-%d").to_string()),
            Value::Text(rec.team_name.clone()),
            Value::Text(rec.opponent.clone()),
            Value::Float(rec.elo_before),
            Value::Float(rec.elo_after),
            Value::Float(rec.expected_score),
            Value::Float(rec.actual_score),
            rec.win_flag.map(Value::Bool).unwrap_or(Value::Null),
        ])?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn played(no: i64, d: u32, a: &str, b: &str, pa: i64, pb: i64) -> MatchRow {
        MatchRow {
            match_no: no,
            date: day(d),
            team_a: Some(a.to_string()),
            team_b: Some(b.to_string()),
            points_a: Some(pa as f64),
            points_b: Some(pb as f64),
        }
    }

    #[test]
    fn expected_scores_sum_to_one() {
        for (a, b) in [(1500.0, 1500.0), (1400.0, 1600.0), (1723.5, 1311.2)] {
            let sum = expected_score(a, b) + expected_score(b, a);
            assert!((sum - 1.0).abs() < 1e-12);
        }
        assert!((expected_score(1500.0, 1500.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn tie_splits_actual_score() {
        let (ratings, records) = rate_match(RatingMap::new(), &played(1, 1, "A", "B", 2, 2), &EloConfig::default());
        let [a, b] = records.unwrap();
        assert_eq!(a.actual_score, 0.5);
        assert_eq!(b.actual_score, 0.5);
        assert_eq!(a.win_flag, None);
        assert_eq!(b.win_flag, None);
        assert_eq!(ratings["A"], 1500.0);
    }

    #[test]
    fn fractional_totals_are_not_a_tie() {
        let mut m = played(1, 1, "A", "B", 0, 0);
        m.points_a = Some(3.4);
        m.points_b = Some(3.1);
        let (_, records) = rate_match(RatingMap::new(), &m, &EloConfig::default());
        let [a, b] = records.unwrap();
        assert_eq!(a.win_flag, Some(true));
        assert_eq!(b.actual_score, 0.0);
    }

    #[test]
    fn updates_use_the_same_pre_match_pair() {
        let cfg = EloConfig::default();
        let ratings = RatingMap::from([("A".to_string(), 1600.0), ("B".to_string(), 1450.0)]);
        let (_, records) = rate_match(ratings, &played(1, 1, "A", "B", 1, 3), &cfg);
        let [a, b] = records.unwrap();
        let exp_a = expected_score(1600.0, 1450.0);
        assert!((a.elo_after - (1600.0 + 20.0 * (0.0 - exp_a))).abs() < 1e-9);
        assert!((b.elo_after - (1450.0 + 20.0 * (1.0 - (1.0 - exp_a)))).abs() < 1e-9);
        // Zero-sum with a shared K.
        assert!(((a.elo_after - 1600.0) + (b.elo_after - 1450.0)).abs() < 1e-9);
    }

    #[test]
    fn three_match_sequence_threads_ratings() {
        let history = compute_elo_history(
            &[
                played(1, 1, "A", "B", 3, 1),
                played(2, 2, "B", "C", 3, 2),
                played(3, 3, "A", "C", 1, 3),
            ],
            &EloConfig::default(),
        );
        assert_eq!(history.len(), 6);
        assert_eq!(history[0].elo_after, 1510.0);
        assert_eq!(history[1].elo_after, 1490.0);

        let a_day3 = &history[4];
        let c_day3 = &history[5];
        assert_eq!(a_day3.team_name, "A");
        assert_eq!(a_day3.elo_before, history[0].elo_after);
        assert_eq!(c_day3.elo_before, history[3].elo_after);
        let expected_a = expected_score(a_day3.elo_before, c_day3.elo_before);
        assert!((a_day3.elo_after - a_day3.elo_before - 20.0 * (0.0 - expected_a)).abs() < 1e-9);
        assert_eq!(a_day3.win_flag, Some(false));
        assert_eq!(c_day3.win_flag, Some(true));
    }

    #[test]
    fn empty_input_yields_empty_history() {
        assert!(compute_elo_history(&[], &EloConfig::default()).is_empty());
    }

    #[test]
    fn incomplete_matches_emit_nothing() {
        let mut missing_score = played(2, 2, "A", "C", 3, 0);
        missing_score.points_b = None;
        let mut missing_team = played(3, 3, "B", "C", 3, 0);
        missing_team.team_a = None;
        let history = compute_elo_history(
            &[played(1, 1, "A", "B", 3, 1), missing_score, missing_team],
            &EloConfig::default(),
        );
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.match_no == 1));
    }

    #[test]
    fn input_order_does_not_matter() {
        let cfg = EloConfig::default();
        let m = vec![
            played(7, 3, "A", "C", 1, 3),
            played(5, 1, "A", "B", 3, 1),
            played(6, 2, "B", "C", 3, 2),
        ];
        let mut reversed = m.clone();
        reversed.reverse();
        assert_eq!(compute_elo_history(&m, &cfg), compute_elo_history(&reversed, &cfg));
        assert_eq!(compute_elo_history(&m, &cfg)[0].match_no, 5);
    }

    #[test]
    fn same_day_ties_break_on_match_number() {
        let history = compute_elo_history(
            &[played(9, 1, "C", "D", 3, 0), played(4, 1, "A", "B", 3, 0)],
            &EloConfig::default(),
        );
        assert_eq!(history[0].match_no, 4);
        assert_eq!(history[2].match_no, 9);
    }

    #[test]
    fn frame_rows_map_to_matches() {
        let frame = Frame::from_json_records(&[
            serde_json::json!({"No": 1, "DateLocal": "2026-01-02T10:00:00", "TeamNameA": "A", "TeamNameB": "B", "MatchPointsA": 3, "MatchPointsB": "1"}),
            serde_json::json!({"No": 2, "DateLocal": null, "TeamNameA": "A", "TeamNameB": "B", "MatchPointsA": 3, "MatchPointsB": 1}),
            serde_json::json!({"No": 3, "DateLocal": "2026-01-03", "TeamNameA": " ", "TeamNameB": "B", "MatchPointsA": null, "MatchPointsB": 1}),
        ]);
        let rows = matches_from_frame(&frame);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, day(2));
        assert_eq!(rows[0].points_b, Some(1.0));
        assert_eq!(rows[1].team_a, None);
        assert_eq!(rows[1].points_a, None);
    }

    #[test]
    fn final_ratings_are_sorted_descending() {
        let history = compute_elo_history(&[played(1, 1, "A", "B", 3, 0)], &EloConfig::default());
        let ranked = final_ratings(&history);
        assert_eq!(ranked[0].0, "A");
        assert!(ranked[0].1 > ranked[1].1);
    }
}
