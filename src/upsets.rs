use anyhow::Result;
use chrono::NaiveDate;

use crate::elo::EloHistoryRecord;
use crate::frame::{Column, ColumnType, Frame, Value};

pub const UPSETS_TABLE: &str = "upsets";

/// Minimum surprise (probability the winner was expected to lose) for a win
/// to count as an upset.
pub const UPSET_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct UpsetRecord {
    pub match_no: i64,
    pub date: NaiveDate,
    pub winner: String,
    pub loser: String,
    pub winner_elo_before: f64,
    pub winner_elo_after: f64,
    pub expected_win_prob: f64,
    pub surprise_index: f64,
}

/// Winning records whose pre-match expectation was below even, most
/// surprising first.
pub fn detect_upsets(history: &[EloHistoryRecord]) -> Vec<UpsetRecord> {
    let mut upsets = history
        .iter()
        .filter(|rec| rec.win_flag == Some(true))
        .filter_map(|rec| {
            let surprise = 1.0 - rec.expected_score;
            (surprise > UPSET_THRESHOLD).then(|| UpsetRecord {
                match_no: rec.match_no,
                date: rec.date,
                winner: rec.team_name.clone(),
                loser: rec.opponent.clone(),
                winner_elo_before: rec.elo_before,
                winner_elo_after: rec.elo_after,
                expected_win_prob: rec.expected_score,
                surprise_index: surprise,
            })
        })
        .collect::<Vec<_>>();
    upsets.sort_by(|a, b| {
        b.surprise_index
            .total_cmp(&a.surprise_index)
            .then(a.match_no.cmp(&b.match_no))
    });
    upsets
}

pub fn upsets_frame(upsets: &[UpsetRecord]) -> Result<Frame> {
    let mut frame = Frame::new(vec![
        Column::new("MatchNo", ColumnType::Int64),
        Column::new("DateLocal", ColumnType::Utf8),
        Column::new("Winner", ColumnType::Utf8),
        Column::new("Loser", ColumnType::Utf8),
        Column::new("WinnerEloBefore", ColumnType::Float64),
        Column::new("WinnerEloAfter", ColumnType::Float64),
        Column::new("ExpectedWinProb", ColumnType::Float64),
        Column::new("SurpriseIndex", ColumnType::Float64),
    ]);
    for u in upsets {
        frame.push_row(vec![
            Value::Int(u.match_no),
            Value::Text(u.date.format("%Y-%m-%d").to_string()),
            Value::Text(u.winner.clone()),
            Value::Text(u.loser.clone()),
            Value::Float(u.winner_elo_before),
            Value::Float(u.winner_elo_after),
            Value::Float(u.expected_win_prob),
            Value::Float(u.surprise_index),
        ])?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elo::{EloConfig, MatchRow, RatingMap, rate_match};

    fn win(no: i64, winner: &str, before: f64, expected: f64) -> EloHistoryRecord {
        EloHistoryRecord {
            match_no: no,
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            team_name: winner.to_string(),
            opponent: "X".to_string(),
            elo_before: before,
            elo_after: before + 20.0 * (1.0 - expected),
            expected_score: expected,
            actual_score: 1.0,
            win_flag: Some(true),
        }
    }

    #[test]
    fn underdog_win_is_flagged_and_ranked_first() {
        let ratings = RatingMap::from([("Low".to_string(), 1400.0), ("High".to_string(), 1600.0)]);
        let m = MatchRow {
            match_no: 11,
            date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            team_a: Some("Low".to_string()),
            team_b: Some("High".to_string()),
            points_a: Some(3.0),
            points_b: Some(2.0),
        };
        let (_, records) = rate_match(ratings, &m, &EloConfig::default());
        let mut history = records.unwrap().to_vec();
        history.push(win(3, "Mild", 1500.0, 0.45));

        let upsets = detect_upsets(&history);
        assert_eq!(upsets.len(), 2);
        assert_eq!(upsets[0].match_no, 11);
        assert_eq!(upsets[0].winner, "Low");
        assert_eq!(upsets[0].loser, "High");
        assert!((upsets[0].surprise_index - 0.7597).abs() < 1e-3);
    }

    #[test]
    fn favourites_losses_and_ties_are_not_upsets() {
        let mut tie = win(4, "T", 1500.0, 0.3);
        tie.win_flag = None;
        let mut loss = win(5, "L", 1500.0, 0.3);
        loss.win_flag = Some(false);
        let history = vec![win(1, "Fav", 1600.0, 0.7), win(2, "Even", 1500.0, 0.5), tie, loss];
        assert!(detect_upsets(&history).is_empty());
    }

    #[test]
    fn equal_surprise_orders_by_match_number() {
        let history = vec![win(9, "B", 1450.0, 0.3), win(2, "A", 1450.0, 0.3)];
        let upsets = detect_upsets(&history);
        assert_eq!(upsets.iter().map(|u| u.match_no).collect::<Vec<_>>(), vec![2, 9]);
    }

    #[test]
    fn frame_uses_table_column_names() {
        let frame = upsets_frame(&detect_upsets(&[win(1, "A", 1400.0, 0.2)])).unwrap();
        assert_eq!(frame.column_names()[0], "MatchNo");
        assert_eq!(frame.column_names()[7], "SurpriseIndex");
        assert_eq!(frame.len(), 1);
    }
}
