use std::fs;
use std::path::PathBuf;

use rusqlite::Connection;
use serde_json::json;

use rally_elo::elo::EloConfig;
use rally_elo::frame::Frame;
use rally_elo::lake::Lake;
use rally_elo::pipeline::rebuild_ratings;
use rally_elo::source::parse_records;
use rally_elo::warehouse::{read_table, row_count, upsert_table};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn fixture_matches() -> Frame {
    let records = parse_records(&read_fixture("matches.json")).expect("fixture should parse");
    Frame::from_json_records(&records)
}

#[test]
fn envelope_fixture_parses_into_frame() {
    let frame = fixture_matches();
    assert_eq!(frame.len(), 5);
    assert!(frame.has_column("NoTournament"));
    assert_eq!(frame.distinct_i64("NoTournament"), vec![100, 200, 300]);
}

#[test]
fn repeated_upsert_is_idempotent() {
    let frame = fixture_matches();
    let mut conn = Connection::open_in_memory().unwrap();

    upsert_table(&mut conn, "stg_matches", &frame, &["No"]).unwrap();
    let once = read_table(&conn, "stg_matches").unwrap();
    upsert_table(&mut conn, "stg_matches", &frame, &["No"]).unwrap();
    let twice = read_table(&conn, "stg_matches").unwrap();

    assert_eq!(row_count(&conn, "stg_matches").unwrap(), 5);
    assert_eq!(once.distinct_i64("No"), twice.distinct_i64("No"));
    assert_eq!(once.len(), twice.len());
}

#[test]
fn partitioned_merge_write_round_trips_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let lake = Lake::new(dir.path());
    let frame = fixture_matches();

    lake.merge_write(&frame, "matches", &["No"], &["NoTournament"]).unwrap();
    let once = lake.read("matches").unwrap().expect("entity written");
    lake.merge_write(&frame, "matches", &["No"], &["NoTournament"]).unwrap();
    let twice = lake.read("matches").unwrap().expect("entity written");

    assert_eq!(once, twice);
    assert_eq!(once.len(), 5);
    for tournament in [100, 200, 300] {
        assert!(dir.path().join("matches").join(format!("NoTournament={tournament}")).is_dir());
    }
}

#[test]
fn merge_write_moves_rows_between_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let lake = Lake::new(dir.path());
    let frame = fixture_matches();
    lake.merge_write(&frame, "matches", &["No"], &["NoTournament"]).unwrap();

    // Match 5 is reassigned from tournament 300 to 200.
    let moved = frame.filter(|row| {
        row.iter().zip(frame.columns()).any(|(v, c)| c.name == "No" && v.as_i64() == Some(5))
    });
    let idx = moved.column_index("NoTournament").unwrap();
    let mut rows = moved.rows().to_vec();
    rows[0][idx] = rally_elo::frame::Value::Int(200);
    let moved = Frame::from_rows(
        moved.column_names().iter().map(|c| c.to_string()).collect(),
        rows,
    )
    .unwrap();
    lake.merge_write(&moved, "matches", &["No"], &["NoTournament"]).unwrap();

    let merged = lake.read("matches").unwrap().unwrap();
    assert_eq!(merged.len(), 5);
    assert!(!dir.path().join("matches").join("NoTournament=300").exists());
}

#[test]
fn corrected_scores_clear_stale_upsets_on_rebuild() {
    let mut conn = Connection::open_in_memory().unwrap();
    let game = |no: i64, day: u32, a: &str, b: &str, pa: i64, pb: i64| {
        json!({
            "No": no, "TeamNameA": a, "TeamNameB": b,
            "MatchPointsA": pa, "MatchPointsB": pb,
            "DateLocal": format!("2026-04-{day:02}"),
        })
    };
    let staged = Frame::from_json_records(&[
        game(1, 1, "Alpha", "Bravo", 2, 0),
        game(2, 2, "Bravo", "Alpha", 2, 1),
    ]);
    upsert_table(&mut conn, "stg_matches", &staged, &["No"]).unwrap();
    let first = rebuild_ratings(&mut conn, &EloConfig::default()).unwrap();
    assert_eq!(first.upsets.len(), 1);
    assert_eq!(row_count(&conn, "upsets").unwrap(), 1);

    let corrected = Frame::from_json_records(&[game(2, 2, "Bravo", "Alpha", 1, 2)]);
    upsert_table(&mut conn, "stg_matches", &corrected, &["No"]).unwrap();
    let second = rebuild_ratings(&mut conn, &EloConfig::default()).unwrap();

    assert!(second.upsets.is_empty());
    assert_eq!(row_count(&conn, "upsets").unwrap(), 0);
    assert_eq!(row_count(&conn, "team_elo_history").unwrap(), 4);
}
