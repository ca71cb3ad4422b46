use chrono::{Duration, NaiveDate};
use criterion::{Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

use rally_elo::elo::{EloConfig, MatchRow, compute_elo_history, final_ratings};
use rally_elo::frame::Frame;
use rally_elo::source::parse_records;
use rally_elo::upsets::detect_upsets;

fn synthetic_matches(count: usize, teams: usize) -> Vec<MatchRow> {
    let mut rng = StdRng::seed_from_u64(7);
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).expect("valid date");
    (0..count)
        .map(|i| {
            let a = rng.gen_range(0..teams);
            let mut b = rng.gen_range(0..teams);
            if b == a {
                b = (a + 1) % teams;
            }
            let a_wins = rng.gen_bool(0.5);
            MatchRow {
                match_no: i as i64,
                date: start + Duration::days((i / 20) as i64),
                team_a: Some(format!("Team {a}")),
                team_b: Some(format!("Team {b}")),
                points_a: Some(if a_wins { 2.0 } else { f64::from(rng.gen_range(0..2u8)) }),
                points_b: Some(if a_wins { f64::from(rng.gen_range(0..2u8)) } else { 2.0 }),
            }
        })
        .collect()
}

fn bench_elo_history(c: &mut Criterion) {
    let matches = synthetic_matches(10_000, 200);
    let cfg = EloConfig::default();
    c.bench_function("elo_history_10k", |b| {
        b.iter(|| {
            let history = compute_elo_history(black_box(&matches), &cfg);
            black_box(history.len());
        })
    });
}

fn bench_detect_upsets(c: &mut Criterion) {
    let history = compute_elo_history(&synthetic_matches(10_000, 200), &EloConfig::default());
    c.bench_function("detect_upsets_10k", |b| {
        b.iter(|| {
            let upsets = detect_upsets(black_box(&history));
            black_box(upsets.len());
        })
    });
}

fn bench_final_ratings(c: &mut Criterion) {
    let history = compute_elo_history(&synthetic_matches(10_000, 200), &EloConfig::default());
    c.bench_function("final_ratings_10k", |b| {
        b.iter(|| {
            let ranked = final_ratings(black_box(&history));
            black_box(ranked.len());
        })
    });
}

fn bench_matches_parse(c: &mut Criterion) {
    c.bench_function("matches_parse_to_frame", |b| {
        b.iter(|| {
            let records = parse_records(black_box(MATCHES_JSON)).unwrap();
            let frame = Frame::from_json_records(&records);
            black_box(frame.len());
        })
    });
}

criterion_group!(
    perf,
    bench_elo_history,
    bench_detect_upsets,
    bench_final_ratings,
    bench_matches_parse
);
criterion_main!(perf);

static MATCHES_JSON: &str = include_str!("../tests/fixtures/matches.json");
