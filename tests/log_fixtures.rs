//! Parsing of recorded navigation exports
//!
//! Run with:
//!   cargo test --test log_fixtures

use std::path::PathBuf;
use std::time::Duration;

use bleconnect::{DirectionCode, InstructionLog};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn test_navigation_export_parses_every_row() {
    let log = InstructionLog::from_file(&fixture("navigation_export.csv")).unwrap();
    assert_eq!(log.len(), 138);

    let instructions = log.instructions();
    assert_eq!(instructions[0].direction, DirectionCode::Start);
    assert_eq!(instructions[0].street_name(), "Kiepenheuerallee");
    assert_eq!(instructions[0].delay_to_next, Duration::from_millis(9_535));

    let last = &instructions[137];
    assert_eq!(last.direction, DirectionCode::Finish);
    assert_eq!(last.delay_to_next, Duration::ZERO);
    assert_eq!(last.title, None);

    assert_eq!(log.duration(), Duration::from_millis(1_809_967));
}

#[test]
fn test_navigation_export_extracts_distance_and_street() {
    let log = InstructionLog::from_file(&fixture("navigation_export.csv")).unwrap();

    for instruction in log.instructions() {
        assert!(!instruction.street_name().starts_with('"'));
        assert!(!instruction.street_name().ends_with('"'));

        let subtitle = instruction.subtitle.as_deref().unwrap();
        if subtitle.ends_with("km") {
            assert!(instruction.distance_m() >= 1_000, "{}", subtitle);
        } else {
            assert!(instruction.distance_m() < 1_000, "{}", subtitle);
        }
    }

    assert_eq!(log.instructions()[17].direction, DirectionCode::RoundaboutCCW11);
    assert_eq!(log.instructions()[64].direction, DirectionCode::RoundaboutCCW22);
    assert_eq!(log.instructions()[64].distance_m(), 7_800);
}

#[test]
fn test_roundabout_export_refines_roundabouts() {
    let log = InstructionLog::from_file(&fixture("roundabout_export.csv")).unwrap();
    assert_eq!(log.len(), 89);
    assert_eq!(log.instructions()[30].direction, DirectionCode::RoundaboutCCW13);

    // The generic code never survives parsing.
    assert!(log
        .instructions()
        .iter()
        .all(|i| i.direction != DirectionCode::Roundabout));
}

#[test]
fn test_truncated_export_drops_only_bad_rows() {
    let source = std::fs::read_to_string(fixture("navigation_export.csv")).unwrap();
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();

    // Lose the trailing field of one row and glue an extra one onto another.
    let short = lines[10].rsplit_once(',').unwrap().0.to_string();
    lines[10] = short;
    lines[20].push_str(",extra");

    let log = InstructionLog::parse(&lines.join("\n"));
    assert_eq!(log.len(), 136);
}
