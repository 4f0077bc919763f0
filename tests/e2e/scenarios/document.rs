use crate::harness::workspace::fixtures_dir;
use scenario_core::{Scenario, ScenarioDocument};
use std::fs;
use std::path::PathBuf;

fn fixture_files() -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(fixtures_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    files.push(fixtures_dir().join("load_resource").join("scenario.yaml"));
    files.sort();
    files
}

#[test]
fn test_fixtures_round_trip_byte_identical() {
    let files = fixture_files();
    assert!(files.len() >= 8);
    for path in files {
        let text = fs::read_to_string(&path).unwrap();
        let document = ScenarioDocument::load(&path).unwrap();
        assert_eq!(document.serialize(), text, "{}", path.display());
    }
}

#[test]
fn test_fixtures_are_valid_scenarios() {
    for path in fixture_files() {
        let document = ScenarioDocument::load(&path).unwrap();
        let scenario = Scenario::from_document(&document)
            .unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        assert!(!scenario.release_tracks.is_empty());
        assert!(scenario.command_count() >= 1, "{}", path.display());
    }
}
