use crate::harness::{FakeCloud, ScenarioRun, Script};
use scenario_core::ReleaseTrack;

fn cloud() -> FakeCloud {
    FakeCloud::new().command("compute instances list", Script::new().stdout("NAME  ZONE\n"))
}

#[test]
fn test_every_declared_track_is_replayed() {
    let outcome = ScenarioRun::new("track_replay")
        .from_fixture("track_replay.yaml")
        .with_cloud(cloud())
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    assert_eq!(
        outcome.report.tracks,
        vec![ReleaseTrack::Alpha, ReleaseTrack::Beta, ReleaseTrack::Ga]
    );
    assert_eq!(outcome.report.commands_run, 3);

    let argv: Vec<String> = outcome.invocations().iter().map(|call| call.argv.join(" ")).collect();
    assert_eq!(
        argv,
        vec![
            "alpha compute instances list",
            "beta compute instances list",
            "compute instances list",
        ]
    );
}

#[test]
fn test_single_track_run() {
    let outcome = ScenarioRun::new("track_replay_beta")
        .from_fixture("track_replay.yaml")
        .with_cloud(cloud())
        .on_track(ReleaseTrack::Beta)
        .run()
        .unwrap();

    outcome.assert_passed();
    assert_eq!(outcome.report.tracks, vec![ReleaseTrack::Beta]);
    assert_eq!(outcome.invocations().len(), 1);
    assert_eq!(outcome.invocations()[0].argv[0], "beta");
}

#[test]
fn test_undeclared_track_is_rejected() {
    let result = ScenarioRun::new("undeclared_track")
        .from_fixture("trivial_success.yaml")
        .with_cloud(FakeCloud::new().command("config list", Script::new()))
        .on_track(ReleaseTrack::Alpha)
        .run();

    assert!(result.is_err());
}

#[test]
fn test_failures_name_their_track() {
    let yaml = "\
title: exit drift on every track
release_tracks: [BETA, GA]
actions:
- execute_command:
    command: features list
    events:
    - expect_exit_code: 0
";
    let outcome = ScenarioRun::new("failing_tracks")
        .with_yaml(yaml)
        .with_cloud(FakeCloud::new().command("features list", Script::new().exit(1)))
        .run()
        .unwrap();

    outcome.assert_failed().assert_unchanged();
    let tracks: Vec<Option<&str>> = outcome.report.failures.iter().map(|f| f.track.as_deref()).collect();
    assert_eq!(tracks, vec![Some("BETA"), Some("GA")]);
    assert_eq!(outcome.report.commands_run, 2);
}
