use crate::harness::{FakeCloud, ScenarioRun, Script};
use scenario_core::{FailureKind, UpdateMode};

fn drifted_cloud() -> FakeCloud {
    FakeCloud::new().command("instances stop", Script::new().stdout("Stopping {name}\n").exit(2))
}

#[test]
fn test_result_rewrite_is_idempotent() {
    let first = ScenarioRun::new("exit_code_drift_twice")
        .from_fixture("exit_code_drift.yaml")
        .with_cloud(drifted_cloud())
        .with_modes(&[UpdateMode::Result])
        .run()
        .unwrap();
    first.assert_passed().assert_rewrites(1);
    let rewritten = first.scenario_text().unwrap();
    // Comments survive the rewrite.
    assert!(rewritten.starts_with("# The command started exiting with 2"));
    assert!(rewritten.contains("web-1   # stops the instance"));

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}

#[test]
fn test_drift_without_update_mode_fails() {
    let outcome = ScenarioRun::new("exit_code_drift_strict")
        .from_fixture("exit_code_drift.yaml")
        .with_cloud(drifted_cloud())
        .run()
        .unwrap();

    outcome.assert_failed().assert_rewrites(0).assert_unchanged();
    let failures = outcome.failures_of(FailureKind::AssertionFailure);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].action_index, 0);
    assert!(failures[0].proposal.is_some());
}

#[test]
fn test_result_mode_leaves_other_drift_alone() {
    // UX drift is not covered by RESULT.
    let cloud = FakeCloud::new().command("instances stop", Script::new().stdout("Halting {name}\n").exit(2));
    let outcome = ScenarioRun::new("exit_code_and_output_drift")
        .from_fixture("exit_code_drift.yaml")
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::Result])
        .run()
        .unwrap();

    outcome.assert_failed().assert_rewrites(0).assert_unchanged();
}

#[test]
fn test_ux_mode_records_missing_output() {
    let cloud = FakeCloud::new().command("config list", Script::new().stdout("core/project: demo\n"));
    let first = ScenarioRun::new("ux_insert")
        .from_fixture("trivial_success.yaml")
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::Ux])
        .run()
        .unwrap();

    first.assert_passed();
    assert!(first.report.rewrites_applied >= 1);
    let rewritten = first.scenario_text().unwrap();
    assert!(rewritten.contains("expect_stdout"), "{}", rewritten);
    assert!(rewritten.contains("core/project: demo"), "{}", rewritten);

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}

#[test]
fn test_api_modes_record_unexpected_traffic() {
    let cloud = FakeCloud::new().command("config list", Script::new().get("https://example.com/config"));
    let first = ScenarioRun::new("api_insert")
        .from_fixture("trivial_success.yaml")
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::ApiRequests, UpdateMode::ApiResponses])
        .run()
        .unwrap();

    first.assert_passed();
    let rewritten = first.scenario_text().unwrap();
    assert!(rewritten.contains("api_call"), "{}", rewritten);
    assert!(rewritten.contains("https://example.com/config"), "{}", rewritten);

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}

#[test]
fn test_unobserved_event_is_removed() {
    let yaml = "\
title: stale output
release_tracks: [GA]
actions:
- execute_command:
    command: config list
    events:
    - expect_stdout: \"old banner\\n\"
    - expect_exit_code: 0
";
    let first = ScenarioRun::new("ux_remove")
        .with_yaml(yaml)
        .with_cloud(FakeCloud::new().command("config list", Script::new()))
        .with_modes(&[UpdateMode::Ux])
        .run()
        .unwrap();

    first.assert_passed().assert_rewrites(1);
    let rewritten = first.scenario_text().unwrap();
    assert!(!rewritten.contains("old banner"), "{}", rewritten);
    assert!(rewritten.contains("expect_exit_code: 0"));

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
}

fn chatty_cloud() -> FakeCloud {
    FakeCloud::new().command("items make", Script::new().stdout("out\n").stderr("err\n").exit(3))
}

fn assert_recorded_in_order(text: &str) {
    let stdout = text.find("expect_stdout").expect("stdout recorded");
    let stderr = text.find("expect_stderr").expect("stderr recorded");
    let exit = text.find("expect_exit").expect("exit recorded");
    assert!(stdout < stderr && stderr < exit, "{}", text);
}

#[test]
fn test_missing_events_recorded_in_order_into_empty_list() {
    let yaml = "\
title: empty events
release_tracks: [GA]
actions:
- execute_command:
    command: items make
    events: []
";
    let first = ScenarioRun::new("record_into_empty_list")
        .with_yaml(yaml)
        .with_cloud(chatty_cloud())
        .with_modes(&[UpdateMode::Ux, UpdateMode::Result])
        .run()
        .unwrap();

    first.assert_passed();
    let rewritten = first.scenario_text().unwrap();
    assert_recorded_in_order(&rewritten);

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}

#[test]
fn test_missing_events_recorded_in_order_without_events_key() {
    let yaml = "\
title: no events
release_tracks: [GA]
actions:
- execute_command:
    command: items make
";
    let first = ScenarioRun::new("record_without_events_key")
        .with_yaml(yaml)
        .with_cloud(chatty_cloud())
        .with_modes(&[UpdateMode::Ux, UpdateMode::Result])
        .run()
        .unwrap();

    first.assert_passed();
    let rewritten = first.scenario_text().unwrap();
    assert!(rewritten.contains("    events:\n"), "{}", rewritten);
    assert_recorded_in_order(&rewritten);

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}

const TWO_TRACKS: &str = "\
title: two tracks
release_tracks: [GA, BETA]
actions:
- execute_command:
    command: instances stop web-1
    events:
    - expect_exit_code: 0
";

#[test]
fn test_later_track_failure_keeps_file_intact() {
    let cloud = FakeCloud::new()
        .command("instances stop", Script::new().exit(2))
        .command("beta instances stop", Script::new().panic("beta stop is broken"));
    let outcome = ScenarioRun::new("ga_rewrite_beta_crash")
        .with_yaml(TWO_TRACKS)
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::Result])
        .run()
        .unwrap();

    outcome.assert_failed().assert_rewrites(0).assert_unchanged();
    assert_eq!(outcome.report.commands_run, 2);
    let crashes = outcome.failures_of(FailureKind::CommandCrash);
    assert_eq!(crashes.len(), 1);
    assert!(crashes[0].summary.contains("beta stop is broken"));
}

#[test]
fn test_rewrites_saved_once_every_track_passes() {
    let cloud = FakeCloud::new().command("instances stop", Script::new().exit(2));
    let outcome = ScenarioRun::new("both_tracks_drift")
        .with_yaml(TWO_TRACKS)
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::Result])
        .run()
        .unwrap();

    outcome.assert_passed().assert_rewrites(1);
    assert_eq!(
        outcome.scenario_text().unwrap(),
        TWO_TRACKS.replace("expect_exit_code: 0", "expect_exit_code: 2")
    );
    assert_eq!(outcome.invocations()[1].argv[0], "beta");
}

#[test]
fn test_operation_response_gains_reference_extraction() {
    let yaml = "\
title: operation
release_tracks: [GA]
actions:
- execute_command:
    command: items create thing
    events:
    - api_call:
        expect_request:
          uri: https://example.com/items
          method: POST
        return_response:
          body: {kind: 'example#operation', name: op-thing}
    - api_call:
        expect_request:
          uri: https://example.com/operations/op-thing
        return_response:
          body: {name: op-thing, done: true}
    - expect_exit_code: 0
";
    let cloud = FakeCloud::new().command(
        "items create",
        Script::new()
            .post("https://example.com/items", r#"{"name":"{name}"}"#)
            .get("https://example.com/operations/op-thing"),
    );
    let first = ScenarioRun::new("operation_extraction")
        .with_yaml(yaml)
        .with_cloud(cloud)
        .with_modes(&[UpdateMode::ApiRequests])
        .run()
        .unwrap();

    first.assert_passed();
    let rewritten = first.scenario_text().unwrap();
    assert!(rewritten.contains("extract_references"), "{}", rewritten);
    assert!(rewritten.contains("reference: operation"), "{}", rewritten);

    let second = first.rerun().unwrap();
    second.assert_passed().assert_rewrites(0);
    assert_eq!(second.scenario_text().unwrap(), rewritten);
}
