use crate::harness::{FakeCloud, ScenarioRun, Script};
use scenario_core::http::batch;
use scenario_core::FailureKind;

const POLLING: &str = "\
title: polling
release_tracks: [GA]
actions:
- execute_command:
    command: operations wait op-1
    events:
    - api_call:
        repeatable: true
        expect_request:
          uri: https://example.com/operations/op-1
          method: GET
        return_response:
          body: {name: op-1, done: true}
    - expect_stdout: \"done\\n\"
    - expect_exit_code: 0
";

#[test]
fn test_batch_missing_a_sub_request_fails() {
    let cloud = FakeCloud::new().command(
        "items get-many",
        Script::new().batch("https://example.com/batch", &[("GET", "/a")]),
    );
    let outcome = ScenarioRun::new("batch_missing_part")
        .from_fixture("batch_unordered.yaml")
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_failed().assert_unchanged();
    assert!(!outcome.failures_of(FailureKind::AssertionFailure).is_empty());
    assert!(outcome.failures_of(FailureKind::UnmatchedTraffic).is_empty());
}

#[test]
fn test_repeatable_call_absorbs_polling() {
    let cloud = FakeCloud::new().command(
        "operations wait",
        Script::new()
            .get("https://example.com/operations/{name}")
            .get("https://example.com/operations/{name}")
            .get("https://example.com/operations/{name}")
            .stdout("done\n"),
    );
    let outcome = ScenarioRun::new("polling").with_yaml(POLLING).with_cloud(cloud).run().unwrap();

    outcome.assert_passed().assert_unchanged();
    assert_eq!(outcome.invocations()[0].responses.len(), 3);
}

#[test]
fn test_repeatable_call_may_go_unused() {
    let cloud = FakeCloud::new().command("operations wait", Script::new().stdout("done\n"));
    let outcome = ScenarioRun::new("polling_skipped").with_yaml(POLLING).with_cloud(cloud).run().unwrap();

    outcome.assert_passed();
}

#[test]
fn test_lenient_http_tolerates_extra_requests() {
    let cloud = FakeCloud::new().command(
        "items list",
        Script::new()
            .get("https://example.com/items/first")
            .get("https://example.com/items/second"),
    );
    let outcome = ScenarioRun::new("unmatched_traffic_lenient")
        .from_fixture("unmatched_traffic.yaml")
        .with_cloud(cloud)
        .lenient_http()
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    let call = &outcome.invocations()[0];
    assert_eq!(call.responses[1].status, 200);
    assert!(call.responses[1].body.is_empty());
}

const BATCH_CREATE: &str = "\
title: batch create
release_tracks: [GA]
actions:
- execute_command:
    command: items create-many
    events:
    - api_call:
        expect_request:
          uri: https://example.com/batch
          method: POST
          batch:
          - uri: /a
            method: POST
          - uri: /b
            method: POST
        return_response:
          batch:
          - body: {name: a, created: true}
          - body: {name: b, created: true}
    - expect_exit_code: 0
";

#[test]
fn test_batch_sub_requests_with_bodies_match() {
    let cloud = FakeCloud::new().command(
        "items create-many",
        Script::new().batch_with_bodies(
            "https://example.com/batch",
            &[("POST", "/b", r#"{"name":"b"}"#), ("POST", "/a", r#"{"name":"a"}"#)],
        ),
    );
    let outcome = ScenarioRun::new("batch_with_bodies")
        .with_yaml(BATCH_CREATE)
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    let parts = batch::parse_response(&outcome.invocations()[0].responses[0]).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].response.body_text(), Some(r#"{"name":"b","created":true}"#));
    assert_eq!(parts[1].response.body_text(), Some(r#"{"name":"a","created":true}"#));
}
