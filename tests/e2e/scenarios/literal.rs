use crate::harness::{FakeCloud, ScenarioRun, Script};
use scenario_core::http::batch;
use scenario_core::{generate_id, FailureKind, UpdateMode};

#[test]
fn test_trivial_success() {
    let outcome = ScenarioRun::new("trivial_success")
        .from_fixture("trivial_success.yaml")
        .with_cloud(FakeCloud::new().command("config list", Script::new()))
        .run()
        .expect("scenario should run");

    outcome.assert_passed().assert_rewrites(0).assert_unchanged();
    assert_eq!(outcome.report.commands_run, 1);
    assert_eq!(outcome.invocations()[0].argv, vec!["config", "list"]);
}

#[test]
fn test_property_propagation() {
    let outcome = ScenarioRun::new("property_propagation")
        .from_fixture("property_propagation.yaml")
        .with_cloud(FakeCloud::new().command("x y z", Script::new().echo_property("core/project")))
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    let seen: Vec<&str> = outcome
        .invocations()
        .iter()
        .map(|call| call.properties["core/project"].as_str())
        .collect();
    assert_eq!(seen, vec!["myproj", "otherproj"]);
}

#[test]
fn test_result_mode_rewrites_exit_code() {
    let outcome = ScenarioRun::new("exit_code_drift")
        .from_fixture("exit_code_drift.yaml")
        .with_cloud(FakeCloud::new().command("instances stop", Script::new().stdout("Stopping {name}\n").exit(2)))
        .with_modes(&[UpdateMode::Result])
        .run()
        .unwrap();

    outcome.assert_passed().assert_rewrites(1);
    let expected = outcome
        .original_text()
        .replace("expect_exit_code: 0", "expect_exit_code: 2");
    assert_eq!(outcome.scenario_text().unwrap(), expected);
}

#[test]
fn test_batch_sub_requests_in_any_order() {
    let cloud = FakeCloud::new().command(
        "items get-many",
        Script::new().batch("https://example.com/batch", &[("GET", "/b"), ("GET", "/a")]),
    );
    let outcome = ScenarioRun::new("batch_unordered")
        .from_fixture("batch_unordered.yaml")
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();

    // Part 1 of the request asked for /b and must get b's body back.
    let parts = batch::parse_response(&outcome.invocations()[0].responses[0]).unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].content_id.as_deref(), Some("1"));
    assert_eq!(parts[0].response.body_text(), Some(r#"{"name":"b"}"#));
    assert_eq!(parts[1].response.body_text(), Some(r#"{"name":"a"}"#));
}

#[test]
fn test_unmatched_traffic_is_reported() {
    let cloud = FakeCloud::new().command(
        "items list",
        Script::new()
            .get("https://example.com/items/first")
            .get("https://example.com/items/second"),
    );
    let outcome = ScenarioRun::new("unmatched_traffic")
        .from_fixture("unmatched_traffic.yaml")
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_failed().assert_unchanged();
    let unmatched = outcome.failures_of(FailureKind::UnmatchedTraffic);
    assert_eq!(unmatched.len(), 1);
    assert!(
        unmatched[0].summary.contains("GET https://example.com/items/second"),
        "{}",
        unmatched[0].summary
    );
    assert_eq!(outcome.report.failures.len(), 1);
}

#[test]
fn test_reference_substitution_in_uri() {
    let cloud = FakeCloud::new().command(
        "items describe",
        Script::new()
            .get("https://example.com/items/{name}")
            .print_field("name"),
    );
    let outcome = ScenarioRun::new("reference_substitution")
        .from_fixture("reference_substitution.yaml")
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    let id = generate_id("reference substitution", "id", None, false);
    let call = &outcome.invocations()[0];
    assert_eq!(call.argv, vec!["items".to_string(), "describe".to_string(), id.clone()]);
    assert_eq!(call.responses[0].body_text(), Some(format!(r#"{{"name":"{}"}}"#, id).as_str()));
}
