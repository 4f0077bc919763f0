use crate::harness::{FakeCloud, ScenarioRun, Script};
use scenario_core::FailureKind;

fn delete_cloud() -> FakeCloud {
    FakeCloud::new().command(
        "items delete",
        Script::new()
            .confirm("Delete {name}?")
            .delete("https://example.com/items/{name}")
            .stdout("Deleted {name}.\n"),
    )
}

#[test]
fn test_prompt_reply_is_fed_to_the_command() {
    let yaml = "\
title: delete cancelled
release_tracks: [GA]
actions:
- execute_command:
    command: items delete web-1
    events:
    - expect_prompt_continue:
        message: Delete web-1?
        user_input: n
    - expect_stdout: \"Cancelled.\\n\"
    - expect_exit_code: 0
";
    let outcome = ScenarioRun::new("prompt_cancel")
        .with_yaml(yaml)
        .with_cloud(delete_cloud())
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    assert!(outcome.invocations()[0].responses.is_empty());
}

#[test]
fn test_confirmed_prompt_continues_to_the_api() {
    let yaml = "\
title: delete confirmed
release_tracks: [GA]
actions:
- execute_command:
    command: items delete web-1
    events:
    - expect_prompt_continue:
        message: Delete web-1?
        user_input: y
    - api_call:
        expect_request:
          uri: https://example.com/items/web-1
          method: DELETE
        return_response:
          body: {}
    - expect_stdout: \"Deleted web-1.\\n\"
    - expect_exit_code: 0
";
    let outcome = ScenarioRun::new("prompt_confirm")
        .with_yaml(yaml)
        .with_cloud(delete_cloud())
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    assert_eq!(outcome.invocations()[0].responses.len(), 1);
}

#[test]
fn test_command_error_is_stderr_and_exit() {
    let yaml = "\
title: quota
release_tracks: [GA]
actions:
- execute_command:
    command: instances create web-1
    events:
    - expect_stderr: \"ERROR: quota exceeded for web-1\\n\"
    - expect_exit:
        code: 3
        message: quota exceeded for web-1
";
    let cloud = FakeCloud::new().command("instances create", Script::new().fail(3, "quota exceeded for {name}"));
    let outcome = ScenarioRun::new("command_error").with_yaml(yaml).with_cloud(cloud).run().unwrap();

    outcome.assert_passed().assert_unchanged();
}

#[test]
fn test_panicking_command_is_a_crash() {
    let yaml = "\
title: crash
release_tracks: [GA]
actions:
- execute_command:
    command: instances explode
    events:
    - expect_exit_code: 0
- execute_command:
    command: config list
";
    let cloud = FakeCloud::new()
        .command("instances explode", Script::new().panic("index out of range"))
        .command("config list", Script::new());
    let outcome = ScenarioRun::new("crash").with_yaml(yaml).with_cloud(cloud).run().unwrap();

    outcome.assert_failed().assert_unchanged();
    let crashes = outcome.failures_of(FailureKind::CommandCrash);
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].summary, "index out of range");
    assert_eq!(outcome.report.failures.len(), 1);
    // The run stops at the crash.
    assert!(outcome.invocations().is_empty());
}

#[test]
fn test_swapped_events_fail() {
    let yaml = "\
title: ordering
release_tracks: [GA]
actions:
- execute_command:
    command: items show
    events:
    - expect_stderr: \"warming up\\n\"
    - expect_stdout: \"result\\n\"
    - expect_exit_code: 0
";
    let in_order = FakeCloud::new().command("items show", Script::new().stderr("warming up\n").stdout("result\n"));
    ScenarioRun::new("ordering_kept")
        .with_yaml(yaml)
        .with_cloud(in_order)
        .run()
        .unwrap()
        .assert_passed();

    let swapped = FakeCloud::new().command("items show", Script::new().stdout("result\n").stderr("warming up\n"));
    ScenarioRun::new("ordering_swapped")
        .with_yaml(yaml)
        .with_cloud(swapped)
        .run()
        .unwrap()
        .assert_failed()
        .assert_unchanged();
}

#[test]
fn test_loaded_resource_and_written_file() {
    let cloud = FakeCloud::new().command(
        "items create --from-file",
        Script::new()
            .cat("{name}")
            .write_file("receipt.txt", "created from {name}\n"),
    );
    let outcome = ScenarioRun::new("load_resource")
        .from_fixture_dir("load_resource", "scenario.yaml")
        .with_cloud(cloud)
        .run()
        .unwrap();

    outcome.assert_passed().assert_unchanged();
    assert_eq!(
        outcome.invocations()[0].argv,
        vec!["items", "create", "--from-file", "item.json"]
    );
}

#[test]
fn test_escaping_the_sandbox_is_a_command_error() {
    let yaml = "\
title: escape
release_tracks: [GA]
actions:
- execute_command:
    command: keys export
    events:
    - expect_exit_code: 0
";
    let cloud = FakeCloud::new().command("keys export", Script::new().write_private_file("../key.pem", "secret"));
    let outcome = ScenarioRun::new("sandbox_escape").with_yaml(yaml).with_cloud(cloud).run().unwrap();

    outcome.assert_failed();
    assert!(!outcome.failures_of(FailureKind::AssertionFailure).is_empty());
}
