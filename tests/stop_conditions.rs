use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;
use serial_test::serial;

mod common;

use stampede::prelude::*;
use stampede::storefront;

const INDEX_PATH: &str = "/";
const ABOUT_PATH: &str = "/about";
const LOGIN_PATH: &str = "/api/users/login";

#[test]
#[serial]
// A one-shot scenario runs its task list exactly once per user and stops
// cleanly, without any run-time or iteration budget configured.
fn test_one_shot_runs_once() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });

    let configuration = common::build_configuration(&server, vec![]);
    let scenario = Scenario::new("OneShot")
        .register_task(StepSpec::get("Index", INDEX_PATH))
        .register_task(StepSpec::get("About", ABOUT_PATH))
        .set_one_shot();

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    index.assert_hits(1);
    about.assert_hits(1);

    assert_eq!(metrics.users_started, 1);
    assert_eq!(metrics.users_stopped, 1);
    assert_eq!(metrics.total_iterations, 1);
}

#[test]
#[serial]
// A one-shot user never thinks past its final step: the completed cycle is
// reported even when the run budget would otherwise expire during a trailing
// think time.
fn test_one_shot_counts_cycle_despite_think_time() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });

    let configuration = common::build_configuration(&server, vec!["--run-time", "1"]);
    let scenario = Scenario::new("OneShotThinking")
        .register_task(StepSpec::get("Index", INDEX_PATH))
        .set_one_shot()
        .set_wait_time(
            std::time::Duration::from_secs(10),
            std::time::Duration::from_secs(10),
        )
        .unwrap();

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    index.assert_hits(1);
    assert_eq!(metrics.users_stopped, 1);
    assert_eq!(metrics.total_iterations, 1);
}

#[test]
#[serial]
// Multiple users each run the scenario independently to their own budget.
fn test_multiple_users() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });

    let configuration = common::build_configuration(
        &server,
        vec!["--users", "3", "--hatch-rate", "10", "--iterations", "2"],
    );
    let scenario =
        Scenario::new("ManyUsers").register_task(StepSpec::get("Index", INDEX_PATH));

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    index.assert_hits(6);

    assert_eq!(metrics.users_started, 3);
    assert_eq!(metrics.users_stopped, 3);
    assert_eq!(metrics.total_iterations, 6);
    assert_eq!(metrics.steps.get("Index").unwrap().success_count, 6);
}

#[test]
#[serial]
// With backfill enabled every aborted user is replaced, keeping the active
// population at the target until the run budget expires.
fn test_backfill_replaces_aborted_users() {
    let server = MockServer::start();

    // Every session aborts during setup.
    let login = server.mock(|when, then| {
        when.method(POST).path(LOGIN_PATH);
        then.status(401).json_body(json!({"error": "invalid credentials"}));
    });

    let configuration =
        common::build_configuration(&server, vec!["--backfill", "--run-time", "1"]);
    let scenario = Scenario::new("AlwaysAborting")
        .register_setup(storefront::login())
        .register_task(StepSpec::get("Index", INDEX_PATH));

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    // The original user aborted and at least one replacement was launched.
    assert!(metrics.users_started > 1);
    assert_eq!(metrics.users_aborted, metrics.users_started);
    assert_eq!(
        metrics.aborted_for(AbortReason::SetupAbort),
        metrics.users_started
    );
    assert_eq!(login.hits(), metrics.users_started);
}
