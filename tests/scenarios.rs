use httpmock::Method::GET;
use httpmock::MockServer;
use serde_json::json;
use serial_test::serial;

mod common;

use stampede::prelude::*;

const INDEX_PATH: &str = "/";
const ABOUT_PATH: &str = "/about";

#[test]
#[serial]
// A weighted scenario picks one task per iteration; over enough iterations
// the heavier task is selected proportionally more often.
fn test_weighted_selection() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });

    let configuration = common::build_configuration(&server, vec!["--iterations", "200"]);
    let scenario = Scenario::new("Weighted")
        .set_selection_policy(SelectionPolicy::WeightedRandom)
        .register_task(StepSpec::get("Index", INDEX_PATH).set_weight(3))
        .register_task(StepSpec::get("About", ABOUT_PATH).set_weight(1));

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    // Each iteration dispatched exactly one of the two steps.
    assert_eq!(index.hits() + about.hits(), 200);
    assert_eq!(metrics.total_iterations, 200);
    // With a 3:1 weighting both steps run, and the heavier one runs more.
    assert!(index.hits() > 0);
    assert!(about.hits() > 0);
    assert!(index.hits() > about.hits());
}

#[test]
#[serial]
// With more than one scenario registered, users are assigned scenarios round
// robin in registration order.
fn test_scenarios_assigned_round_robin() {
    let server = MockServer::start();

    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200).json_body(json!({"status": "ok"}));
    });

    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--hatch-rate", "10", "--iterations", "1"],
    );
    let first = Scenario::new("First").register_task(StepSpec::get("Index", INDEX_PATH));
    let second = Scenario::new("Second").register_task(StepSpec::get("About", ABOUT_PATH));

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(first)
            .register_scenario(second),
    );

    // One user ran each scenario.
    index.assert_hits(1);
    about.assert_hits(1);

    assert_eq!(metrics.users_started, 2);
    assert_eq!(metrics.users_stopped, 2);
}

#[test]
#[serial]
// A load test with no registered scenario refuses to run.
fn test_no_scenarios_is_an_error() {
    let server = MockServer::start();
    let configuration = common::build_configuration(&server, vec![]);

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(
            LoadTest::initialize_with_config(configuration)
                .unwrap()
                .execute(),
        );

    assert!(matches!(result, Err(LoadTestError::NoScenarios { .. })));
}
