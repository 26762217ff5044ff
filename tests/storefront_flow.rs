use std::sync::Arc;

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;
use serial_test::serial;

mod common;

use stampede::prelude::*;
use stampede::storefront;

const SIGNUP_PATH: &str = "/api/users/signup";
const LOGIN_PATH: &str = "/api/users/login";
const PRODUCTS_PATH: &str = "/api/products";
const PRODUCT_PATH: &str = "/api/products/p1";
const CART_ADD_PATH: &str = "/api/cart/add";
const CART_VIEW_PATH: &str = "/api/cart/view";
const PAYMENT_PATH: &str = "/api/payment/mock-payment";
const ORDER_PATH: &str = "/api/orders/place";

// The access token the mock login endpoint hands out; every step after login
// must present it as a bearer token.
const ACCESS_TOKEN: &str = "tok123";

#[test]
#[serial]
// Run the complete sequential storefront journey once and validate the wire
// contract end to end: generated credentials in signup and login, the bearer
// token on every authenticated request, and one request per step.
fn test_sequential_full_flow() {
    let server = MockServer::start();

    let signup = server.mock(|when, then| {
        when.method(POST)
            .path(SIGNUP_PATH)
            .body_includes("@loadtest.local");
        then.status(201).json_body(json!({"status": "created"}));
    });
    let login = server.mock(|when, then| {
        when.method(POST)
            .path(LOGIN_PATH)
            .body_includes("@loadtest.local");
        then.status(200)
            .json_body(json!({"accessToken": ACCESS_TOKEN}));
    });
    let products = server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCTS_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN));
        then.status(200)
            .json_body(json!([{"_id": "p1", "name": "Widget", "price": 1099}]));
    });
    let product = server.mock(|when, then| {
        when.method(GET)
            .path(PRODUCT_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN));
        then.status(200)
            .json_body(json!({"_id": "p1", "name": "Widget", "price": 1099}));
    });
    let cart_add = server.mock(|when, then| {
        when.method(POST)
            .path(CART_ADD_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN))
            .json_body(json!({"productId": "p1", "quantity": 1}));
        then.status(200).json_body(json!({"items": 1}));
    });
    let cart_view = server.mock(|when, then| {
        when.method(GET)
            .path(CART_VIEW_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN));
        then.status(200).json_body(json!({"items": []}));
    });
    let payment = server.mock(|when, then| {
        when.method(POST)
            .path(PAYMENT_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN))
            .json_body(json!({
                "nameOnCard": "Load Tester",
                "cardNumber": "4111111111111111",
                "expiry": "12/30",
                "cvv": "123",
                "amount": 1099,
            }));
        then.status(200).json_body(json!({"paymentId": "pay1"}));
    });
    let order = server.mock(|when, then| {
        when.method(POST)
            .path(ORDER_PATH)
            .header("authorization", format!("Bearer {}", ACCESS_TOKEN))
            .json_body(json!({
                "shippingInfo": {
                    "name": "Load Test",
                    "address": "123 Test Lane",
                    "city": "Testville",
                    "postalCode": "00000",
                    "country": "Testland",
                },
                "paymentMethodId": "pm_card_visa",
            }));
        then.status(201).json_body(json!({"orderId": "o1"}));
    });

    let configuration = common::build_configuration(&server, vec!["--iterations", "1"]);
    // The canned full flow, without think time so the test runs fast.
    let scenario = Scenario::new("FullUserFlow")
        .register_setup(storefront::signup())
        .register_setup(storefront::login())
        .register_setup(storefront::list_products())
        .register_task(storefront::get_product())
        .register_task(storefront::add_to_cart())
        .register_task(storefront::view_cart())
        .register_task(storefront::mock_payment())
        .register_task(storefront::place_order(Some("pm_card_visa")));

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    // One pass through setup, one full task iteration.
    signup.assert_hits(1);
    login.assert_hits(1);
    products.assert_hits(1);
    product.assert_hits(1);
    cart_add.assert_hits(1);
    cart_view.assert_hits(1);
    payment.assert_hits(1);
    order.assert_hits(1);

    assert_eq!(metrics.users_started, 1);
    assert_eq!(metrics.users_stopped, 1);
    assert_eq!(metrics.users_aborted, 0);
    assert_eq!(metrics.total_iterations, 1);

    // Every step ran exactly once and classified Success.
    for name in [
        "Signup",
        "Login",
        "List Products",
        "Get Product",
        "Add To Cart",
        "View Cart",
        "Mock Payment",
        "Place Order",
    ] {
        let step = metrics
            .steps
            .get(name)
            .unwrap_or_else(|| panic!("no metrics recorded for {}", name));
        assert_eq!(step.success_count, 1, "{} success count", name);
        assert_eq!(step.validation_failure_count, 0, "{} failures", name);
        assert_eq!(step.transport_error_count, 0, "{} transport errors", name);
        assert_eq!(step.skipped_count, 0, "{} skips", name);
    }
}

#[test]
#[serial]
// A registered sink receives exactly one outcome per executed or skipped
// step, in execution order, carrying the classification the rollup recorded.
fn test_metrics_sink_receives_every_outcome() {
    let server = MockServer::start();

    let signup = server.mock(|when, then| {
        when.method(POST).path(SIGNUP_PATH);
        then.status(201).json_body(json!({"status": "created"}));
    });
    let login = server.mock(|when, then| {
        when.method(POST).path(LOGIN_PATH);
        then.status(200)
            .json_body(json!({"accessToken": ACCESS_TOKEN}));
    });
    // An empty catalog makes the catalog-dependent task a skip.
    let products = server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(200).json_body(json!([]));
    });
    let cart_view = server.mock(|when, then| {
        when.method(GET).path(CART_VIEW_PATH);
        then.status(200).json_body(json!({"items": []}));
    });

    let (sink_tx, sink_rx) = flume::unbounded();

    let configuration = common::build_configuration(&server, vec!["--iterations", "1"]);
    let scenario = Scenario::new("SinkFlow")
        .register_setup(storefront::signup())
        .register_setup(storefront::login())
        .register_setup(storefront::list_products())
        .register_task(storefront::get_product())
        .register_task(storefront::view_cart());

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario)
            .set_metrics_sink(Arc::new(ChannelSink::new(sink_tx))),
    );

    signup.assert_hits(1);
    login.assert_hits(1);
    products.assert_hits(1);
    cart_view.assert_hits(1);

    // One outcome per step, executed and skipped alike, in execution order.
    let delivered: Vec<(String, StepClassification)> = sink_rx
        .try_iter()
        .map(|outcome| (outcome.step_name, outcome.classification))
        .collect();
    assert_eq!(
        delivered,
        vec![
            ("Signup".to_string(), StepClassification::Success),
            ("Login".to_string(), StepClassification::Success),
            ("List Products".to_string(), StepClassification::Success),
            ("Get Product".to_string(), StepClassification::Skipped),
            ("View Cart".to_string(), StepClassification::Success),
        ]
    );

    // The sink saw the same stream the built-in rollup folded.
    assert_eq!(delivered.len(), metrics.total_count());
}

#[test]
#[serial]
// Two iterations of a sequential flow replay the tasks in strict declared
// order each cycle.
fn test_sequential_iteration_budget() {
    let server = MockServer::start();

    let signup = server.mock(|when, then| {
        when.method(POST).path(SIGNUP_PATH);
        then.status(200).json_body(json!({"status": "exists"}));
    });
    let login = server.mock(|when, then| {
        when.method(POST).path(LOGIN_PATH);
        then.status(200)
            .json_body(json!({"accessToken": ACCESS_TOKEN}));
    });
    let products = server.mock(|when, then| {
        when.method(GET).path(PRODUCTS_PATH);
        then.status(200).json_body(json!([{"_id": "p1"}]));
    });
    let product = server.mock(|when, then| {
        when.method(GET).path(PRODUCT_PATH);
        then.status(200).json_body(json!({"_id": "p1"}));
    });
    let cart_view = server.mock(|when, then| {
        when.method(GET).path(CART_VIEW_PATH);
        then.status(200).json_body(json!({"items": []}));
    });

    let configuration = common::build_configuration(&server, vec!["--iterations", "2"]);
    let scenario = Scenario::new("ShortFlow")
        .register_setup(storefront::signup())
        .register_setup(storefront::login())
        .register_setup(storefront::list_products())
        .register_task(storefront::get_product())
        .register_task(storefront::view_cart());

    let metrics = common::run_load_test(
        LoadTest::initialize_with_config(configuration)
            .unwrap()
            .register_scenario(scenario),
    );

    // Setup runs once per user; tasks run once per iteration.
    signup.assert_hits(1);
    login.assert_hits(1);
    products.assert_hits(1);
    product.assert_hits(2);
    cart_view.assert_hits(2);

    assert_eq!(metrics.users_stopped, 1);
    assert_eq!(metrics.total_iterations, 2);
}
