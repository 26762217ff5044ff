//! Canned steps and scenarios for a storefront-style target service.
//!
//! The target exposes a small e-commerce API: user signup and login, a product
//! catalog, a cart, a mock payment endpoint, and order placement. Every step
//! here is expressed against that wire contract; the
//! [`full_user_flow`] and [`browse_and_buy`] scenarios assemble them into
//! ready-to-run user journeys.

use serde_json::json;

use crate::scenario::{
    BodyPredicate, Precondition, Scenario, SelectionPolicy, StateUpdate, StepSpec,
};
use crate::LoadTestError;

use std::time::Duration;

/// `POST /api/users/signup` registering this user's generated identity.
///
/// The service returns `201 Created` for a fresh account and `200` when the
/// account already exists, both of which count as success.
pub fn signup() -> StepSpec {
    StepSpec::post(
        "Signup",
        "/api/users/signup",
        json!({
            "name": "{name}",
            "email": "{email}",
            "password": "{password}",
            "address": "{address}",
        }),
    )
    .set_expected_status(&[200, 201])
}

/// `POST /api/users/login`, storing the returned `accessToken` so every
/// subsequent request in the session carries it as a bearer token.
pub fn login() -> StepSpec {
    StepSpec::post(
        "Login",
        "/api/users/login",
        json!({
            "email": "{email}",
            "password": "{password}",
        }),
    )
    .set_predicate(BodyPredicate::HasField("accessToken".to_string()))
    .set_state_update(StateUpdate::StoreAuthToken("accessToken".to_string()))
}

/// `GET /api/products`, caching the catalog in the session for later steps.
pub fn list_products() -> StepSpec {
    StepSpec::get("List Products", "/api/products")
        .set_predicate(BodyPredicate::ArrayOfRecordsWith("_id".to_string()))
        .set_state_update(StateUpdate::StoreCatalog)
}

/// `GET /api/products/{id}` for a randomly selected cached product. Skipped
/// when the catalog is empty.
pub fn get_product() -> StepSpec {
    StepSpec::get("Get Product", "/api/products/{product_id}")
        .set_precondition(Precondition::NonEmptyCatalog)
}

/// `POST /api/cart/add` for a randomly selected cached product. Skipped when
/// the catalog is empty.
pub fn add_to_cart() -> StepSpec {
    StepSpec::post(
        "Add To Cart",
        "/api/cart/add",
        json!({
            "productId": "{product_id}",
            "quantity": 1,
        }),
    )
    .set_precondition(Precondition::NonEmptyCatalog)
}

/// `GET /api/cart/view`.
pub fn view_cart() -> StepSpec {
    StepSpec::get("View Cart", "/api/cart/view")
}

/// `POST /api/payment/mock-payment` with a fixed test card.
pub fn mock_payment() -> StepSpec {
    StepSpec::post(
        "Mock Payment",
        "/api/payment/mock-payment",
        json!({
            "nameOnCard": "Load Tester",
            "cardNumber": "4111111111111111",
            "expiry": "12/30",
            "cvv": "123",
            "amount": 1099,
        }),
    )
}

/// `POST /api/orders/place` with fixed shipping details. When
/// `payment_method_id` is set it is forwarded alongside the shipping info,
/// matching targets that settle through a stored payment method instead of
/// the mock payment endpoint.
pub fn place_order(payment_method_id: Option<&str>) -> StepSpec {
    let mut payload = json!({
        "shippingInfo": {
            "name": "Load Test",
            "address": "123 Test Lane",
            "city": "Testville",
            "postalCode": "00000",
            "country": "Testland",
        },
    });
    if let Some(payment_method_id) = payment_method_id {
        payload["paymentMethodId"] = json!(payment_method_id);
    }
    StepSpec::post("Place Order", "/api/orders/place", payload).set_expected_status(&[200, 201])
}

/// The complete storefront journey: sign up a generated identity, log in,
/// cache the catalog, then cycle through browse, cart, payment and order
/// placement in strict order, thinking 1 to 3 seconds between steps.
pub fn full_user_flow() -> Result<Scenario, LoadTestError> {
    Ok(Scenario::new("FullUserFlow")
        .register_setup(signup())
        .register_setup(login())
        .register_setup(list_products())
        .register_task(get_product())
        .register_task(add_to_cart())
        .register_task(view_cart())
        .register_task(mock_payment())
        .register_task(place_order(Some("pm_card_visa")))
        .set_wait_time(Duration::from_secs(1), Duration::from_secs(3))?)
}

/// A weighted variant of the storefront journey: the same setup chain, then
/// each iteration picks one step at random, favoring browsing over buying the
/// way real traffic does.
pub fn browse_and_buy() -> Result<Scenario, LoadTestError> {
    Ok(Scenario::new("BrowseAndBuy")
        .set_selection_policy(SelectionPolicy::WeightedRandom)
        .register_setup(signup())
        .register_setup(login())
        .register_setup(list_products())
        .register_task(get_product().set_weight(4))
        .register_task(add_to_cart().set_weight(2))
        .register_task(view_cart().set_weight(2))
        .register_task(mock_payment().set_weight(1))
        .register_task(place_order(None).set_weight(1))
        .set_wait_time(Duration::from_secs(1), Duration::from_secs(3))?)
}
