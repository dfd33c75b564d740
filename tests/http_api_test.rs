mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, EncodingKey, Header};
use rust_decimal_macros::dec;
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use checkout_api::auth::Claims;
use checkout_api::entities::order::{OrderStatus, StatusUpdateSource};
use checkout_api::services::{
    cart_splitter::{self, SplitItem},
    orders::TransitionFields,
    payments::PaymentMethodKind,
};
use checkout_api::{app_router, AppState};

async fn state() -> AppState {
    // Cloning a connection shares the underlying pool.
    let db = common::setup_db().await;
    AppState::new((*db).clone(), common::test_config(), common::event_sender())
}

fn bearer(state: &AppState, user_id: Uuid, is_admin: bool) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
        is_admin,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.jwt_secret.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

async fn seed_card_order(state: &AppState, user_id: Uuid) -> i64 {
    let specs = common::specifications(&[(7, 18, "standard", 2000, 2000)]);
    let product =
        common::insert_product(&state.db, "Tasse", dec!(100), dec!(10), false, None, specs).await;
    let address = common::insert_address(&state.db, user_id).await;

    let items = vec![SplitItem::from_product(&product, dec!(2))];
    let outcome = cart_splitter::split(items, None).unwrap();
    let order = state
        .services
        .orders
        .create_from_suborder(
            user_id,
            &address,
            &outcome.suborders[0],
            PaymentMethodKind::CardGateway,
        )
        .await
        .unwrap();
    order.order_number
}

fn signed_card_webhook(secret: &str, event_id: &str, order_number: i64) -> Request<Body> {
    let body = format!(
        r#"{{"id":"{}","type":"checkout.session.completed","data":{{"reference":"{}"}}}}"#,
        event_id, order_number
    );
    let timestamp = Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    Request::builder()
        .method("POST")
        .uri("/payment/card_gateway/webhook")
        .header("content-type", "application/json")
        .header("x-gateway-signature", signature)
        .header("x-gateway-timestamp", timestamp.to_string())
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn health_reports_ok() {
    let app = app_router(state().await);
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn card_webhook_settles_the_order_and_replay_is_acknowledged() {
    let state = state().await;
    let user_id = Uuid::new_v4();
    let order_number = seed_card_order(&state, user_id).await;
    let secret = state.config.card_gateway.webhook_secret.clone();
    let app = app_router(state.clone());

    let response = app
        .clone()
        .oneshot(signed_card_webhook(&secret, "evt_1", order_number))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let order = state
        .services
        .orders
        .get_by_order_number(order_number)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert!(order.is_paid);

    // Redelivery of the same event id is acknowledged without effect.
    let response = app
        .oneshot(signed_card_webhook(&secret, "evt_1", order_number))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn unsigned_card_webhook_is_rejected() {
    let app = app_router(state().await);
    let response = app
        .oneshot(
            Request::post("/payment/card_gateway/webhook")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn b2b_webhook_requires_a_known_api_key() {
    let app = app_router(state().await);
    let body = r#"{"external_sale_id":900,"order_number":1,"status":"shipped"}"#;

    let response = app
        .clone()
        .oneshot(
            Request::post("/inventory/webhooks/order-status/")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::post("/inventory/webhooks/order-status/")
                .header("content-type", "application/json")
                .header("x-api-key", "key-revoked")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn cancel_url_cancels_a_pending_order_but_not_a_settled_one() {
    let state = state().await;
    let user_id = Uuid::new_v4();
    let order_number = seed_card_order(&state, user_id).await;
    let app = app_router(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::get(format!(
                "/payment/card_gateway/cancel?order={}",
                order_number
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    let order = state
        .services
        .orders
        .get_by_order_number(order_number)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);

    // A webhook got there first: the cancel link changes nothing.
    let settled = seed_card_order(&state, user_id).await;
    state
        .services
        .orders
        .transition(
            settled,
            OrderStatus::Confirmed,
            TransitionFields {
                is_paid: Some(true),
                ..Default::default()
            },
            StatusUpdateSource::Webhook,
        )
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::get(format!("/payment/card_gateway/cancel?order={}", settled))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let order = state
        .services
        .orders
        .get_by_order_number(settled)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn order_readback_is_owner_scoped() {
    let state = state().await;
    let owner = Uuid::new_v4();
    let order_number = seed_card_order(&state, owner).await;
    let app = app_router(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/orders/{}", order_number))
                .header("authorization", bearer(&state, owner, false))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Another user sees a 404, not a 403.
    let response = app
        .oneshot(
            Request::get(format!("/orders/{}", order_number))
                .header("authorization", bearer(&state, Uuid::new_v4(), false))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn operator_confirms_a_cod_order() {
    let state = state().await;
    let user_id = Uuid::new_v4();

    let specs = common::specifications(&[(7, 18, "standard", 2000, 2000)]);
    let product =
        common::insert_product(&state.db, "Tasse", dec!(100), dec!(10), false, None, specs).await;
    let address = common::insert_address(&state.db, user_id).await;
    let items = vec![SplitItem::from_product(&product, dec!(1))];
    let outcome = cart_splitter::split(items, None).unwrap();
    let order = state
        .services
        .orders
        .create_from_suborder(
            user_id,
            &address,
            &outcome.suborders[0],
            PaymentMethodKind::CashOnDelivery,
        )
        .await
        .unwrap();

    let app = app_router(state.clone());

    // A non-operator caller is refused.
    let response = app
        .clone()
        .oneshot(
            Request::put(format!("/orders/{}/status", order.order_number))
                .header("authorization", bearer(&state, user_id, false))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"status":"confirmed"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::put(format!("/orders/{}/status", order.order_number))
                .header("authorization", bearer(&state, Uuid::new_v4(), true))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"status":"confirmed"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let confirmed = state
        .services
        .orders
        .get_by_order_number(order.order_number)
        .await
        .unwrap();
    assert_eq!(confirmed.status, OrderStatus::Confirmed);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn draft_downgrade_is_ignored_over_http_too() {
    let state = state().await;
    let user_id = Uuid::new_v4();
    let order_number = seed_card_order(&state, user_id).await;
    state
        .services
        .orders
        .transition(
            order_number,
            OrderStatus::Confirmed,
            TransitionFields {
                is_paid: Some(true),
                ..Default::default()
            },
            StatusUpdateSource::Webhook,
        )
        .await
        .unwrap();

    let app = app_router(state.clone());
    let body = format!(
        r#"{{"external_sale_id":900,"order_number":{},"status":"draft"}}"#,
        order_number
    );
    let response = app
        .oneshot(
            Request::post("/inventory/webhooks/order-status/")
                .header("content-type", "application/json")
                .header("x-api-key", "key-live-1")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let order = state
        .services
        .orders
        .get_by_order_number(order_number)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
}
