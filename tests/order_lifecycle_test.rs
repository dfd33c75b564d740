mod common;

use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

use checkout_api::entities::{
    order::{OrderStatus, StatusUpdateSource},
    product,
};
use checkout_api::errors::ServiceError;
use checkout_api::services::{
    cart_splitter::{self, SplitItem},
    orders::{OrderService, TransitionFields},
    payments::PaymentMethodKind,
};

async fn service_with_order(
    payment_method: PaymentMethodKind,
) -> (OrderService, i64, std::sync::Arc<sea_orm::DatabaseConnection>) {
    let db = common::setup_db().await;
    let service = OrderService::new(db.clone(), common::event_sender());

    let specs = common::specifications(&[(7, 18, "standard", 2000, 2000)]);
    let product = common::insert_product(&db, "Tasse", dec!(100), dec!(50), false, None, specs).await;

    let user_id = Uuid::new_v4();
    let address = common::insert_address(&db, user_id).await;

    let items = vec![SplitItem::from_product(&product, dec!(2))];
    let outcome = cart_splitter::split(items, None).unwrap();
    let order = service
        .create_from_suborder(user_id, &address, &outcome.suborders[0], payment_method)
        .await
        .unwrap();

    (service, order.order_number, db)
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn online_order_settles_through_pending_and_confirmed() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CardGateway).await;

    let order = service.get_by_order_number(order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(!order.is_paid);

    let outcome = service
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
    assert!(outcome.changed);
    assert_eq!(outcome.old_status, OrderStatus::Pending);
    assert_eq!(outcome.order.status, OrderStatus::Confirmed);
    assert!(outcome.order.is_paid);
    assert_eq!(outcome.order.version, 2);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn cod_order_starts_draft_and_needs_an_operator() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CashOnDelivery).await;

    let order = service.get_by_order_number(order_number).await.unwrap();
    assert_eq!(order.status, OrderStatus::Draft);

    let outcome = service
        .transition(
            order_number,
            OrderStatus::Confirmed,
            TransitionFields::default(),
            StatusUpdateSource::Admin,
        )
        .await
        .unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn shipping_requires_tracking_information() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CardGateway).await;
    service
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

    let err = service
        .transition(
            order_number,
            OrderStatus::Shipped,
            TransitionFields::default(),
            StatusUpdateSource::Admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    // A shipment date alone does not satisfy the tracking requirement.
    let err = service
        .transition(
            order_number,
            OrderStatus::Shipped,
            TransitionFields {
                shipped_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
            StatusUpdateSource::Admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ValidationError(_)));

    let outcome = service
        .transition(
            order_number,
            OrderStatus::Shipped,
            TransitionFields {
                tracking_number: Some(Some("TRK-9".to_string())),
                ..Default::default()
            },
            StatusUpdateSource::Admin,
        )
        .await
        .unwrap();
    assert_eq!(outcome.order.tracking_number.as_deref(), Some("TRK-9"));
    assert!(outcome.order.shipped_at.is_some());
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn delivered_is_terminal() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CardGateway).await;
    for (to, fields) in [
        (
            OrderStatus::Confirmed,
            TransitionFields {
                is_paid: Some(true),
                ..Default::default()
            },
        ),
        (
            OrderStatus::Shipped,
            TransitionFields {
                tracking_number: Some(None),
                ..Default::default()
            },
        ),
        (OrderStatus::Delivered, TransitionFields::default()),
    ] {
        service
            .transition(order_number, to, fields, StatusUpdateSource::Webhook)
            .await
            .unwrap();
    }

    let err = service
        .transition(
            order_number,
            OrderStatus::Cancelled,
            TransitionFields::default(),
            StatusUpdateSource::Admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidTransition(_)));
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn repeating_the_current_status_is_a_no_op() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CardGateway).await;

    let outcome = service
        .transition(
            order_number,
            OrderStatus::Pending,
            TransitionFields::default(),
            StatusUpdateSource::Webhook,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.order.version, 1);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn draft_downgrade_after_payment_is_ignored() {
    let (service, order_number, _db) = service_with_order(PaymentMethodKind::CardGateway).await;
    service
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

    let outcome = service
        .transition(
            order_number,
            OrderStatus::Draft,
            TransitionFields::default(),
            StatusUpdateSource::Webhook,
        )
        .await
        .unwrap();
    assert!(!outcome.changed);
    assert_eq!(outcome.order.status, OrderStatus::Confirmed);
}

#[tokio::test]
#[ignore = "database-backed; run with --ignored"]
async fn stock_is_reserved_once_and_released_once() {
    let (service, order_number, db) = service_with_order(PaymentMethodKind::CardGateway).await;
    let order = service.get_by_order_number(order_number).await.unwrap();
    let item = service.get_items(order.id).await.unwrap().remove(0);

    service.reserve_stock(&order).await.unwrap();
    let stocked = product::Entity::find_by_id(item.product_id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stocked.stock, dec!(48));

    // A second reserve on the same order must not double-decrement.
    let order = service.get_by_order_number(order_number).await.unwrap();
    service.reserve_stock(&order).await.unwrap();
    let stocked = product::Entity::find_by_id(item.product_id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stocked.stock, dec!(48));

    let order = service.get_by_order_number(order_number).await.unwrap();
    service.release_stock(&order).await.unwrap();
    let order = service.get_by_order_number(order_number).await.unwrap();
    service.release_stock(&order).await.unwrap();
    let stocked = product::Entity::find_by_id(item.product_id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stocked.stock, dec!(50));
}
