#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema, Set,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use checkout_api::entities::{
    cart::{self, CartStatus},
    cart_item, external_product_mapping,
    external_product_mapping::MappingSyncStatus,
    order, order_item, payment_session, product, shipping_address,
};
use checkout_api::events;

/// Fresh in-memory database with the full schema. A single pooled
/// connection keeps every statement on the same memory database.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).sqlx_logging(false);
    let db = Database::connect(options).await.expect("connect sqlite");

    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let statements = [
        schema.create_table_from_entity(product::Entity),
        schema.create_table_from_entity(cart::Entity),
        schema.create_table_from_entity(cart_item::Entity),
        schema.create_table_from_entity(shipping_address::Entity),
        schema.create_table_from_entity(order::Entity),
        schema.create_table_from_entity(order_item::Entity),
        schema.create_table_from_entity(payment_session::Entity),
        schema.create_table_from_entity(external_product_mapping::Entity),
    ];
    for statement in statements {
        db.execute(backend.build(&statement)).await.expect("create table");
    }

    Arc::new(db)
}

pub fn event_sender() -> events::EventSender {
    events::start()
}

/// Configuration for tests that never leave the process. External base
/// URLs point at a reserved-for-documentation host.
pub fn test_config() -> checkout_api::config::AppConfig {
    use checkout_api::config::{AppConfig, B2bConfig, CardGatewayConfig, MobileMoneyConfig};

    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        environment: "test".to_string(),
        log_level: "debug".to_string(),
        log_json: false,
        currency: "DZD".to_string(),
        currency_exponent: 2,
        public_base_url: "https://shop.example".to_string(),
        webhook_dedup_ttl_secs: 60,
        card_gateway: CardGatewayConfig {
            base_url: "https://cards.example".to_string(),
            api_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            webhook_tolerance_secs: 300,
            session_timeout_secs: 15,
        },
        mobile_money: MobileMoneyConfig {
            base_url: "https://wallet.example".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            merchant_id: "m-001".to_string(),
            token_timeout_secs: 30,
            session_timeout_secs: 15,
        },
        b2b: B2bConfig {
            base_url: "https://b2b.example".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            api_keys: vec!["key-live-1".to_string()],
            default_site_configuration: 18,
            token_timeout_secs: 30,
            request_timeout_secs: 15,
            catalog_sync_cooldown_secs: 600,
        },
    }
}

/// Specifications blob carrying one or more delivery methods, shaped the
/// way the catalog stores them.
pub fn specifications(methods: &[(i64, i64, &str, i64, i64)]) -> serde_json::Value {
    json!({
        "delivery_methods": methods
            .iter()
            .map(|(id, site, slug, base, effective)| {
                json!({
                    "id": id,
                    "site_configuration": site,
                    "slug": slug,
                    "base_price": base,
                    "effective_price": effective,
                })
            })
            .collect::<Vec<_>>()
    })
}

pub async fn insert_product(
    db: &DatabaseConnection,
    title: &str,
    price: Decimal,
    stock: Decimal,
    sold_by_weight: bool,
    weight_unit: Option<&str>,
    specifications: serde_json::Value,
) -> product::Model {
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        title: Set(title.to_string()),
        price: Set(price),
        stock: Set(stock),
        is_available: Set(true),
        sold_by_weight: Set(sold_by_weight),
        weight_unit: Set(weight_unit.map(str::to_string)),
        is_salam: Set(false),
        specifications: Set(Some(specifications)),
    }
    .insert(db)
    .await
    .expect("insert product")
}

pub async fn insert_cart_with_items(
    db: &DatabaseConnection,
    user_id: Uuid,
    items: &[(&product::Model, Decimal)],
) -> cart::Model {
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        status: Set(CartStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert cart");

    for (product, quantity) in items {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            product_id: Set(product.id),
            quantity: Set(*quantity),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("insert cart item");
    }
    cart
}

pub async fn insert_address(db: &DatabaseConnection, user_id: Uuid) -> shipping_address::Model {
    shipping_address::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        recipient_name: Set("Amina K.".to_string()),
        line1: Set("12 Rue des Oliviers".to_string()),
        line2: Set(None),
        city: Set("Algiers".to_string()),
        postal_code: Set(Some("16000".to_string())),
        country_code: Set("DZ".to_string()),
        phone: Set(Some("+213550000000".to_string())),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("insert address")
}

pub async fn insert_b2b_mapping(
    db: &DatabaseConnection,
    product_id: Uuid,
    external_product_id: i64,
) -> external_product_mapping::Model {
    let now = Utc::now();
    external_product_mapping::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        external_product_id: Set(external_product_id),
        is_b2b: Set(true),
        sync_status: Set(MappingSyncStatus::Synced),
        last_synced_at: Set(Some(now)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert mapping")
}
