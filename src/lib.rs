use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod oauth;
pub mod services;
pub mod webhooks;

use config::AppConfig;
use events::EventSender;
use services::{
    checkout::CheckoutService,
    inventory_sync::{CatalogSyncGuard, InventorySyncService},
    orders::OrderService,
    payments::PaymentProviders,
};
use webhooks::WebhookDedup;

/// Service layer handles shared by every request.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub inventory: Arc<InventorySyncService>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub config: Arc<AppConfig>,
    pub services: AppServices,
    pub providers: PaymentProviders,
    pub webhook_dedup: Arc<WebhookDedup>,
    pub catalog_sync_guard: Arc<CatalogSyncGuard>,
    pub event_sender: EventSender,
}

impl AppState {
    pub fn new(db: db::DbPool, config: AppConfig, event_sender: EventSender) -> Self {
        let db = Arc::new(db);
        let config = Arc::new(config);
        let http = reqwest::Client::new();

        let providers = PaymentProviders::from_config(&config, http.clone());
        let orders = Arc::new(OrderService::new(db.clone(), event_sender.clone()));
        let inventory = Arc::new(InventorySyncService::new(
            db.clone(),
            http,
            config.b2b.clone(),
            orders.clone(),
            event_sender.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            orders.clone(),
            inventory.clone(),
            providers.clone(),
            config.clone(),
            event_sender.clone(),
        ));

        let webhook_dedup = Arc::new(WebhookDedup::new(Duration::from_secs(
            config.webhook_dedup_ttl_secs,
        )));
        let catalog_sync_guard = Arc::new(CatalogSyncGuard::new(Duration::from_secs(
            config.b2b.catalog_sync_cooldown_secs,
        )));

        Self {
            db,
            config,
            services: AppServices {
                orders,
                checkout,
                inventory,
            },
            providers,
            webhook_dedup,
            catalog_sync_guard,
            event_sender,
        }
    }
}

/// Builds the full application router with its middleware stack.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/cart/checkout", post(handlers::checkout::checkout))
        .route("/orders/:order_number", get(handlers::orders::get_order))
        .route(
            "/orders/:order_number/status",
            put(handlers::orders::update_status),
        )
        .route(
            "/payment/:provider/return",
            get(handlers::payments::payment_return),
        )
        .route(
            "/payment/:provider/cancel",
            get(handlers::payments::payment_cancel),
        )
        .route(
            "/payment/:provider/webhook",
            post(handlers::payments::payment_webhook),
        )
        .route(
            "/inventory/webhooks/order-status/",
            post(handlers::b2b_webhooks::order_status),
        )
        .route(
            "/inventory/catalog-sync",
            post(handlers::b2b_webhooks::catalog_sync),
        )
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
