use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    entities::{
        cart::{self, CartStatus},
        cart_item, order,
        order::{OrderStatus, StatusUpdateSource},
        payment_session, product, shipping_address,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cart_splitter::{self, SplitItem},
        inventory_sync::InventorySyncService,
        orders::{validate_items, OrderService, TransitionFields},
        payments::{
            NotificationResult, PaymentAdapter, PaymentMethodKind, PaymentProviders,
            SessionStatus, SessionUrls,
        },
    },
};

/// One created order in a checkout response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutOrderSummary {
    pub order_id: Uuid,
    pub order_number: i64,
    pub site_configuration: i64,
    #[schema(value_type = String)]
    pub shipping_cost: Decimal,
    #[schema(value_type = String)]
    pub total: Decimal,
    pub payment_method: String,
    /// Present for online payment methods only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutResponse {
    /// True when the cart produced more than one order
    pub split: bool,
    pub orders: Vec<CheckoutOrderSummary>,
}

/// Runs the checkout pipeline: lock cart, validate, split, create orders,
/// reserve stock, open payment sessions. Any failure after the first order
/// is created rolls the whole attempt back.
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderService>,
    inventory: Arc<InventorySyncService>,
    providers: PaymentProviders,
    config: Arc<AppConfig>,
    event_sender: EventSender,
}

struct CreatedOrder {
    order: order::Model,
    session: Option<payment_session::Model>,
    checkout_url: Option<String>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<OrderService>,
        inventory: Arc<InventorySyncService>,
        providers: PaymentProviders,
        config: Arc<AppConfig>,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            orders,
            inventory,
            providers,
            config,
            event_sender,
        }
    }

    #[instrument(skip(self), fields(%user_id, %payment_method))]
    pub async fn checkout(
        &self,
        user_id: Uuid,
        payment_method: PaymentMethodKind,
        shipping_address_id: Uuid,
        preferred_shipping_method_id: Option<i64>,
    ) -> Result<CheckoutResponse, ServiceError> {
        let address = shipping_address::Entity::find_by_id(shipping_address_id)
            .filter(shipping_address::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or(ServiceError::AddressRequired)?;

        let cart = self.lock_cart(user_id).await?;

        // Past this point the cart is Converting and must be restored on
        // any failure.
        let result = self
            .run_pipeline(user_id, &cart, &address, payment_method, preferred_shipping_method_id)
            .await;

        match result {
            Ok(response) => {
                self.finish_cart(&cart).await?;
                self.event_sender
                    .send(Event::CheckoutCompleted {
                        user_id,
                        order_numbers: response.orders.iter().map(|o| o.order_number).collect(),
                        split: response.split,
                    })
                    .await;
                Ok(response)
            }
            Err(err) => {
                self.restore_cart(&cart).await;
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        user_id: Uuid,
        cart: &cart::Model,
        address: &shipping_address::Model,
        payment_method: PaymentMethodKind,
        preferred_shipping_method_id: Option<i64>,
    ) -> Result<CheckoutResponse, ServiceError> {
        let lines = self.load_cart_lines(cart.id).await?;
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation("cart is empty".into()));
        }

        let errors = validate_items(&lines);
        if !errors.is_empty() {
            return Err(ServiceError::CartInvalid(errors));
        }

        let subtotal: Decimal = lines.iter().map(|(p, q)| p.price * q).sum();
        let adapter = self.providers.adapter(payment_method);
        if !adapter.is_available(subtotal) {
            return Err(ServiceError::ProviderUnavailable(
                payment_method.to_string(),
            ));
        }

        let split_items: Vec<SplitItem> = lines
            .iter()
            .map(|(p, q)| SplitItem::from_product(p, *q))
            .collect();
        let outcome = cart_splitter::split(split_items, preferred_shipping_method_id)?;

        let mut created: Vec<CreatedOrder> = Vec::with_capacity(outcome.suborders.len());
        for (index, suborder) in outcome.suborders.iter().enumerate() {
            match self
                .create_one(user_id, address, suborder, payment_method, adapter)
                .await
            {
                Ok(one) => created.push(one),
                Err(err) => {
                    error!(%user_id, error = %err, "checkout failed, rolling back");
                    let rolled_back = self.rollback(user_id, created).await;
                    return Err(ServiceError::CheckoutFailed {
                        failed_index: index,
                        rolled_back,
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(CheckoutResponse {
            split: outcome.split,
            orders: created
                .into_iter()
                .map(|c| CheckoutOrderSummary {
                    order_id: c.order.id,
                    order_number: c.order.order_number,
                    site_configuration: c.order.site_configuration_id,
                    shipping_cost: c.order.shipping_cost,
                    total: c.order.total,
                    payment_method: c.order.payment_method.clone(),
                    checkout_url: c.checkout_url,
                })
                .collect(),
        })
    }

    async fn create_one(
        &self,
        user_id: Uuid,
        address: &shipping_address::Model,
        suborder: &cart_splitter::SubOrder,
        payment_method: PaymentMethodKind,
        adapter: &dyn PaymentAdapter,
    ) -> Result<CreatedOrder, ServiceError> {
        let order = self
            .orders
            .create_from_suborder(user_id, address, suborder, payment_method)
            .await?;
        self.orders.reserve_stock(&order).await?;

        if !payment_method.is_online() {
            return Ok(CreatedOrder {
                order,
                session: None,
                checkout_url: None,
            });
        }

        let items = self.orders.get_items(order.id).await?;
        let urls = SessionUrls::for_order(
            &self.config.public_base_url,
            payment_method,
            order.order_number,
        );
        let created = adapter
            .create_session(&order, &items, &urls)
            .await
            .map_err(|e| ServiceError::PaymentFailed(e.to_string()))?;

        let session = payment_session::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order.order_number),
            provider: Set(payment_method.as_str().to_string()),
            pay_token: Set(created.pay_token.clone()),
            notif_token: Set(created.notif_token.clone()),
            payment_url: Set(created.payment_url.clone()),
            expires_at: Set(created.expires_at),
            created_at: Set(chrono::Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        let mut metadata = order.parsed_metadata();
        metadata.payment_session_id = Some(session.id);
        self.orders
            .update_metadata(order.order_number, &metadata)
            .await?;

        let checkout_url = Some(created.payment_url);
        Ok(CreatedOrder {
            order,
            session: Some(session),
            checkout_url,
        })
    }

    /// Undoes a partially-completed checkout: created orders are cancelled,
    /// their stock released, their provider sessions closed. Best effort on
    /// external calls, mandatory on local state. Returns the order numbers
    /// that were rolled back.
    async fn rollback(&self, user_id: Uuid, created: Vec<CreatedOrder>) -> Vec<i64> {
        let mut cancelled = Vec::with_capacity(created.len());
        for item in created {
            let order_number = item.order.order_number;

            if let Err(err) = self
                .orders
                .transition(
                    order_number,
                    OrderStatus::Cancelled,
                    TransitionFields::default(),
                    StatusUpdateSource::Orchestrator,
                )
                .await
            {
                error!(order_number, error = %err, "rollback: cancel failed");
            }
            match self.orders.get_by_order_number(order_number).await {
                Ok(fresh) => {
                    if let Err(err) = self.orders.release_stock(&fresh).await {
                        error!(order_number, error = %err, "rollback: stock release failed");
                    }
                }
                Err(err) => error!(order_number, error = %err, "rollback: reload failed"),
            }

            if let Some(session) = item.session {
                if let Some(kind) = PaymentMethodKind::parse(&session.provider) {
                    if let Err(err) = self.providers.adapter(kind).cancel(&session).await {
                        warn!(order_number, error = %err, "rollback: provider cancel failed");
                    }
                }
                if let Err(err) = payment_session::Entity::delete_by_id(session.id)
                    .exec(&*self.db)
                    .await
                {
                    error!(order_number, error = %err, "rollback: session delete failed");
                }
            }
            cancelled.push(order_number);
        }

        self.event_sender
            .send(Event::CheckoutRolledBack {
                user_id,
                cancelled_order_numbers: cancelled.clone(),
            })
            .await;
        cancelled
    }

    /// Applies a verified provider notification to the order it names.
    /// Success settles the order; failure or expiry cancels it and frees
    /// its stock. A repeat of the terminal outcome is ignored upstream by
    /// the replay dedup, and here by the no-op transition.
    #[instrument(skip(self, result), fields(order_number = result.order_number, status = ?result.status))]
    pub async fn apply_payment_event(
        &self,
        provider: PaymentMethodKind,
        result: &NotificationResult,
    ) -> Result<(), ServiceError> {
        match result.status {
            SessionStatus::Success => {
                let outcome = self
                    .orders
                    .transition(
                        result.order_number,
                        OrderStatus::Confirmed,
                        TransitionFields {
                            is_paid: Some(true),
                            ..Default::default()
                        },
                        StatusUpdateSource::Webhook,
                    )
                    .await?;
                self.delete_session(result.order_number).await?;

                if outcome.changed {
                    self.event_sender
                        .send(Event::PaymentConfirmed {
                            order_number: result.order_number,
                            provider: provider.as_str().to_string(),
                        })
                        .await;

                    // Sale push failures are retryable and must not turn a
                    // settled payment into a webhook error.
                    if let Err(err) = self.inventory.push(&outcome.order).await {
                        warn!(
                            order_number = result.order_number,
                            error = %err,
                            "B2B push deferred after payment"
                        );
                    }
                }
            }
            SessionStatus::Failed | SessionStatus::Expired => {
                let outcome = self
                    .orders
                    .transition(
                        result.order_number,
                        OrderStatus::Cancelled,
                        TransitionFields::default(),
                        StatusUpdateSource::Webhook,
                    )
                    .await?;
                if outcome.changed {
                    self.orders.release_stock(&outcome.order).await?;
                }
                self.delete_session(result.order_number).await?;
                info!(order_number = result.order_number, "payment did not complete");
            }
            SessionStatus::Pending => {}
        }
        Ok(())
    }

    /// Shopper backed out of the provider flow. Cancels the order, frees
    /// its stock and closes the session. An order the provider already
    /// settled is left alone: the webhook outranks the browser.
    #[instrument(skip(self))]
    pub async fn abandon(
        &self,
        provider: PaymentMethodKind,
        order_number: i64,
    ) -> Result<(), ServiceError> {
        let order = self.orders.get_by_order_number(order_number).await?;
        if order.is_paid || order.status != OrderStatus::Pending {
            info!(order_number, status = %order.status, "abandon ignored, order already settled");
            return Ok(());
        }

        if let Some(session) = self.find_session(order_number).await? {
            if let Err(err) = self.providers.adapter(provider).cancel(&session).await {
                warn!(order_number, error = %err, "provider cancel failed on abandon");
            }
        }

        let outcome = self
            .orders
            .transition(
                order_number,
                OrderStatus::Cancelled,
                TransitionFields::default(),
                StatusUpdateSource::Orchestrator,
            )
            .await?;
        if outcome.changed {
            self.orders.release_stock(&outcome.order).await?;
        }
        self.delete_session(order_number).await?;
        Ok(())
    }

    pub async fn find_session(
        &self,
        order_number: i64,
    ) -> Result<Option<payment_session::Model>, ServiceError> {
        Ok(payment_session::Entity::find()
            .filter(payment_session::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?)
    }

    async fn delete_session(&self, order_number: i64) -> Result<(), ServiceError> {
        payment_session::Entity::delete_many()
            .filter(payment_session::Column::OrderNumber.eq(order_number))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn load_cart_lines(
        &self,
        cart_id: Uuid,
    ) -> Result<Vec<(product::Model, Decimal)>, ServiceError> {
        let items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .all(&*self.db)
            .await?;

        let product_ids: Vec<_> = items.iter().map(|i| i.product_id).collect();
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(product_ids))
            .all(&*self.db)
            .await?;

        items
            .into_iter()
            .map(|item| {
                let product = products
                    .iter()
                    .find(|p| p.id == item.product_id)
                    .cloned()
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("product {} not found", item.product_id))
                    })?;
                Ok((product, item.quantity))
            })
            .collect()
    }

    /// Atomically flips the user's active cart to Converting. A second
    /// concurrent checkout loses the swap and gets a conflict.
    async fn lock_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        let cart = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::InvalidOperation("no active cart".into()))?;

        let locked = cart::Entity::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Converting))
            .col_expr(cart::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(cart::Column::Id.eq(cart.id))
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .exec(&*self.db)
            .await?;
        if locked.rows_affected == 0 {
            return Err(ServiceError::Conflict(
                "checkout already in progress".into(),
            ));
        }
        Ok(cart)
    }

    /// Empties the cart and reopens it. Runs only after every sub-order
    /// succeeded.
    async fn finish_cart(&self, cart: &cart::Model) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(&txn)
            .await?;
        cart::Entity::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Active))
            .col_expr(cart::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(cart::Column::Id.eq(cart.id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn restore_cart(&self, cart: &cart::Model) {
        let restored = cart::Entity::update_many()
            .col_expr(cart::Column::Status, Expr::value(CartStatus::Active))
            .col_expr(cart::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
            .filter(cart::Column::Id.eq(cart.id))
            .exec(&*self.db)
            .await;
        if let Err(err) = restored {
            error!(cart_id = %cart.id, error = %err, "failed to restore cart after rollback");
        }
    }
}
