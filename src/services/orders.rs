use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, OrderMetadata, OrderStatus, StatusUpdateSource},
        order_item, product,
        shipping_address,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{cart_splitter::SubOrder, payments::PaymentMethodKind},
};

/// Optional fields a transition may carry (from a webhook or an admin).
#[derive(Debug, Default, Clone)]
pub struct TransitionFields {
    /// `Some(None)` means "explicitly no tracking number"
    pub tracking_number: Option<Option<String>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub is_paid: Option<bool>,
}

/// Result of a transition request.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub order: order::Model,
    pub old_status: OrderStatus,
    /// False when the request was idempotently or deliberately ignored
    pub changed: bool,
}

/// Declared edges of the order state machine. Anything not listed is
/// rejected with `INVALID_TRANSITION`.
const TRANSITIONS: &[(OrderStatus, OrderStatus)] = &[
    (OrderStatus::Draft, OrderStatus::Pending),
    (OrderStatus::Draft, OrderStatus::Confirmed),
    (OrderStatus::Draft, OrderStatus::Cancelled),
    (OrderStatus::Pending, OrderStatus::Confirmed),
    (OrderStatus::Pending, OrderStatus::Cancelled),
    (OrderStatus::Confirmed, OrderStatus::Pending),
    (OrderStatus::Confirmed, OrderStatus::Shipped),
    (OrderStatus::Confirmed, OrderStatus::Cancelled),
    (OrderStatus::Shipped, OrderStatus::Delivered),
];

pub fn transition_allowed(from: OrderStatus, to: OrderStatus) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// A transition request to DRAFT is ignored once payment happened or the
/// order progressed past PENDING. Prevents B2B-originated regressions.
pub fn suppress_draft_downgrade(current: OrderStatus, is_paid: bool, to: OrderStatus) -> bool {
    to == OrderStatus::Draft
        && (is_paid
            || matches!(
                current,
                OrderStatus::Confirmed | OrderStatus::Shipped | OrderStatus::Delivered
            ))
}

/// Persists orders and drives their state machine.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Creates one order from a cart-split sub-order. Atomic: the order
    /// row and all its items persist together or not at all.
    #[instrument(skip(self, address, suborder), fields(user_id = %user_id, site = suborder.site_configuration_id))]
    pub async fn create_from_suborder(
        &self,
        user_id: Uuid,
        address: &shipping_address::Model,
        suborder: &SubOrder,
        payment_method: PaymentMethodKind,
    ) -> Result<order::Model, ServiceError> {
        if suborder.items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "sub-order has no items".into(),
            ));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = next_order_number(&txn).await?;

        // Deferred payment starts in DRAFT, online payment in PENDING.
        let initial_status = if payment_method.is_online() {
            OrderStatus::Pending
        } else {
            OrderStatus::Draft
        };

        let metadata = OrderMetadata {
            payment_provider: Some(payment_method.as_str().to_string()),
            last_status_update: Some(now),
            status_update_source: Some(StatusUpdateSource::Orchestrator),
            ..Default::default()
        };

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number),
            user_id: Set(user_id),
            status: Set(initial_status),
            payment_method: Set(payment_method.as_str().to_string()),
            shipping_address_id: Set(address.id),
            shipping_method_id: Set(suborder.shipping_method.method_id),
            shipping_method_slug: Set(suborder.shipping_method.slug.clone()),
            site_configuration_id: Set(suborder.site_configuration_id),
            subtotal: Set(suborder.subtotal),
            shipping_cost: Set(suborder.shipping_cost),
            total: Set(suborder.subtotal + suborder.shipping_cost),
            is_paid: Set(false),
            tracking_number: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            metadata: Set(Some(metadata.to_column())),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };
        let order = order.insert(&txn).await?;

        for item in &suborder.items {
            let row = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                title: Set(item.title.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(item.line_total()),
                sold_by_weight: Set(item.sold_by_weight),
                weight_unit: Set(item.weight_unit.map(|u| u.as_str().to_string())),
                created_at: Set(now),
            };
            row.insert(&txn).await?;
        }

        txn.commit().await?;
        info!(order_number, status = %initial_status, "order created");

        self.event_sender
            .send(Event::OrderCreated {
                order_id,
                order_number,
                user_id,
            })
            .await;

        Ok(order)
    }

    pub async fn get_by_order_number(
        &self,
        order_number: i64,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    pub async fn get_items(&self, order_id: Uuid) -> Result<Vec<order_item::Model>, ServiceError> {
        Ok(order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?)
    }

    /// Drives the state machine for one order. Linearized per order
    /// number by a compare-and-swap on the current status; repeat requests
    /// carrying the current status are ignored, not rejected.
    #[instrument(skip(self, fields), fields(order_number, to = %to, ?source))]
    pub async fn transition(
        &self,
        order_number: i64,
        to: OrderStatus,
        fields: TransitionFields,
        source: StatusUpdateSource,
    ) -> Result<TransitionOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        let current = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))?;
        let old_status = current.status;

        if to == old_status {
            txn.commit().await?;
            return Ok(TransitionOutcome {
                order: current,
                old_status,
                changed: false,
            });
        }

        if suppress_draft_downgrade(old_status, current.is_paid, to) {
            txn.commit().await?;
            info!(order_number, %old_status, "draft downgrade ignored");
            return Ok(TransitionOutcome {
                order: current,
                old_status,
                changed: false,
            });
        }

        if old_status.is_terminal() {
            return Err(ServiceError::InvalidTransition(format!(
                "order {} is {} (terminal)",
                order_number, old_status
            )));
        }

        if !transition_allowed(old_status, to) {
            return Err(ServiceError::InvalidTransition(format!(
                "{} -> {} is not a declared transition",
                old_status, to
            )));
        }

        if old_status == OrderStatus::Confirmed
            && to == OrderStatus::Shipped
            && fields.tracking_number.is_none()
        {
            return Err(ServiceError::ValidationError(
                "shipping an order requires a tracking number, or explicitly none".into(),
            ));
        }

        let now = Utc::now();
        let mut metadata = current.parsed_metadata();
        metadata.last_status_update = Some(now);
        metadata.status_update_source = Some(source);

        let mut update = order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(to))
            .col_expr(order::Column::Metadata, Expr::value(metadata.to_column()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            );

        if let Some(is_paid) = fields.is_paid {
            update = update.col_expr(order::Column::IsPaid, Expr::value(is_paid));
        }
        if let Some(tracking) = fields.tracking_number.clone() {
            update = update.col_expr(order::Column::TrackingNumber, Expr::value(tracking));
        }
        if to == OrderStatus::Shipped {
            let shipped_at = fields.shipped_at.unwrap_or(now);
            update = update.col_expr(order::Column::ShippedAt, Expr::value(Some(shipped_at)));
        } else if let Some(shipped_at) = fields.shipped_at {
            update = update.col_expr(order::Column::ShippedAt, Expr::value(Some(shipped_at)));
        }
        if to == OrderStatus::Delivered {
            let delivered_at = fields.delivered_at.unwrap_or(now);
            update = update.col_expr(order::Column::DeliveredAt, Expr::value(Some(delivered_at)));
        }

        // CAS: only wins if the status is still what we read.
        let result = update
            .filter(order::Column::OrderNumber.eq(order_number))
            .filter(order::Column::Status.eq(old_status))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            warn!(order_number, "lost transition race");
            return Err(ServiceError::ConcurrentModification(order_number));
        }

        let order = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))?;
        txn.commit().await?;

        info!(order_number, %old_status, new_status = %to, "order transitioned");
        self.event_sender
            .send(Event::OrderStatusChanged {
                order_number,
                old_status,
                new_status: to,
                source,
            })
            .await;

        Ok(TransitionOutcome {
            order,
            old_status,
            changed: true,
        })
    }

    /// Decrements stock for every unit-counted item of the order. Fails
    /// with `INSUFFICIENT_STOCK` if any decrement would go negative; in
    /// that case nothing is decremented. Sold-by-weight and salam items
    /// carry no local reservation.
    #[instrument(skip(self), fields(order_number = order.order_number))]
    pub async fn reserve_stock(&self, order: &order::Model) -> Result<(), ServiceError> {
        let mut metadata = order.parsed_metadata();
        if metadata.stock_reserved {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;

        for item in &items {
            if item.sold_by_weight {
                continue;
            }
            let product = product::Entity::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;
            if product.is_salam {
                continue;
            }

            // Conditional decrement, serialized per product row.
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(item.quantity),
                )
                .filter(product::Column::Id.eq(item.product_id))
                .filter(product::Column::Stock.gte(item.quantity))
                .exec(&txn)
                .await?;
            if result.rows_affected == 0 {
                error!(
                    order_number = order.order_number,
                    product_id = %item.product_id,
                    "stock reservation failed"
                );
                return Err(ServiceError::InsufficientStock(format!(
                    "\"{}\" no longer has {} in stock",
                    item.title, item.quantity
                )));
            }
        }

        metadata.stock_reserved = true;
        metadata.stock_released = false;
        self.write_metadata(&txn, order.order_number, &metadata)
            .await?;
        txn.commit().await?;
        Ok(())
    }

    /// Inverse of [`reserve_stock`]; idempotent.
    #[instrument(skip(self), fields(order_number = order.order_number))]
    pub async fn release_stock(&self, order: &order::Model) -> Result<(), ServiceError> {
        let mut metadata = order.parsed_metadata();
        if !metadata.stock_reserved || metadata.stock_released {
            return Ok(());
        }

        let txn = self.db.begin().await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&txn)
            .await?;

        for item in &items {
            if item.sold_by_weight {
                continue;
            }
            let product = product::Entity::find_by_id(item.product_id)
                .one(&txn)
                .await?;
            let Some(product) = product else { continue };
            if product.is_salam {
                continue;
            }

            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(item.quantity),
                )
                .filter(product::Column::Id.eq(item.product_id))
                .exec(&txn)
                .await?;
        }

        metadata.stock_released = true;
        self.write_metadata(&txn, order.order_number, &metadata)
            .await?;
        txn.commit().await?;
        info!(order_number = order.order_number, "stock released");
        Ok(())
    }

    async fn write_metadata(
        &self,
        txn: &DatabaseTransaction,
        order_number: i64,
        metadata: &OrderMetadata,
    ) -> Result<(), ServiceError> {
        order::Entity::update_many()
            .col_expr(order::Column::Metadata, Expr::value(metadata.to_column()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::OrderNumber.eq(order_number))
            .exec(txn)
            .await?;
        Ok(())
    }

    /// Rewrites the metadata column of an order outside a transition.
    pub async fn update_metadata(
        &self,
        order_number: i64,
        metadata: &OrderMetadata,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        self.write_metadata(&txn, order_number, metadata).await?;
        txn.commit().await?;
        Ok(())
    }

    /// Per-item stock validation for a cart about to check out. Returns
    /// one message per violating item, phrased in the product's unit.
    pub async fn validate_for_checkout(
        &self,
        items: &[(product::Model, Decimal)],
    ) -> Result<(), ServiceError> {
        let errors = validate_items(items);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::CartInvalid(errors))
        }
    }
}

async fn next_order_number(txn: &DatabaseTransaction) -> Result<i64, ServiceError> {
    let last = order::Entity::find()
        .order_by_desc(order::Column::OrderNumber)
        .one(txn)
        .await?;
    Ok(last.map(|o| o.order_number + 1).unwrap_or(1))
}

/// Pure validation used by [`OrderService::validate_for_checkout`]. For
/// sold-by-weight products the stock and the requested quantity are both
/// expressed in the product's weight unit, and the message names that
/// unit, never a piece count.
pub fn validate_items(items: &[(product::Model, Decimal)]) -> Vec<String> {
    let mut errors = Vec::new();
    for (product, quantity) in items {
        if !product.is_available {
            errors.push(format!("\"{}\" is no longer available", product.title));
            continue;
        }

        if product.sold_by_weight {
            let unit = product
                .parsed_weight_unit()
                .map(|u| u.as_str())
                .unwrap_or("g");
            if *quantity > product.stock {
                errors.push(format!(
                    "\"{}\": requested {} {}, only {} {} available",
                    product.title,
                    quantity.normalize(),
                    unit,
                    product.stock.normalize(),
                    unit
                ));
            }
        } else {
            let requested = quantity.trunc();
            if requested > product.stock {
                errors.push(format!(
                    "\"{}\": requested {} units, only {} in stock",
                    product.title,
                    requested.normalize(),
                    product.stock.normalize()
                ));
            }
        }
    }
    errors
}
