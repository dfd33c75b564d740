use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::{order, order_item, order::OrderStatus, order::StatusUpdateSource},
    errors::ServiceError,
    services::orders::TransitionFields,
    AppState,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub product_id: Uuid,
    pub title: String,
    #[schema(value_type = String)]
    pub quantity: Decimal,
    #[schema(value_type = String)]
    pub unit_price: Decimal,
    #[schema(value_type = String)]
    pub total_price: Decimal,
    pub sold_by_weight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_unit: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub order_number: i64,
    pub status: String,
    pub payment_method: String,
    pub site_configuration: i64,
    pub shipping_method: String,
    #[schema(value_type = String)]
    pub subtotal: Decimal,
    #[schema(value_type = String)]
    pub shipping_cost: Decimal,
    #[schema(value_type = String)]
    pub total: Decimal,
    pub is_paid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<OrderItemResponse>,
}

impl OrderResponse {
    fn build(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            order_number: order.order_number,
            status: order.status.as_str().to_string(),
            payment_method: order.payment_method,
            site_configuration: order.site_configuration_id,
            shipping_method: order.shipping_method_slug,
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            total: order.total,
            is_paid: order.is_paid,
            tracking_number: order.tracking_number,
            shipped_at: order.shipped_at,
            delivered_at: order.delivered_at,
            created_at: order.created_at,
            items: items
                .into_iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id,
                    title: item.title,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    total_price: item.total_price,
                    sold_by_weight: item.sold_by_weight,
                    weight_unit: item.weight_unit,
                })
                .collect(),
        }
    }
}

/// Order read-back, scoped to the order's owner. Operators can read any
/// order. Others get a 404, not a 403, to avoid confirming the number.
#[utoipa::path(
    get,
    path = "/orders/{order_number}",
    params(("order_number" = i64, Path, description = "Order number")),
    responses(
        (status = 200, description = "Order with its items", body = OrderResponse),
        (status = 404, description = "No such order visible to the caller")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_number): Path<i64>,
) -> Result<Json<OrderResponse>, ServiceError> {
    let order = state.services.orders.get_by_order_number(order_number).await?;
    if order.user_id != user.user_id && !user.is_admin {
        return Err(ServiceError::NotFound(format!(
            "Order {} not found",
            order_number
        )));
    }
    let items = state.services.orders.get_items(order.id).await?;
    Ok(Json(OrderResponse::build(order, items)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    /// Target status, wire spelling (`confirmed`, `shipped`, ...)
    pub status: String,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub shipped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    /// Marks the order settled; used when cash arrives on delivery
    #[serde(default)]
    pub mark_paid: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateStatusResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    pub old_status: String,
    pub new_status: String,
}

/// Operator transition, primarily the confirmation step for
/// cash-on-delivery orders.
#[utoipa::path(
    put,
    path = "/orders/{order_number}/status",
    params(("order_number" = i64, Path, description = "Order number")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Transition applied or ignored", body = UpdateStatusResponse),
        (status = 403, description = "Caller is not an operator"),
        (status = 409, description = "Transition not allowed from the current status")
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_number): Path<i64>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<UpdateStatusResponse>, ServiceError> {
    if !user.is_admin {
        return Err(ServiceError::Forbidden(
            "status updates require operator access".to_string(),
        ));
    }

    let status = OrderStatus::parse(&request.status)
        .ok_or_else(|| ServiceError::UnknownStatus(request.status.clone()))?;

    let outcome = state
        .services
        .orders
        .transition(
            order_number,
            status,
            TransitionFields {
                tracking_number: request.tracking_number.map(Some),
                shipped_at: request.shipped_at,
                delivered_at: request.delivered_at,
                is_paid: request.mark_paid,
            },
            StatusUpdateSource::Admin,
        )
        .await?;

    // A freshly settled order is eligible for the B2B sale push; a failure
    // here stays local and retryable.
    if outcome.changed && outcome.order.is_paid {
        if let Err(err) = state.services.inventory.push(&outcome.order).await {
            warn!(order_number, error = %err, "B2B push deferred after operator update");
        }
    }

    Ok(Json(UpdateStatusResponse {
        success: true,
        ignored: !outcome.changed,
        old_status: outcome.old_status.as_str().to_string(),
        new_status: outcome.order.status.as_str().to_string(),
    }))
}
