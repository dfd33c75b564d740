use axum::{extract::State, Json};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{checkout::CheckoutResponse, payments::PaymentMethodKind},
    AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    /// `card_gateway`, `mobile_money` or `cash_on_delivery`
    #[validate(length(min = 1))]
    pub payment_method: String,
    pub shipping_address_id: Uuid,
    /// Preferred shipping method when the cart supports several
    #[serde(default)]
    pub shipping_method_id: Option<i64>,
}

/// Converts the caller's active cart into one or more orders.
#[utoipa::path(
    post,
    path = "/cart/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Checkout completed", body = CheckoutResponse),
        (status = 409, description = "Checkout already in progress"),
        (status = 422, description = "Cart cannot be fulfilled as requested")
    ),
    security(("bearer_auth" = []))
)]
pub async fn checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ServiceError> {
    request
        .validate()
        .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

    let payment_method = PaymentMethodKind::parse(&request.payment_method).ok_or_else(|| {
        ServiceError::ValidationError(format!(
            "unknown payment method \"{}\"",
            request.payment_method
        ))
    })?;

    let response = state
        .services
        .checkout
        .checkout(
            user.user_id,
            payment_method,
            request.shipping_address_id,
            request.shipping_method_id,
        )
        .await?;

    Ok(Json(response))
}
