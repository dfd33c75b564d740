use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    auth::verify_api_key,
    entities::order::OrderStatus,
    errors::ServiceError,
    services::inventory_sync::B2bStatusEvent,
};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Deserialize)]
struct B2bPayload {
    external_sale_id: i64,
    order_number: i64,
    status: String,
    #[serde(default)]
    tracking_number: Option<String>,
    #[serde(default)]
    shipped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    delivered_at: Option<DateTime<Utc>>,
}

/// Authenticates and parses a B2B order-status notification. The key in
/// `X-API-Key` must match one of the configured active keys; the status
/// must be one this system recognizes.
pub fn validate(
    headers: &HeaderMap,
    body: &[u8],
    active_keys: &[String],
) -> Result<B2bStatusEvent, ServiceError> {
    let candidate = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ServiceError::MissingAuth)?;
    if !verify_api_key(candidate, active_keys) {
        return Err(ServiceError::InvalidAuth("unknown API key".to_string()));
    }

    let payload: B2bPayload = serde_json::from_slice(body)
        .map_err(|e| ServiceError::BadRequest(format!("malformed B2B payload: {}", e)))?;

    let status = OrderStatus::parse(&payload.status)
        .ok_or_else(|| ServiceError::UnknownStatus(payload.status.clone()))?;

    Ok(B2bStatusEvent {
        external_sale_id: payload.external_sale_id,
        order_number: payload.order_number,
        status,
        tracking_number: payload.tracking_number,
        shipped_at: payload.shipped_at,
        delivered_at: payload.delivered_at,
    })
}
