use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;
use tracing::{info, instrument};
use utoipa::ToSchema;

use crate::{auth::AuthUser, errors::ServiceError, webhooks, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct B2bStatusResponse {
    pub success: bool,
    /// True when the notification was deliberately not applied
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    pub old_status: String,
    pub new_status: String,
}

/// Order-status notification from the B2B platform, authenticated with a
/// shared API key. A notification the state machine declines to apply
/// (same status again, or a suppressed downgrade) is still acknowledged.
#[utoipa::path(
    post,
    path = "/inventory/webhooks/order-status/",
    request_body = String,
    responses(
        (status = 200, description = "Notification applied or deliberately ignored", body = B2bStatusResponse),
        (status = 400, description = "Malformed payload, unknown status, or sale id mismatch"),
        (status = 401, description = "Missing or unknown API key")
    )
)]
#[instrument(skip(state, headers, body))]
pub async fn order_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<B2bStatusResponse>, ServiceError> {
    let event = webhooks::b2b::validate(&headers, &body, &state.config.b2b.api_keys)?;

    let outcome = state.services.inventory.apply_status_update(&event).await?;

    if !outcome.changed {
        info!(
            order_number = event.order_number,
            status = %outcome.order.status,
            "B2B status notification ignored"
        );
    }

    Ok(Json(B2bStatusResponse {
        success: true,
        ignored: !outcome.changed,
        old_status: outcome.old_status.as_str().to_string(),
        new_status: outcome.order.status.as_str().to_string(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CatalogSyncResponse {
    pub refreshed: usize,
}

/// Operator-triggered refresh of the B2B product mappings. One refresh at
/// a time, and not more often than the configured cooldown.
#[utoipa::path(
    post,
    path = "/inventory/catalog-sync",
    responses(
        (status = 200, description = "Mappings refreshed", body = CatalogSyncResponse),
        (status = 403, description = "Caller is not an operator"),
        (status = 409, description = "A refresh is running or ran too recently")
    ),
    security(("bearer_auth" = []))
)]
pub async fn catalog_sync(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<CatalogSyncResponse>, ServiceError> {
    if !user.is_admin {
        return Err(ServiceError::Forbidden(
            "catalog sync requires operator access".to_string(),
        ));
    }

    let _permit = state.catalog_sync_guard.try_acquire()?;
    let refreshed = state.services.inventory.refresh_catalog_mappings().await?;
    Ok(Json(CatalogSyncResponse { refreshed }))
}
