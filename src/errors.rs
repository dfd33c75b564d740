use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error payload returned by every HTTP endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Unprocessable Entity")
    pub error: String,
    /// Machine-readable error kind (e.g., "CART_INVALID")
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Per-field / per-item messages where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cart is not valid for checkout")]
    CartInvalid(Vec<String>),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("No common delivery method: {0}")]
    IncompatibleDelivery(String),

    #[error("A shipping address is required")]
    AddressRequired,

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Payment provider timed out: {0}")]
    ProviderTimeout(String),

    #[error("Payment provider rejected the request: {0}")]
    ProviderRejected(String),

    #[error("Missing authentication")]
    MissingAuth,

    #[error("Invalid authentication: {0}")]
    InvalidAuth(String),

    #[error("Replayed webhook event: {0}")]
    ReplayedWebhook(String),

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("external_sale_id mismatch: {0}")]
    ExternalIdMismatch(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification of order {0}")]
    ConcurrentModification(i64),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Checkout failed at sub-order {failed_index}: {source}")]
    CheckoutFailed {
        failed_index: usize,
        rolled_back: Vec<i64>,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Stable machine-readable kind for clients and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "PERSISTENCE_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) | Self::BadRequest(_) => "BAD_PAYLOAD",
            Self::CartInvalid(_) => "CART_INVALID",
            Self::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            Self::IncompatibleDelivery(_) => "INCOMPATIBLE_DELIVERY",
            Self::AddressRequired => "ADDRESS_REQUIRED",
            Self::ProviderUnavailable(_) | Self::ExternalServiceError(_) => "PROVIDER_UNAVAILABLE",
            Self::ProviderTimeout(_) => "PROVIDER_TIMEOUT",
            Self::ProviderRejected(_) => "PROVIDER_REJECTED",
            Self::MissingAuth => "MISSING_AUTH",
            Self::InvalidAuth(_) | Self::Unauthorized(_) => "INVALID_AUTH",
            Self::ReplayedWebhook(_) => "REPLAY",
            Self::UnknownStatus(_) => "UNKNOWN_STATUS",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::ExternalIdMismatch(_) => "EXTERNAL_ID_MISMATCH",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) | Self::ConcurrentModification(_) => "CONFLICT",
            Self::PaymentFailed(_) => "PAYMENT_FAILED",
            Self::CheckoutFailed { .. } => "CHECKOUT_FAILED",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::AddressRequired
            | Self::UnknownStatus(_)
            | Self::ExternalIdMismatch(_)
            | Self::ReplayedWebhook(_)
            | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::CartInvalid(_) | Self::InsufficientStock(_) | Self::IncompatibleDelivery(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::MissingAuth | Self::InvalidAuth(_) | Self::Unauthorized(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::InvalidTransition(_) | Self::Conflict(_) | Self::ConcurrentModification(_) => {
                StatusCode::CONFLICT
            }
            Self::PaymentFailed(_) | Self::ProviderRejected(_) => StatusCode::PAYMENT_REQUIRED,
            // The cause decides the status; the wrapper adds rollback detail.
            Self::CheckoutFailed { source, .. } => source.status_code(),
            Self::ProviderUnavailable(_) | Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message suitable for HTTP responses. Internal failures return a
    /// generic message so implementation details never leak.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    fn details(&self) -> Option<Vec<String>> {
        match self {
            Self::CartInvalid(items) => Some(items.clone()),
            Self::CheckoutFailed {
                failed_index,
                rolled_back,
                ..
            } => {
                let mut details = vec![format!("sub-order {} failed", failed_index)];
                details.extend(
                    rolled_back
                        .iter()
                        .map(|n| format!("order {} rolled back", n)),
                );
                Some(details)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            details: self.details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::CartInvalid(vec![]).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::IncompatibleDelivery("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::MissingAuth.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::InvalidTransition("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::ProviderRejected("x".into()).status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            ServiceError::ProviderTimeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServiceError::ExternalIdMismatch("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ServiceError::CartInvalid(vec![]).code(), "CART_INVALID");
        assert_eq!(
            ServiceError::IncompatibleDelivery("x".into()).code(),
            "INCOMPATIBLE_DELIVERY"
        );
        assert_eq!(ServiceError::MissingAuth.code(), "MISSING_AUTH");
        assert_eq!(ServiceError::ReplayedWebhook("e1".into()).code(), "REPLAY");
        assert_eq!(
            ServiceError::InvalidTransition("x".into()).code(),
            "INVALID_TRANSITION"
        );
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ServiceError::InternalError("secret stack".into());
        assert_eq!(err.response_message(), "Internal server error");

        let err = ServiceError::InsufficientStock("Laurier: only 0 g left".into());
        assert!(err.response_message().contains("0 g"));
    }

    #[test]
    fn checkout_failure_keeps_the_cause_status_and_names_rollbacks() {
        let err = ServiceError::CheckoutFailed {
            failed_index: 1,
            rolled_back: vec![1001, 1002],
            source: Box::new(ServiceError::PaymentFailed("session refused".into())),
        };
        assert_eq!(err.code(), "CHECKOUT_FAILED");
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        let details = err.details().unwrap();
        assert_eq!(details[0], "sub-order 1 failed");
        assert!(details.contains(&"order 1001 rolled back".to_string()));
        assert!(details.contains(&"order 1002 rolled back".to_string()));
    }

    #[tokio::test]
    async fn cart_invalid_response_carries_per_item_details() {
        let response =
            ServiceError::CartInvalid(vec!["item A: only 2 in stock".into()]).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.code, "CART_INVALID");
        assert_eq!(
            payload.details.as_deref(),
            Some(&["item A: only 2 in stock".to_string()][..])
        );
    }
}
