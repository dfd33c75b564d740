use async_trait::async_trait;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::{
    auth::constant_time_eq,
    config::CardGatewayConfig,
    entities::{order, order_item, payment_session},
    errors::ServiceError,
};

use super::{
    provider_line_items, to_minor_units, CreatedSession, NotificationContext, NotificationResult,
    PaymentAdapter, PaymentMethodKind, ProviderLineItem, SessionStatus, SessionUrls,
};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-gateway-signature";
const TIMESTAMP_HEADER: &str = "x-gateway-timestamp";

/// Hosted-checkout card provider. Sessions are opened server side and the
/// shopper is redirected to the returned URL; settlement lands on the
/// webhook, authenticated with an HMAC over `{timestamp}.{body}`.
pub struct CardGatewayAdapter {
    http: reqwest::Client,
    config: CardGatewayConfig,
    currency: String,
    currency_exponent: u32,
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    amount: i64,
    currency: &'a str,
    reference: String,
    success_url: &'a str,
    cancel_url: &'a str,
    webhook_url: &'a str,
    line_items: Vec<ProviderLineItem>,
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    id: String,
    url: String,
    #[serde(default = "default_session_ttl")]
    expires_in: i64,
}

fn default_session_ttl() -> i64 {
    1800
}

#[derive(Deserialize)]
struct SessionStatusResponse {
    status: String,
}

#[derive(Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Deserialize)]
struct WebhookData {
    reference: String,
}

impl CardGatewayAdapter {
    pub fn new(
        http: reqwest::Client,
        config: CardGatewayConfig,
        currency: String,
        currency_exponent: u32,
    ) -> Self {
        Self {
            http,
            config,
            currency,
            currency_exponent,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::ProviderTimeout("card_gateway".to_string())
        } else {
            warn!(error = %err, "card gateway unreachable");
            ServiceError::ProviderUnavailable("card_gateway".to_string())
        }
    }

    async fn surface_error(&self, response: reqwest::Response) -> ServiceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            ServiceError::ProviderRejected(format!("card gateway declined: {}", body))
        } else {
            warn!(%status, %body, "card gateway error response");
            ServiceError::ProviderUnavailable("card_gateway".to_string())
        }
    }

    fn verify_signature(&self, headers: &axum::http::HeaderMap, body: &[u8]) -> Result<(), ServiceError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ServiceError::MissingAuth)?;
        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(ServiceError::MissingAuth)?;

        let age = (Utc::now().timestamp() - timestamp).unsigned_abs();
        if age > self.config.webhook_tolerance_secs {
            return Err(ServiceError::InvalidAuth(
                "webhook timestamp outside tolerance".to_string(),
            ));
        }

        let mut mac = HmacSha256::new_from_slice(self.config.webhook_secret.as_bytes())
            .map_err(|_| ServiceError::InternalError("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        if !constant_time_eq(&expected, signature) {
            return Err(ServiceError::InvalidAuth(
                "webhook signature mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentAdapter for CardGatewayAdapter {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::CardGateway
    }

    fn is_available(&self, subtotal: Decimal) -> bool {
        !self.config.api_key.is_empty() && subtotal > Decimal::ZERO
    }

    #[instrument(skip(self, order, items, urls), fields(order_number = order.order_number))]
    async fn create_session(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
        urls: &SessionUrls,
    ) -> Result<CreatedSession, ServiceError> {
        let request = CreateSessionRequest {
            amount: to_minor_units(order.total, self.currency_exponent),
            currency: &self.currency,
            reference: order.order_number.to_string(),
            success_url: &urls.return_url,
            cancel_url: &urls.cancel_url,
            webhook_url: &urls.notify_url,
            line_items: provider_line_items(items, self.currency_exponent),
        };

        let response = self
            .http
            .post(self.endpoint("/v1/checkout/sessions"))
            .bearer_auth(&self.config.api_key)
            .timeout(std::time::Duration::from_secs(self.config.session_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.surface_error(response).await);
        }

        let session: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        Ok(CreatedSession {
            pay_token: session.id,
            notif_token: None,
            payment_url: session.url,
            expires_at: Utc::now() + Duration::seconds(session.expires_in),
        })
    }

    fn verify_notification(
        &self,
        ctx: &NotificationContext<'_>,
    ) -> Result<NotificationResult, ServiceError> {
        self.verify_signature(ctx.headers, ctx.body)?;

        let envelope: WebhookEnvelope = serde_json::from_slice(ctx.body)
            .map_err(|e| ServiceError::BadRequest(format!("malformed webhook body: {}", e)))?;
        let order_number = envelope
            .data
            .reference
            .parse::<i64>()
            .map_err(|_| ServiceError::BadRequest("non-numeric order reference".to_string()))?;

        let status = match envelope.event_type.as_str() {
            "checkout.session.completed" => SessionStatus::Success,
            "checkout.session.failed" => SessionStatus::Failed,
            "checkout.session.expired" => SessionStatus::Expired,
            "checkout.session.pending" => SessionStatus::Pending,
            other => return Err(ServiceError::UnknownStatus(other.to_string())),
        };

        Ok(NotificationResult {
            event_id: envelope.id,
            order_number,
            status,
        })
    }

    async fn query_status(
        &self,
        session: &payment_session::Model,
    ) -> Result<SessionStatus, ServiceError> {
        let response = self
            .http
            .get(self.endpoint(&format!("/v1/checkout/sessions/{}", session.pay_token)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.surface_error(response).await);
        }

        let body: SessionStatusResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        match body.status.as_str() {
            "paid" | "completed" => Ok(SessionStatus::Success),
            "pending" | "open" => Ok(SessionStatus::Pending),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(ServiceError::UnknownStatus(other.to_string())),
        }
    }

    async fn cancel(&self, session: &payment_session::Model) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(self.endpoint(&format!(
                "/v1/checkout/sessions/{}/cancel",
                session.pay_token
            )))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        // An already-expired session is fine to leave behind
        if !response.status().is_success() && response.status() != reqwest::StatusCode::GONE {
            return Err(self.surface_error(response).await);
        }
        Ok(())
    }
}
