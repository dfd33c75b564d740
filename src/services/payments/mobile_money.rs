use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::{
    auth::constant_time_eq,
    config::MobileMoneyConfig,
    entities::{order, order_item, payment_session},
    errors::ServiceError,
    oauth::OAuthTokenCache,
};

use super::{
    to_minor_units, CreatedSession, NotificationContext, NotificationResult, PaymentAdapter,
    PaymentMethodKind, SessionStatus, SessionUrls,
};

/// Mobile-money wallet provider. Access is OAuth2 client-credentials; each
/// session carries a `notif_token` that the provider echoes back on its
/// notification, which is the only authentication the callback has.
pub struct MobileMoneyAdapter {
    http: reqwest::Client,
    config: MobileMoneyConfig,
    tokens: Arc<OAuthTokenCache>,
    currency: String,
    currency_exponent: u32,
}

#[derive(Serialize)]
struct WebpaymentRequest<'a> {
    merchant_id: &'a str,
    amount: i64,
    currency: &'a str,
    order_number: i64,
    return_url: &'a str,
    cancel_url: &'a str,
    notif_url: &'a str,
}

#[derive(Deserialize)]
struct WebpaymentResponse {
    pay_token: String,
    notif_token: String,
    payment_url: String,
    #[serde(default = "default_session_ttl")]
    expires_in: i64,
}

fn default_session_ttl() -> i64 {
    1800
}

#[derive(Deserialize)]
struct WebpaymentStatusResponse {
    status: String,
}

#[derive(Deserialize)]
struct Notification {
    pay_token: String,
    notif_token: String,
    status: String,
    order_number: i64,
    #[serde(default)]
    transaction_id: Option<String>,
}

fn parse_wire_status(status: &str) -> Result<SessionStatus, ServiceError> {
    match status {
        "SUCCESS" => Ok(SessionStatus::Success),
        "FAILED" => Ok(SessionStatus::Failed),
        "EXPIRED" => Ok(SessionStatus::Expired),
        "PENDING" | "INITIATED" => Ok(SessionStatus::Pending),
        other => Err(ServiceError::UnknownStatus(other.to_string())),
    }
}

impl MobileMoneyAdapter {
    pub fn new(
        http: reqwest::Client,
        config: MobileMoneyConfig,
        tokens: Arc<OAuthTokenCache>,
        currency: String,
        currency_exponent: u32,
    ) -> Self {
        Self {
            http,
            config,
            tokens,
            currency,
            currency_exponent,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::ProviderTimeout("mobile_money".to_string())
        } else {
            warn!(error = %err, "mobile money gateway unreachable");
            ServiceError::ProviderUnavailable("mobile_money".to_string())
        }
    }

    async fn surface_error(&self, response: reqwest::Response) -> ServiceError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            ServiceError::ProviderRejected(format!("mobile money declined: {}", body))
        } else {
            warn!(%status, %body, "mobile money error response");
            ServiceError::ProviderUnavailable("mobile_money".to_string())
        }
    }

    /// Sends an authenticated request, refreshing the cached token once if
    /// the provider reports it stale.
    async fn send_authed(
        &self,
        build: impl Fn(&str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let token = self.tokens.bearer().await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.tokens.invalidate().await;
        let token = self.tokens.bearer().await?;
        build(&token)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))
    }
}

#[async_trait]
impl PaymentAdapter for MobileMoneyAdapter {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::MobileMoney
    }

    fn is_available(&self, subtotal: Decimal) -> bool {
        !self.config.client_id.is_empty() && subtotal > Decimal::ZERO
    }

    #[instrument(skip(self, order, _items, urls), fields(order_number = order.order_number))]
    async fn create_session(
        &self,
        order: &order::Model,
        _items: &[order_item::Model],
        urls: &SessionUrls,
    ) -> Result<CreatedSession, ServiceError> {
        let request = WebpaymentRequest {
            merchant_id: &self.config.merchant_id,
            amount: to_minor_units(order.total, self.currency_exponent),
            currency: &self.currency,
            order_number: order.order_number,
            return_url: &urls.return_url,
            cancel_url: &urls.cancel_url,
            notif_url: &urls.notify_url,
        };

        let url = self.endpoint("/webpayment");
        let timeout = std::time::Duration::from_secs(self.config.session_timeout_secs);
        let response = self
            .send_authed(|token| {
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .timeout(timeout)
                    .json(&request)
            })
            .await?;

        if !response.status().is_success() {
            return Err(self.surface_error(response).await);
        }

        let session: WebpaymentResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        Ok(CreatedSession {
            pay_token: session.pay_token,
            notif_token: Some(session.notif_token),
            payment_url: session.payment_url,
            expires_at: Utc::now() + Duration::seconds(session.expires_in),
        })
    }

    fn verify_notification(
        &self,
        ctx: &NotificationContext<'_>,
    ) -> Result<NotificationResult, ServiceError> {
        let notification: Notification = serde_json::from_slice(ctx.body)
            .map_err(|e| ServiceError::BadRequest(format!("malformed notification: {}", e)))?;

        // Without a stored session there is nothing to authenticate against
        let session = ctx.session.ok_or_else(|| {
            ServiceError::InvalidAuth("no session for notification".to_string())
        })?;
        let expected = session.notif_token.as_deref().ok_or_else(|| {
            ServiceError::InvalidAuth("session has no notification token".to_string())
        })?;
        if !constant_time_eq(expected, &notification.notif_token) {
            return Err(ServiceError::InvalidAuth(
                "notification token mismatch".to_string(),
            ));
        }
        if notification.pay_token != session.pay_token {
            return Err(ServiceError::InvalidAuth(
                "pay token mismatch".to_string(),
            ));
        }

        let status = parse_wire_status(&notification.status)?;
        let event_id = notification
            .transaction_id
            .unwrap_or_else(|| format!("{}:{}", notification.pay_token, notification.status));

        Ok(NotificationResult {
            event_id,
            order_number: notification.order_number,
            status,
        })
    }

    async fn query_status(
        &self,
        session: &payment_session::Model,
    ) -> Result<SessionStatus, ServiceError> {
        let url = self.endpoint(&format!("/webpayment/{}", session.pay_token));
        let response = self
            .send_authed(|token| self.http.get(&url).bearer_auth(token))
            .await?;

        if !response.status().is_success() {
            return Err(self.surface_error(response).await);
        }

        let body: WebpaymentStatusResponse = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        parse_wire_status(&body.status)
    }

    async fn cancel(&self, session: &payment_session::Model) -> Result<(), ServiceError> {
        let url = self.endpoint(&format!("/webpayment/{}/cancel", session.pay_token));
        let response = self
            .send_authed(|token| self.http.post(&url).bearer_auth(token))
            .await?;

        if !response.status().is_success() && response.status() != reqwest::StatusCode::GONE {
            return Err(self.surface_error(response).await);
        }
        Ok(())
    }
}
