use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Redirect,
};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    errors::ServiceError,
    services::payments::{NotificationContext, NotificationResult, PaymentMethodKind, SessionStatus},
    webhooks,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ReturnParams {
    pub order: i64,
}

fn parse_provider(provider: &str) -> Result<PaymentMethodKind, ServiceError> {
    PaymentMethodKind::parse(provider)
        .filter(PaymentMethodKind::is_online)
        .ok_or_else(|| ServiceError::NotFound(format!("unknown payment provider {}", provider)))
}

/// Landing URL after the shopper completes the provider flow. The browser
/// redirect is not trusted: the order settles only on what the provider
/// says when queried (or on its webhook, whichever lands first).
#[utoipa::path(
    get,
    path = "/payment/{provider}/return",
    params(("provider" = String, Path, description = "Payment provider")),
    responses((status = 302, description = "Redirects to the payment result page"))
)]
#[instrument(skip(state))]
pub async fn payment_return(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<ReturnParams>,
) -> Result<Redirect, ServiceError> {
    let kind = parse_provider(&provider)?;

    let status = match state.services.checkout.find_session(params.order).await? {
        Some(session) => {
            let status = state.providers.adapter(kind).query_status(&session).await?;
            let result = NotificationResult {
                event_id: format!("return:{}:{}", session.pay_token, status_label(status)),
                order_number: params.order,
                status,
            };
            state
                .services
                .checkout
                .apply_payment_event(kind, &result)
                .await?;
            status
        }
        // Session already consumed by the webhook; the order holds the truth
        None => {
            let order = state.services.orders.get_by_order_number(params.order).await?;
            if order.is_paid {
                SessionStatus::Success
            } else {
                SessionStatus::Pending
            }
        }
    };

    Ok(Redirect::to(&format!(
        "/payment/result?order={}&status={}",
        params.order,
        status_label(status)
    )))
}

/// Landing URL when the shopper backs out of the provider flow. The order
/// is cancelled and its stock freed, unless a webhook settled it first.
#[utoipa::path(
    get,
    path = "/payment/{provider}/cancel",
    params(("provider" = String, Path, description = "Payment provider")),
    responses((status = 302, description = "Redirects to the payment result page"))
)]
#[instrument(skip(state))]
pub async fn payment_cancel(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<ReturnParams>,
) -> Result<Redirect, ServiceError> {
    let kind = parse_provider(&provider)?;
    info!(order_number = params.order, provider, "shopper abandoned payment");
    state.services.checkout.abandon(kind, params.order).await?;
    Ok(Redirect::to(&format!(
        "/payment/result?order={}&status=CANCELLED",
        params.order
    )))
}

/// Provider server-to-server notification. Always acknowledged with a
/// plain 200 once authenticated, including replays, so providers stop
/// retrying; inauthentic calls get the real error.
#[utoipa::path(
    post,
    path = "/payment/{provider}/webhook",
    params(("provider" = String, Path, description = "Payment provider")),
    request_body = String,
    responses(
        (status = 200, description = "Notification acknowledged"),
        (status = 401, description = "Notification failed authentication")
    )
)]
#[instrument(skip(state, headers, body))]
pub async fn payment_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ServiceError> {
    let kind = parse_provider(&provider)?;

    // The session, when one still exists, is part of the signing material
    // for providers that authenticate via an echoed token.
    let session = match peek_order_number(&body) {
        Some(order_number) => state.services.checkout.find_session(order_number).await?,
        None => None,
    };

    let ctx = NotificationContext {
        headers: &headers,
        body: &body,
        session: session.as_ref(),
    };

    let result = match webhooks::payment::validate(
        state.providers.adapter(kind),
        &state.webhook_dedup,
        &ctx,
    ) {
        Ok(result) => result,
        Err(ServiceError::ReplayedWebhook(event)) => {
            warn!(%event, "replayed payment webhook acknowledged");
            return Ok("OK");
        }
        Err(err) => return Err(err),
    };

    state
        .services
        .checkout
        .apply_payment_event(kind, &result)
        .await?;
    Ok("OK")
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Success => "SUCCESS",
        SessionStatus::Pending => "PENDING",
        SessionStatus::Failed => "FAILED",
        SessionStatus::Expired => "EXPIRED",
    }
}

/// Best-effort extraction of the order number before authentication, used
/// only to look up stored signing material.
fn peek_order_number(body: &[u8]) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("order_number")
        .and_then(serde_json::Value::as_i64)
        .or_else(|| {
            value
                .get("data")?
                .get("reference")?
                .as_str()?
                .parse()
                .ok()
        })
}
