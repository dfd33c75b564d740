use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use crate::{
    entities::{order, order_item, payment_session},
    errors::ServiceError,
};

use super::{
    CreatedSession, NotificationContext, NotificationResult, PaymentAdapter, PaymentMethodKind,
    SessionStatus, SessionUrls,
};

/// Deferred payment on delivery. There is no external provider: sessions
/// are synthetic and settlement happens when an operator confirms the
/// order through the admin status endpoint.
pub struct CashOnDeliveryAdapter;

impl CashOnDeliveryAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CashOnDeliveryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentAdapter for CashOnDeliveryAdapter {
    fn kind(&self) -> PaymentMethodKind {
        PaymentMethodKind::CashOnDelivery
    }

    fn is_available(&self, _subtotal: Decimal) -> bool {
        true
    }

    async fn create_session(
        &self,
        order: &order::Model,
        _items: &[order_item::Model],
        _urls: &SessionUrls,
    ) -> Result<CreatedSession, ServiceError> {
        Ok(CreatedSession {
            pay_token: format!("cod-{}", order.order_number),
            notif_token: None,
            payment_url: String::new(),
            expires_at: Utc::now() + Duration::days(30),
        })
    }

    fn verify_notification(
        &self,
        _ctx: &NotificationContext<'_>,
    ) -> Result<NotificationResult, ServiceError> {
        Err(ServiceError::InvalidOperation(
            "cash on delivery has no provider callbacks".to_string(),
        ))
    }

    async fn query_status(
        &self,
        _session: &payment_session::Model,
    ) -> Result<SessionStatus, ServiceError> {
        Ok(SessionStatus::Pending)
    }

    async fn cancel(&self, _session: &payment_session::Model) -> Result<(), ServiceError> {
        Ok(())
    }
}
