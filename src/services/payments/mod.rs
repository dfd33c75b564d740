use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    config::AppConfig,
    entities::{order, order_item, payment_session},
    errors::ServiceError,
    oauth::OAuthTokenCache,
};

pub mod card;
pub mod cash_on_delivery;
pub mod mobile_money;

pub use card::CardGatewayAdapter;
pub use cash_on_delivery::CashOnDeliveryAdapter;
pub use mobile_money::MobileMoneyAdapter;

/// Recognized payment providers, tagged by their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    CardGateway,
    MobileMoney,
    CashOnDelivery,
}

impl PaymentMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardGateway => "card_gateway",
            Self::MobileMoney => "mobile_money",
            Self::CashOnDelivery => "cash_on_delivery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "card_gateway" | "card" => Some(Self::CardGateway),
            "mobile_money" => Some(Self::MobileMoney),
            "cash_on_delivery" | "cod" => Some(Self::CashOnDelivery),
            _ => None,
        }
    }

    /// Online methods require a provider session before the order can be
    /// paid; cash-on-delivery does not.
    pub fn is_online(&self) -> bool {
        !matches!(self, Self::CashOnDelivery)
    }
}

impl std::fmt::Display for PaymentMethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side state of a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Success,
    Pending,
    Failed,
    Expired,
}

/// Session data returned by a provider when a checkout is opened.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub pay_token: String,
    pub notif_token: Option<String>,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
}

/// App-owned URLs handed to the provider when opening a session.
#[derive(Debug, Clone)]
pub struct SessionUrls {
    pub return_url: String,
    pub cancel_url: String,
    pub notify_url: String,
}

impl SessionUrls {
    pub fn for_order(public_base_url: &str, provider: PaymentMethodKind, order_number: i64) -> Self {
        let base = public_base_url.trim_end_matches('/');
        Self {
            return_url: format!("{}/payment/{}/return?order={}", base, provider, order_number),
            cancel_url: format!("{}/payment/{}/cancel?order={}", base, provider, order_number),
            notify_url: format!("{}/payment/{}/webhook", base, provider),
        }
    }
}

/// Raw inbound notification plus whatever stored material the provider
/// needs to authenticate it.
pub struct NotificationContext<'a> {
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    /// The stored session for the order, when one exists
    pub session: Option<&'a payment_session::Model>,
}

/// Parsed, authenticated provider notification.
#[derive(Debug, Clone)]
pub struct NotificationResult {
    /// Provider event id, used for replay dedup
    pub event_id: String,
    pub order_number: i64,
    pub status: SessionStatus,
}

/// Uniform capability set implemented once per provider.
#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn kind(&self) -> PaymentMethodKind;

    /// Whether this provider can take a cart of the given subtotal.
    fn is_available(&self, subtotal: Decimal) -> bool;

    async fn create_session(
        &self,
        order: &order::Model,
        items: &[order_item::Model],
        urls: &SessionUrls,
    ) -> Result<CreatedSession, ServiceError>;

    /// Authenticates and parses a provider callback. Fails closed.
    fn verify_notification(
        &self,
        ctx: &NotificationContext<'_>,
    ) -> Result<NotificationResult, ServiceError>;

    async fn query_status(
        &self,
        session: &payment_session::Model,
    ) -> Result<SessionStatus, ServiceError>;

    async fn cancel(&self, session: &payment_session::Model) -> Result<(), ServiceError>;
}

/// Registry of the configured adapters, shared through AppState.
#[derive(Clone)]
pub struct PaymentProviders {
    card: Arc<CardGatewayAdapter>,
    mobile_money: Arc<MobileMoneyAdapter>,
    cash_on_delivery: Arc<CashOnDeliveryAdapter>,
}

impl PaymentProviders {
    pub fn from_config(config: &AppConfig, http: reqwest::Client) -> Self {
        let mobile_money_tokens = Arc::new(OAuthTokenCache::new(
            "mobile-money",
            http.clone(),
            format!(
                "{}/oauth/token",
                config.mobile_money.base_url.trim_end_matches('/')
            ),
            config.mobile_money.client_id.clone(),
            config.mobile_money.client_secret.clone(),
            std::time::Duration::from_secs(config.mobile_money.token_timeout_secs),
        ));

        Self {
            card: Arc::new(CardGatewayAdapter::new(
                http.clone(),
                config.card_gateway.clone(),
                config.currency.clone(),
                config.currency_exponent,
            )),
            mobile_money: Arc::new(MobileMoneyAdapter::new(
                http,
                config.mobile_money.clone(),
                mobile_money_tokens,
                config.currency.clone(),
                config.currency_exponent,
            )),
            cash_on_delivery: Arc::new(CashOnDeliveryAdapter::new()),
        }
    }

    pub fn adapter(&self, kind: PaymentMethodKind) -> &dyn PaymentAdapter {
        match kind {
            PaymentMethodKind::CardGateway => self.card.as_ref(),
            PaymentMethodKind::MobileMoney => self.mobile_money.as_ref(),
            PaymentMethodKind::CashOnDelivery => self.cash_on_delivery.as_ref(),
        }
    }
}

/// Converts a decimal amount to integer minor units, rounding half-up.
pub fn to_minor_units(amount: Decimal, exponent: u32) -> i64 {
    let scale = Decimal::from(10_i64.pow(exponent));
    (amount * scale).round().to_i64().unwrap_or(0)
}

/// One line of a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderLineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_amount: i64,
}

/// Builds the provider line items for an order. Weighted items are never
/// expressed as fractional provider quantities: they collapse to a single
/// line with `quantity = 1` and the rounded line total as the amount.
/// Unit-priced items submit the floored quantity at the unit price.
pub fn provider_line_items(items: &[order_item::Model], exponent: u32) -> Vec<ProviderLineItem> {
    items
        .iter()
        .map(|item| {
            if item.sold_by_weight {
                ProviderLineItem {
                    name: item.title.clone(),
                    quantity: 1,
                    unit_amount: to_minor_units(item.total_price, exponent),
                }
            } else {
                ProviderLineItem {
                    name: item.title.clone(),
                    quantity: item.quantity.trunc().to_u32().unwrap_or(1).max(1),
                    unit_amount: to_minor_units(item.unit_price, exponent),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn line(
        title: &str,
        quantity: Decimal,
        unit_price: Decimal,
        by_weight: bool,
        unit: Option<&str>,
    ) -> order_item::Model {
        order_item::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            title: title.to_string(),
            quantity,
            unit_price,
            total_price: quantity * unit_price,
            sold_by_weight: by_weight,
            weight_unit: unit.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn minor_unit_conversion_rounds() {
        assert_eq!(to_minor_units(Decimal::new(49995, 3), 2), 5000); // 49.995
        assert_eq!(to_minor_units(Decimal::new(1234, 2), 2), 1234); // 12.34
        assert_eq!(to_minor_units(Decimal::from(5000), 0), 5000);
    }

    #[test]
    fn fractional_kg_item_collapses_to_single_line() {
        // 0.25 kg at 1200/kg: one line, quantity 1, rounded total.
        let item = line(
            "Miel",
            Decimal::new(25, 2),
            Decimal::from(1200),
            true,
            Some("kg"),
        );
        let lines = provider_line_items(&[item], 2);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 1);
        assert_eq!(lines[0].unit_amount, 30000); // 300.00
    }

    #[test]
    fn whole_weight_item_still_submits_quantity_one() {
        let item = line(
            "Cumin",
            Decimal::from(250),
            Decimal::new(3, 1), // 0.3 per g
            true,
            Some("g"),
        );
        let lines = provider_line_items(&[item], 2);
        assert_eq!(lines[0].quantity, 1);
        assert_eq!(lines[0].unit_amount, 7500); // 75.00
    }

    #[test]
    fn unit_item_floors_quantity() {
        let item = line("Tasse", Decimal::new(34, 1), Decimal::from(100), false, None);
        let lines = provider_line_items(&[item], 2);
        assert_eq!(lines[0].quantity, 3);
        assert_eq!(lines[0].unit_amount, 10000);
    }

    #[test]
    fn method_kind_wire_names() {
        assert_eq!(
            PaymentMethodKind::parse("mobile_money"),
            Some(PaymentMethodKind::MobileMoney)
        );
        assert_eq!(
            PaymentMethodKind::parse("cod"),
            Some(PaymentMethodKind::CashOnDelivery)
        );
        assert_eq!(PaymentMethodKind::parse("wire"), None);
        assert!(PaymentMethodKind::CardGateway.is_online());
        assert!(!PaymentMethodKind::CashOnDelivery.is_online());
    }

    #[test]
    fn session_urls_embed_provider_and_order() {
        let urls = SessionUrls::for_order("https://shop.example/", PaymentMethodKind::MobileMoney, 42);
        assert_eq!(
            urls.return_url,
            "https://shop.example/payment/mobile_money/return?order=42"
        );
        assert_eq!(
            urls.notify_url,
            "https://shop.example/payment/mobile_money/webhook"
        );
    }
}
