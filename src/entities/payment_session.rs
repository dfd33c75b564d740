use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short-lived payment session. Created when a provider session is opened
/// for an order, deleted when the order reaches a terminal payment state.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: i64,
    /// Provider identity, wire name ("card_gateway", "mobile_money", ...)
    pub provider: String,
    pub pay_token: String,
    /// Token echoed back on the provider's callback channel
    #[sea_orm(nullable)]
    pub notif_token: Option<String>,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
