use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Product entity. Read-only to this subsystem: the catalog side owns the
/// rows, checkout only consumes price, stock and the `specifications` JSON
/// blob carrying the product's delivery methods.
///
/// When `sold_by_weight` is true, `stock` is a mass expressed in
/// `weight_unit`, not a discrete count.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub title: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub stock: Decimal,
    pub is_available: bool,
    pub sold_by_weight: bool,
    #[sea_orm(nullable)]
    pub weight_unit: Option<String>,
    /// Deferred-delivery flag; such products are never stock-reserved locally
    pub is_salam: bool,
    /// Write-once from the catalog side; parsed into typed delivery methods
    /// at cart-split time
    #[sea_orm(column_type = "Json", nullable)]
    pub specifications: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_item::Entity")]
    CartItems,
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_one = "super::external_product_mapping::Entity")]
    ExternalMapping,
}

impl Related<super::cart_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartItems.def()
    }
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::external_product_mapping::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalMapping.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Weight unit for by-weight products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    G,
    Kg,
}

impl WeightUnit {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "g" => Some(Self::G),
            "kg" => Some(Self::Kg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::G => "g",
            Self::Kg => "kg",
        }
    }
}

impl Model {
    pub fn parsed_weight_unit(&self) -> Option<WeightUnit> {
        self.weight_unit.as_deref().and_then(WeightUnit::parse)
    }
}
