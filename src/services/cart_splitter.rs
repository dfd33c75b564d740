use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use crate::{
    entities::product::{self, WeightUnit},
    errors::ServiceError,
};

/// A shipping option attached to a product, scoped to one fulfillment
/// site. Parsed once per split from the product's `specifications` blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMethod {
    #[serde(alias = "id")]
    pub method_id: i64,
    #[serde(alias = "site_configuration")]
    pub site_configuration_id: i64,
    pub slug: String,
    pub base_price: Decimal,
    pub effective_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct Specifications {
    #[serde(default)]
    delivery_methods: Vec<DeliveryMethod>,
}

impl DeliveryMethod {
    /// Extracts the delivery methods from a product's `specifications`
    /// JSON column. An absent or malformed blob yields an empty set.
    pub fn from_specifications(specifications: Option<&serde_json::Value>) -> Vec<DeliveryMethod> {
        specifications
            .and_then(|value| serde_json::from_value::<Specifications>(value.clone()).ok())
            .map(|spec| spec.delivery_methods)
            .unwrap_or_default()
    }
}

/// One cart line prepared for splitting.
#[derive(Debug, Clone)]
pub struct SplitItem {
    pub product_id: Uuid,
    pub title: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub sold_by_weight: bool,
    pub weight_unit: Option<WeightUnit>,
    pub delivery_methods: Vec<DeliveryMethod>,
}

impl SplitItem {
    pub fn from_product(product: &product::Model, quantity: Decimal) -> Self {
        Self {
            product_id: product.id,
            title: product.title.clone(),
            quantity,
            unit_price: product.price,
            sold_by_weight: product.sold_by_weight,
            weight_unit: product.parsed_weight_unit(),
            delivery_methods: DeliveryMethod::from_specifications(product.specifications.as_ref()),
        }
    }

    /// Line total in rational arithmetic; by-weight quantities stay exact.
    pub fn line_total(&self) -> Decimal {
        self.quantity * self.unit_price
    }

    fn supported_pairs(&self) -> BTreeSet<(i64, i64)> {
        self.delivery_methods
            .iter()
            .map(|m| (m.site_configuration_id, m.method_id))
            .collect()
    }
}

/// The shipping method chosen for a sub-order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChosenMethod {
    pub method_id: i64,
    pub slug: String,
    pub effective_price: Decimal,
}

/// Intermediate value produced by the split; becomes one order.
#[derive(Debug, Clone)]
pub struct SubOrder {
    pub site_configuration_id: i64,
    pub shipping_method: ChosenMethod,
    pub items: Vec<SplitItem>,
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
}

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub split: bool,
    pub suborders: Vec<SubOrder>,
}

/// Partitions a cart into per-site, per-shipping-method sub-orders.
///
/// If every item supports a common `(site, method)` pair the cart does not
/// split; otherwise items are grouped by fulfillment site and each group
/// must agree on a single method. Fails with `INCOMPATIBLE_DELIVERY` when
/// a group cannot agree.
pub fn split(
    items: Vec<SplitItem>,
    preferred_shipping_method_id: Option<i64>,
) -> Result<SplitOutcome, ServiceError> {
    if items.is_empty() {
        return Err(ServiceError::InvalidOperation("cart is empty".into()));
    }

    for item in &items {
        if item.delivery_methods.is_empty() {
            return Err(ServiceError::IncompatibleDelivery(format!(
                "\"{}\" has no delivery method",
                item.title
            )));
        }
    }

    // Common (site, method) pairs across all items.
    let mut common = items[0].supported_pairs();
    for item in &items[1..] {
        let pairs = item.supported_pairs();
        common.retain(|pair| pairs.contains(pair));
    }

    if !common.is_empty() {
        let candidates: Vec<&DeliveryMethod> = items[0]
            .delivery_methods
            .iter()
            .filter(|m| common.contains(&(m.site_configuration_id, m.method_id)))
            .collect();
        let chosen = choose_method(&candidates, preferred_shipping_method_id);
        let site = chosen.0;
        let method = chosen.1;
        debug!(site, method_id = method.method_id, "cart does not split");

        let subtotal: Decimal = items.iter().map(SplitItem::line_total).sum();
        let shipping_cost = method.effective_price;
        return Ok(SplitOutcome {
            split: false,
            suborders: vec![SubOrder {
                site_configuration_id: site,
                shipping_method: method,
                items,
                subtotal,
                shipping_cost,
            }],
        });
    }

    // No common pair: group items by fulfillment site. An item supporting
    // several sites goes to the site of its cheapest method.
    let mut groups: BTreeMap<i64, Vec<SplitItem>> = BTreeMap::new();
    for item in items {
        let home_site = item
            .delivery_methods
            .iter()
            .min_by(|a, b| {
                a.effective_price
                    .cmp(&b.effective_price)
                    .then_with(|| a.slug.cmp(&b.slug))
            })
            .map(|m| m.site_configuration_id)
            .expect("non-empty checked above");
        groups.entry(home_site).or_default().push(item);
    }

    let mut suborders = Vec::with_capacity(groups.len());
    for (site, group_items) in groups {
        // Method ids common to every item in the group, within this site.
        let mut common_methods: BTreeSet<i64> = group_items[0]
            .delivery_methods
            .iter()
            .filter(|m| m.site_configuration_id == site)
            .map(|m| m.method_id)
            .collect();
        for item in &group_items[1..] {
            let ids: BTreeSet<i64> = item
                .delivery_methods
                .iter()
                .filter(|m| m.site_configuration_id == site)
                .map(|m| m.method_id)
                .collect();
            common_methods.retain(|id| ids.contains(id));
        }

        if common_methods.is_empty() {
            let titles: Vec<&str> = group_items.iter().map(|i| i.title.as_str()).collect();
            return Err(ServiceError::IncompatibleDelivery(format!(
                "items {:?} share no shipping method for site {}",
                titles, site
            )));
        }

        let candidates: Vec<&DeliveryMethod> = group_items[0]
            .delivery_methods
            .iter()
            .filter(|m| m.site_configuration_id == site && common_methods.contains(&m.method_id))
            .collect();
        let (_, method) = choose_method(&candidates, preferred_shipping_method_id);

        let subtotal: Decimal = group_items.iter().map(SplitItem::line_total).sum();
        let shipping_cost = method.effective_price;
        suborders.push(SubOrder {
            site_configuration_id: site,
            shipping_method: method,
            items: group_items,
            subtotal,
            shipping_cost,
        });
    }

    debug!(groups = suborders.len(), "cart split by site");
    Ok(SplitOutcome {
        split: true,
        suborders,
    })
}

/// Choice rule: the preferred method when it is among the candidates,
/// otherwise the cheapest by effective price, ties broken by slug.
fn choose_method(
    candidates: &[&DeliveryMethod],
    preferred: Option<i64>,
) -> (i64, ChosenMethod) {
    if let Some(preferred_id) = preferred {
        if let Some(m) = candidates.iter().find(|m| m.method_id == preferred_id) {
            return (
                m.site_configuration_id,
                ChosenMethod {
                    method_id: m.method_id,
                    slug: m.slug.clone(),
                    effective_price: m.effective_price,
                },
            );
        }
    }

    let m = candidates
        .iter()
        .min_by(|a, b| {
            a.effective_price
                .cmp(&b.effective_price)
                .then_with(|| a.slug.cmp(&b.slug))
        })
        .expect("choose_method called with candidates");
    (
        m.site_configuration_id,
        ChosenMethod {
            method_id: m.method_id,
            slug: m.slug.clone(),
            effective_price: m.effective_price,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: i64) -> Decimal {
        Decimal::from_i64(v).unwrap()
    }

    fn method(method_id: i64, site: i64, slug: &str, price: i64) -> DeliveryMethod {
        DeliveryMethod {
            method_id,
            site_configuration_id: site,
            slug: slug.to_string(),
            base_price: dec(price),
            effective_price: dec(price),
        }
    }

    fn item(title: &str, price: i64, qty: i64, methods: Vec<DeliveryMethod>) -> SplitItem {
        SplitItem {
            product_id: Uuid::new_v4(),
            title: title.to_string(),
            quantity: dec(qty),
            unit_price: dec(price),
            sold_by_weight: false,
            weight_unit: None,
            delivery_methods: methods,
        }
    }

    #[test]
    fn common_method_does_not_split() {
        let shared = method(3, 18, "express", 5000);
        let items = vec![
            item("A", 1000, 1, vec![shared.clone()]),
            item("B", 2000, 2, vec![shared]),
        ];

        let outcome = split(items, None).unwrap();
        assert!(!outcome.split);
        assert_eq!(outcome.suborders.len(), 1);
        let sub = &outcome.suborders[0];
        assert_eq!(sub.site_configuration_id, 18);
        assert_eq!(sub.shipping_cost, dec(5000));
        assert_eq!(sub.subtotal, dec(1000 + 2 * 2000));
    }

    #[test]
    fn disjoint_sites_split_by_site() {
        let items = vec![
            item("A", 1000, 1, vec![method(3, 18, "express", 5000)]),
            item("B", 2000, 1, vec![method(7, 22, "standard", 2000)]),
        ];

        let outcome = split(items, None).unwrap();
        assert!(outcome.split);
        assert_eq!(outcome.suborders.len(), 2);

        let sites: Vec<i64> = outcome
            .suborders
            .iter()
            .map(|s| s.site_configuration_id)
            .collect();
        assert_eq!(sites, vec![18, 22]);

        let mut costs: Vec<Decimal> = outcome.suborders.iter().map(|s| s.shipping_cost).collect();
        costs.sort();
        assert_eq!(costs, vec![dec(2000), dec(5000)]);
    }

    #[test]
    fn preferred_method_honored_when_common() {
        let methods = vec![
            method(3, 18, "express", 5000),
            method(7, 18, "standard", 2000),
        ];
        let items = vec![
            item("A", 1000, 1, methods.clone()),
            item("B", 2000, 1, methods),
        ];

        // Without preference the cheapest wins.
        let outcome = split(items.clone(), None).unwrap();
        assert_eq!(outcome.suborders[0].shipping_method.method_id, 7);

        // An explicit preference for the pricier method is honored.
        let outcome = split(items, Some(3)).unwrap();
        assert_eq!(outcome.suborders[0].shipping_method.method_id, 3);
        assert_eq!(outcome.suborders[0].shipping_cost, dec(5000));
    }

    #[test]
    fn preference_outside_intersection_falls_back_to_cheapest() {
        let methods = vec![
            method(3, 18, "express", 5000),
            method(7, 18, "standard", 2000),
        ];
        let items = vec![item("A", 1000, 1, methods)];

        let outcome = split(items, Some(99)).unwrap();
        assert_eq!(outcome.suborders[0].shipping_method.method_id, 7);
    }

    #[test]
    fn price_tie_broken_by_slug() {
        let methods = vec![
            method(9, 18, "relay", 2000),
            method(7, 18, "pickup", 2000),
        ];
        let items = vec![item("A", 1000, 1, methods)];

        let outcome = split(items, None).unwrap();
        assert_eq!(outcome.suborders[0].shipping_method.slug, "pickup");
    }

    #[test]
    fn shipping_cost_is_per_suborder_not_per_item() {
        let shared = method(3, 18, "express", 5000);
        let items = vec![
            item("A", 1000, 3, vec![shared.clone()]),
            item("B", 2000, 4, vec![shared.clone()]),
            item("C", 500, 10, vec![shared]),
        ];

        let outcome = split(items, None).unwrap();
        assert_eq!(outcome.suborders[0].shipping_cost, dec(5000));
    }

    #[test]
    fn group_without_common_method_fails() {
        // Both items home to site 18 but support disjoint methods there.
        let items = vec![
            item("A", 1000, 1, vec![method(3, 18, "express", 5000)]),
            item("B", 2000, 1, vec![method(7, 18, "standard", 5000)]),
        ];

        let err = split(items, None).unwrap_err();
        assert!(matches!(err, ServiceError::IncompatibleDelivery(_)));
    }

    #[test]
    fn item_without_methods_fails() {
        let items = vec![item("A", 1000, 1, vec![])];
        let err = split(items, None).unwrap_err();
        assert!(matches!(err, ServiceError::IncompatibleDelivery(_)));
    }

    #[test]
    fn by_weight_line_total_uses_rational_arithmetic() {
        let mut weighted = item("Poudre de laurier", 0, 0, vec![method(3, 18, "express", 500)]);
        weighted.sold_by_weight = true;
        weighted.weight_unit = Some(WeightUnit::Kg);
        weighted.quantity = Decimal::new(25, 2); // 0.25 kg
        weighted.unit_price = dec(1200); // per kg

        assert_eq!(weighted.line_total(), dec(300));

        let outcome = split(vec![weighted], None).unwrap();
        assert_eq!(outcome.suborders[0].subtotal, dec(300));
    }

    #[test]
    fn delivery_methods_parse_from_specifications_blob() {
        let blob = serde_json::json!({
            "delivery_methods": [
                {"id": 3, "site_configuration": 18, "slug": "express",
                 "base_price": "5000", "effective_price": "4500"},
                {"method_id": 7, "site_configuration_id": 22, "slug": "standard",
                 "base_price": "2000", "effective_price": "2000"}
            ],
            "color": "green"
        });

        let methods = DeliveryMethod::from_specifications(Some(&blob));
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].method_id, 3);
        assert_eq!(methods[0].site_configuration_id, 18);
        assert_eq!(methods[0].effective_price, dec(4500));
        assert_eq!(methods[1].site_configuration_id, 22);

        assert!(DeliveryMethod::from_specifications(None).is_empty());
    }
}
