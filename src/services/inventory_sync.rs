use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    config::B2bConfig,
    entities::{
        external_product_mapping::{self, MappingSyncStatus},
        order::{self, B2bSyncState, OrderStatus, StatusUpdateSource},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    oauth::OAuthTokenCache,
    services::orders::{OrderService, TransitionFields, TransitionOutcome},
};

/// A validated status notification from the B2B platform.
#[derive(Debug, Clone)]
pub struct B2bStatusEvent {
    pub external_sale_id: i64,
    pub order_number: i64,
    pub status: OrderStatus,
    pub tracking_number: Option<String>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Result of [`InventorySyncService::push`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed { external_sale_id: i64 },
    AlreadySynced { external_sale_id: i64 },
}

#[derive(Serialize)]
struct SalePayload<'a> {
    order_number: i64,
    site_configuration: i64,
    payment_method: &'a str,
    shipping_cost: String,
    total: String,
    items: Vec<SaleLine>,
}

#[derive(Serialize)]
struct SaleLine {
    product_id: i64,
    /// Decimal string; rational for by-weight lines
    quantity: String,
    sale_unit_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    weight_unit: Option<String>,
}

#[derive(Deserialize)]
struct SaleResponse {
    sale_id: i64,
}

#[derive(Deserialize)]
struct CatalogProduct {
    id: i64,
}

/// Pushes paid orders into the wholesale (B2B) platform and applies its
/// status notifications back onto local orders.
pub struct InventorySyncService {
    db: Arc<DatabaseConnection>,
    http: reqwest::Client,
    tokens: Arc<OAuthTokenCache>,
    config: B2bConfig,
    orders: Arc<OrderService>,
    event_sender: EventSender,
}

impl InventorySyncService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        http: reqwest::Client,
        config: B2bConfig,
        orders: Arc<OrderService>,
        event_sender: EventSender,
    ) -> Self {
        let tokens = Arc::new(OAuthTokenCache::new(
            "b2b",
            http.clone(),
            format!("{}/oauth/token", config.base_url.trim_end_matches('/')),
            config.client_id.clone(),
            config.client_secret.clone(),
            std::time::Duration::from_secs(config.token_timeout_secs),
        ));
        Self {
            db,
            http,
            tokens,
            config,
            orders,
            event_sender,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Records a sale on the B2B platform for a paid order. Idempotent:
    /// an order whose metadata already carries a synced sale id is left
    /// alone. Client errors are terminal and recorded on the order;
    /// server errors and timeouts are surfaced as retryable.
    #[instrument(skip(self, order), fields(order_number = order.order_number))]
    pub async fn push(&self, order: &order::Model) -> Result<PushOutcome, ServiceError> {
        let mut metadata = order.parsed_metadata();

        if let (Some(sale_id), Some(B2bSyncState::Synced)) =
            (metadata.b2b_sale_id, metadata.b2b_sync_status)
        {
            return Ok(PushOutcome::AlreadySynced {
                external_sale_id: sale_id,
            });
        }

        if !order.is_paid {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is not paid, refusing B2B push",
                order.order_number
            )));
        }

        let items = self.orders.get_items(order.id).await?;
        let lines = self.resolve_sale_lines(&items).await?;

        let payload = SalePayload {
            order_number: order.order_number,
            site_configuration: resolve_site_configuration(
                order.site_configuration_id,
                self.config.default_site_configuration,
            ),
            payment_method: &order.payment_method,
            shipping_cost: order.shipping_cost.to_string(),
            total: order.total.to_string(),
            items: lines,
        };

        let url = self.endpoint("/sales");
        let timeout = std::time::Duration::from_secs(self.config.request_timeout_secs);
        let response = self
            .send_authed(|token| {
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .timeout(timeout)
                    .json(&payload)
            })
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(order_number = order.order_number, %status, %body, "B2B rejected sale");
            metadata.b2b_sync_status = Some(B2bSyncState::Error);
            metadata.b2b_sync_error = Some(format!("{}: {}", status, body));
            self.orders
                .update_metadata(order.order_number, &metadata)
                .await?;
            return Err(ServiceError::ExternalServiceError(format!(
                "B2B rejected sale for order {}",
                order.order_number
            )));
        }
        if !status.is_success() {
            warn!(order_number = order.order_number, %status, "B2B unavailable");
            return Err(ServiceError::ServiceUnavailable(
                "B2B sale push failed upstream".to_string(),
            ));
        }

        let sale: SaleResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("bad B2B response: {}", e)))?;

        metadata.b2b_sale_id = Some(sale.sale_id);
        metadata.b2b_sync_status = Some(B2bSyncState::Synced);
        metadata.b2b_synced_at = Some(Utc::now());
        metadata.b2b_sync_error = None;
        self.orders
            .update_metadata(order.order_number, &metadata)
            .await?;

        info!(
            order_number = order.order_number,
            external_sale_id = sale.sale_id,
            "order pushed to B2B"
        );
        self.event_sender
            .send(Event::B2bSalePushed {
                order_number: order.order_number,
                external_sale_id: sale.sale_id,
            })
            .await;

        Ok(PushOutcome::Pushed {
            external_sale_id: sale.sale_id,
        })
    }

    async fn resolve_sale_lines(
        &self,
        items: &[order_item::Model],
    ) -> Result<Vec<SaleLine>, ServiceError> {
        let product_ids: Vec<_> = items.iter().map(|i| i.product_id).collect();
        let mappings = external_product_mapping::Entity::find()
            .filter(external_product_mapping::Column::ProductId.is_in(product_ids))
            .all(&*self.db)
            .await?;

        items
            .iter()
            .map(|item| {
                let mapping = mappings
                    .iter()
                    .find(|m| m.product_id == item.product_id)
                    .filter(|m| m.is_b2b)
                    .ok_or_else(|| {
                        ServiceError::InvalidOperation(format!(
                            "\"{}\" has no B2B product mapping",
                            item.title
                        ))
                    })?;
                Ok(SaleLine {
                    product_id: mapping.external_product_id,
                    quantity: item.quantity.to_string(),
                    sale_unit_type: if item.sold_by_weight { "weight" } else { "unit" },
                    weight_unit: item.weight_unit.clone(),
                })
            })
            .collect()
    }

    /// Applies a status notification from the B2B platform to the local
    /// order. The first notification that applies cleanly adopts the
    /// external sale id; a later one carrying a different id is rejected.
    #[instrument(skip(self, event), fields(order_number = event.order_number, status = %event.status))]
    pub async fn apply_status_update(
        &self,
        event: &B2bStatusEvent,
    ) -> Result<TransitionOutcome, ServiceError> {
        let order = self.orders.get_by_order_number(event.order_number).await?;
        let known_sale_id = order.parsed_metadata().b2b_sale_id;
        if let Some(known) = known_sale_id {
            if known != event.external_sale_id {
                return Err(ServiceError::ExternalIdMismatch(format!(
                    "order {} is bound to sale {}, got {}",
                    event.order_number, known, event.external_sale_id
                )));
            }
        }

        let outcome = self
            .orders
            .transition(
                event.order_number,
                event.status,
                TransitionFields {
                    tracking_number: event.tracking_number.clone().map(Some),
                    shipped_at: event.shipped_at,
                    delivered_at: event.delivered_at,
                    is_paid: None,
                },
                StatusUpdateSource::Webhook,
            )
            .await?;

        // A rejected notification must not bind the order to its sale id.
        if known_sale_id.is_none() {
            let mut metadata = outcome.order.parsed_metadata();
            metadata.b2b_sale_id = Some(event.external_sale_id);
            self.orders
                .update_metadata(event.order_number, &metadata)
                .await?;
        }

        Ok(outcome)
    }

    async fn send_authed(
        &self,
        build: impl Fn(&str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let token = self.tokens.bearer().await?;
        let response = build(&token).send().await.map_err(map_transport_error)?;

        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.tokens.invalidate().await;
        let token = self.tokens.bearer().await?;
        build(&token).send().await.map_err(map_transport_error)
    }

    /// Cold path. Pulls the B2B catalog and refreshes mapping rows; stock
    /// itself is owned by the B2B side and not mirrored here.
    #[instrument(skip(self))]
    pub async fn refresh_catalog_mappings(&self) -> Result<usize, ServiceError> {
        let url = self.endpoint("/products");
        let response = self
            .send_authed(|token| self.http.get(&url).bearer_auth(token))
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::ServiceUnavailable(
                "B2B catalog fetch failed".to_string(),
            ));
        }

        let catalog: Vec<CatalogProduct> = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("bad B2B catalog: {}", e)))?;
        let known: std::collections::HashSet<i64> = catalog.iter().map(|p| p.id).collect();

        let mappings = external_product_mapping::Entity::find()
            .filter(external_product_mapping::Column::IsB2b.eq(true))
            .all(&*self.db)
            .await?;

        let now = Utc::now();
        let mut refreshed = 0usize;
        for mapping in mappings {
            let status = if known.contains(&mapping.external_product_id) {
                MappingSyncStatus::Synced
            } else {
                MappingSyncStatus::Error
            };
            let mut active: external_product_mapping::ActiveModel = mapping.into();
            active.sync_status = Set(status);
            active.last_synced_at = Set(Some(now));
            active.updated_at = Set(now);
            active.update(&*self.db).await?;
            refreshed += 1;
        }

        info!(refreshed, "B2B catalog mappings refreshed");
        Ok(refreshed)
    }
}

/// Serializes catalog refreshes: one at a time, and not more often than
/// the configured cooldown.
pub struct CatalogSyncGuard {
    lock: Mutex<Option<Instant>>,
    cooldown: std::time::Duration,
}

impl CatalogSyncGuard {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            lock: Mutex::new(None),
            cooldown,
        }
    }

    /// Acquires the guard, or says why it cannot run now. The permit
    /// releases the lock on drop; the cooldown clock starts on acquire.
    pub fn try_acquire(&self) -> Result<CatalogSyncPermit<'_>, ServiceError> {
        let mut slot = self.lock.try_lock().map_err(|_| {
            ServiceError::Conflict("catalog sync already in progress".to_string())
        })?;

        if let Some(last) = *slot {
            if last.elapsed() < self.cooldown {
                return Err(ServiceError::Conflict(
                    "catalog sync already ran recently".to_string(),
                ));
            }
        }
        *slot = Some(Instant::now());
        Ok(CatalogSyncPermit { _slot: slot })
    }
}

#[derive(Debug)]
pub struct CatalogSyncPermit<'a> {
    _slot: tokio::sync::MutexGuard<'a, Option<Instant>>,
}

/// Orders created by the checkout pipeline always carry a site; rows
/// imported from outside it may not.
fn resolve_site_configuration(order_site: i64, fallback: i64) -> i64 {
    if order_site > 0 {
        order_site
    } else {
        fallback
    }
}

fn map_transport_error(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::ProviderTimeout("b2b".to_string())
    } else {
        warn!(error = %err, "B2B platform unreachable");
        ServiceError::ServiceUnavailable("B2B platform unreachable".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_concurrent_entry() {
        let guard = CatalogSyncGuard::new(std::time::Duration::from_secs(600));
        let permit = guard.try_acquire().unwrap();
        let err = guard.try_acquire().unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        drop(permit);
    }

    #[test]
    fn guard_enforces_cooldown_after_release() {
        let guard = CatalogSyncGuard::new(std::time::Duration::from_secs(600));
        drop(guard.try_acquire().unwrap());
        let err = guard.try_acquire().unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn guard_allows_reentry_once_cooldown_passes() {
        let guard = CatalogSyncGuard::new(std::time::Duration::ZERO);
        drop(guard.try_acquire().unwrap());
        assert!(guard.try_acquire().is_ok());
    }

    #[test]
    fn sale_payload_site_falls_back_to_configured_default() {
        assert_eq!(resolve_site_configuration(22, 18), 22);
        assert_eq!(resolve_site_configuration(0, 18), 18);
    }
}
