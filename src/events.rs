use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::{OrderStatus, StatusUpdateSource};

/// Lifecycle events emitted by the services. Delivery is fire-and-forget;
/// the consumer logs them and is the seam for future fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: i64,
        user_id: Uuid,
    },
    OrderStatusChanged {
        order_number: i64,
        old_status: OrderStatus,
        new_status: OrderStatus,
        source: StatusUpdateSource,
    },
    PaymentConfirmed {
        order_number: i64,
        provider: String,
    },
    CheckoutCompleted {
        user_id: Uuid,
        order_numbers: Vec<i64>,
        split: bool,
    },
    CheckoutRolledBack {
        user_id: Uuid,
        cancelled_order_numbers: Vec<i64>,
    },
    B2bSalePushed {
        order_number: i64,
        external_sale_id: i64,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; a full or closed channel is logged, never surfaced.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Creates a channel pair and spawns the consumer task.
pub fn start() -> EventSender {
    let (tx, rx) = mpsc::channel(1024);
    tokio::spawn(process_events(rx));
    EventSender::new(tx)
}

/// Background consumer: structured logging of every lifecycle event.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OrderCreated {
                order_number,
                user_id,
                ..
            } => info!(order_number, %user_id, "order created"),
            Event::OrderStatusChanged {
                order_number,
                old_status,
                new_status,
                source,
            } => info!(
                order_number,
                old = %old_status,
                new = %new_status,
                ?source,
                "order status changed"
            ),
            Event::PaymentConfirmed {
                order_number,
                provider,
            } => info!(order_number, provider, "payment confirmed"),
            Event::CheckoutCompleted {
                user_id,
                order_numbers,
                split,
            } => info!(%user_id, ?order_numbers, split, "checkout completed"),
            Event::CheckoutRolledBack {
                user_id,
                cancelled_order_numbers,
            } => warn!(%user_id, ?cancelled_order_numbers, "checkout rolled back"),
            Event::B2bSalePushed {
                order_number,
                external_sale_id,
            } => info!(order_number, external_sale_id, "sale pushed to B2B system"),
        }
    }
}
