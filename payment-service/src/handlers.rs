//! Payment processing for `order.created`.
//!
//! A redelivered order whose payment is already stored only republishes the
//! outcome, so the gateway is not charged and stock is not reserved twice.
//! Stock reserved by a delivery that then fails to record its payment, or
//! loses the insert to a concurrent delivery, is given back. The one
//! unguarded window is a crash after stock was reserved and before the
//! payment row was written.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use shared::broker::EventPublisher;
use shared::consumer::{EventHandler, HandlerError};
use shared::metrics::MetricsSink;
use shared::{event_types, CartItem, Event, Payment, PaymentStatus};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ProcessError;
use crate::gateway::PaymentGateway;
use crate::repository::PaymentStore;
use crate::stock_client::StockClient;

#[derive(Debug, Deserialize)]
struct OrderCreated {
    id: Uuid,
    items: Vec<CartItem>,
    total: i64,
}

pub struct OrderCreatedHandler {
    store: Arc<dyn PaymentStore>,
    stock: Arc<dyn StockClient>,
    gateway: Arc<dyn PaymentGateway>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
}

impl OrderCreatedHandler {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        stock: Arc<dyn StockClient>,
        gateway: Arc<dyn PaymentGateway>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            stock,
            gateway,
            publisher,
            metrics,
        }
    }

    async fn process(&self, event: &Event) -> Result<(), ProcessError> {
        let order: OrderCreated = event
            .payload_as()
            .map_err(|e| ProcessError::InvalidOrder(e.to_string()))?;

        if let Some(payment) = self.store.find(order.id).await? {
            info!(order_id = %order.id, status = payment.status.as_str(), "Payment already recorded, republishing outcome");
            return self.publish_outcome(&payment).await;
        }

        self.publish_processing(order.id).await;

        let status = self.gateway.charge(order.id, order.total).await;
        let reserved = status == PaymentStatus::Processed;
        if reserved {
            self.reserve_stock(order.id, &order.items).await?;
        }

        let payment = Payment::new(order.id, order.total, status);
        let payment = match self.store.insert_if_absent(&payment).await {
            Ok(true) => payment,
            Ok(false) => {
                // A concurrent delivery of the same order recorded first.
                if reserved {
                    self.release_stock(order.id, &order.items).await;
                }
                self.store.find(order.id).await?.unwrap_or(payment)
            }
            Err(e) => {
                if reserved {
                    self.release_stock(order.id, &order.items).await;
                }
                return Err(e.into());
            }
        };
        info!(order_id = %order.id, amount = order.total, status = payment.status.as_str(), "Payment recorded");

        self.publish_outcome(&payment).await
    }

    async fn publish_processing(&self, order_id: Uuid) {
        let event_type = event_types::ORDER_PROCESSING;
        let result = match Event::new(event_type, &json!({ "id": order_id })) {
            Ok(event) => self.publisher.publish(&event).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            warn!(order_id = %order_id, "Failed to publish processing event: {}", e);
        }
        self.metrics.event_published(event_type, result.is_ok());
    }

    async fn publish_outcome(&self, payment: &Payment) -> Result<(), ProcessError> {
        let event_type = payment.status.order_status().event_type();
        let result = match Event::new(event_type, payment) {
            Ok(event) => self.publisher.publish(&event).await,
            Err(e) => Err(e.into()),
        };
        self.metrics.event_published(event_type, result.is_ok());
        Ok(result?)
    }

    /// Decrements stock item by item. When one update fails, the ones
    /// already applied are given back before the error is returned.
    async fn reserve_stock(&self, order_id: Uuid, items: &[CartItem]) -> Result<(), ProcessError> {
        for (index, item) in items.iter().enumerate() {
            if let Err(source) = self.stock.update_quantity(&item.product_id, -item.quantity).await {
                warn!(order_id = %order_id, product_id = %item.product_id, "Stock update failed: {}", source);
                self.release_stock(order_id, &items[..index]).await;
                return Err(ProcessError::Stock {
                    product_id: item.product_id.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    async fn release_stock(&self, order_id: Uuid, items: &[CartItem]) {
        for item in items {
            if let Err(e) = self.stock.update_quantity(&item.product_id, item.quantity).await {
                warn!(
                    order_id = %order_id,
                    product_id = %item.product_id,
                    quantity = item.quantity,
                    "Failed to release reserved stock: {}",
                    e
                );
            }
        }
    }
}

#[async_trait]
impl EventHandler for OrderCreatedHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.process(event).await.map_err(HandlerError::from)
    }
}
