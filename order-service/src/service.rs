use shared::broker::EventPublisher;
use shared::metrics::MetricsSink;
use shared::{event_types, CartItem, Event, Order, OrderStatus};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::pricing;
use crate::repository::{OrderPage, OrderRepository, PageRequest};

pub struct OrderService {
    repository: Arc<dyn OrderRepository>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsSink>,
}

impl OrderService {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            repository,
            publisher,
            metrics,
        }
    }

    /// Prices and stores a new order, then announces it with `order.created`.
    /// A failed publish is logged; the order stays stored.
    pub async fn create(&self, items: Vec<CartItem>) -> Result<Order, OrderError> {
        let total = pricing::calculate_total(&items)?;
        let order = Order::new(items, total);

        self.repository.save(&order).await?;
        info!(order_id = %order.id, total, items = order.items.len(), "Order created");

        self.publish(event_types::ORDER_CREATED, &order).await;
        Ok(order)
    }

    /// Moves the order to `status` and publishes `order.<status>`.
    pub async fn update_status(&self, id: Uuid, status: OrderStatus) -> Result<Order, OrderError> {
        let order = self.apply_status(id, status).await?;
        self.publish(status.event_type(), &order).await;
        Ok(order)
    }

    /// Moves the order to `status` without publishing. Used when the status
    /// change itself arrived as an event.
    pub async fn record_status(&self, id: Uuid, status: OrderStatus) -> Result<Order, OrderError> {
        self.apply_status(id, status).await
    }

    pub async fn find(&self, id: Uuid) -> Result<Order, OrderError> {
        self.repository
            .find(id)
            .await?
            .ok_or(OrderError::NotFound(id))
    }

    pub async fn list(&self, page: PageRequest) -> Result<OrderPage, OrderError> {
        Ok(self.repository.list(page).await?)
    }

    async fn apply_status(&self, id: Uuid, status: OrderStatus) -> Result<Order, OrderError> {
        let mut order = self.find(id).await?;

        if !order.status.can_transition_to(status) {
            return Err(OrderError::InvalidTransition {
                from: order.status,
                to: status,
            });
        }

        let previous = order.status;
        order.touch(status);
        self.repository.save(&order).await?;
        info!(order_id = %id, from = %previous, to = %status, "Order status updated");
        Ok(order)
    }

    async fn publish(&self, event_type: &str, order: &Order) {
        let event = match Event::new(event_type, order) {
            Ok(event) => event,
            Err(e) => {
                error!(order_id = %order.id, event_type, "Failed to encode event: {}", e);
                self.metrics.event_published(event_type, false);
                return;
            }
        };

        match self.publisher.publish(&event).await {
            Ok(()) => self.metrics.event_published(event_type, true),
            Err(e) => {
                warn!(order_id = %order.id, event_type, "Failed to publish event: {}", e);
                self.metrics.event_published(event_type, false);
            }
        }
    }
}
