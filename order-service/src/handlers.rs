use async_trait::async_trait;
use serde::Deserialize;
use shared::consumer::{EventHandler, HandlerError};
use shared::{Event, OrderStatus};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::OrderError;
use crate::service::OrderService;

/// Status events carry either the order itself (`id`) or a payment
/// (`order_id`).
#[derive(Debug, Deserialize)]
struct StatusPayload {
    order_id: Option<Uuid>,
    id: Option<Uuid>,
}

/// Applies `order.processing`, `order.completed` and `order.failed` events
/// to the stored order.
pub struct StatusEventHandler {
    service: Arc<OrderService>,
}

impl StatusEventHandler {
    pub fn new(service: Arc<OrderService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for StatusEventHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let status = OrderStatus::from_event_type(&event.event_type).ok_or_else(|| {
            HandlerError::InvalidPayload(format!("not a status event: {}", event.event_type))
        })?;
        let payload: StatusPayload = event
            .payload_as()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        let order_id = payload
            .order_id
            .or(payload.id)
            .ok_or_else(|| HandlerError::InvalidPayload("missing order id".to_string()))?;

        match self.service.record_status(order_id, status).await {
            Ok(order) => {
                debug!(order_id = %order_id, status = %order.status, "Status event applied");
                Ok(())
            }
            Err(OrderError::InvalidTransition { from, to }) => {
                info!(order_id = %order_id, from = %from, to = %to, "Ignoring stale status event");
                Ok(())
            }
            Err(e @ OrderError::NotFound(_)) => Err(HandlerError::InvalidPayload(e.to_string())),
            Err(e) => Err(HandlerError::Transient(e.to_string())),
        }
    }
}
