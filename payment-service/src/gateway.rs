use async_trait::async_trait;
use rand::Rng;
use shared::PaymentStatus;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, order_id: Uuid, amount: i64) -> PaymentStatus;
}

/// Simulated card processor: approves with a fixed probability after a
/// random delay.
pub struct RandomGateway {
    success_rate: f64,
    max_latency: Duration,
}

impl RandomGateway {
    pub fn new(success_rate: f64, max_latency: Duration) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            max_latency,
        }
    }
}

#[async_trait]
impl PaymentGateway for RandomGateway {
    async fn charge(&self, order_id: Uuid, amount: i64) -> PaymentStatus {
        let (approved, latency) = {
            let mut rng = rand::thread_rng();
            let max_ms = self.max_latency.as_millis() as u64;
            (rng.gen_bool(self.success_rate), Duration::from_millis(rng.gen_range(0..=max_ms)))
        };
        tokio::time::sleep(latency).await;

        debug!(order_id = %order_id, amount, approved, latency_ms = latency.as_millis() as u64, "Payment simulated");
        if approved {
            PaymentStatus::Processed
        } else {
            PaymentStatus::Failed
        }
    }
}
