use clap::Parser;
use shared::retry::RetryPolicy;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "payment-service")]
pub struct Args {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "AMQP_URL")]
    pub amqp_url: String,

    #[arg(long, env = "ORDER_EXCHANGE", default_value = "orders")]
    pub exchange: String,

    #[arg(long, env = "ORDER_QUEUE", default_value = "order-created")]
    pub queue: String,

    #[arg(long, env = "PRODUCT_SERVICE_URL")]
    pub product_service_url: String,

    #[arg(long, env = "STOCK_TIMEOUT_SECS", default_value_t = 30)]
    pub stock_timeout_secs: u64,

    /// Probability that a simulated payment is approved.
    #[arg(long, env = "PAYMENT_SUCCESS_RATE", default_value_t = 0.8, value_parser = parse_rate)]
    pub payment_success_rate: f64,

    #[arg(long, env = "MAX_PAYMENT_LATENCY_MS", default_value_t = 3000)]
    pub max_payment_latency_ms: u64,

    #[arg(long, env = "WORKERS", default_value_t = 10)]
    pub workers: usize,

    #[arg(long, env = "PREFETCH", default_value_t = 50, value_parser = clap::value_parser!(u16).range(1..))]
    pub prefetch: u16,

    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_delivery_attempts: u32,
}

fn parse_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{} is not between 0 and 1", rate))
    }
}

impl Args {
    pub fn stock_timeout(&self) -> Duration {
        Duration::from_secs(self.stock_timeout_secs)
    }

    pub fn max_payment_latency(&self) -> Duration {
        Duration::from_millis(self.max_payment_latency_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "payment-service",
        "--database-url",
        "postgres://localhost/payments",
        "--amqp-url",
        "amqp://localhost:5672/%2f",
        "--product-service-url",
        "http://product-service:3010",
    ];

    #[test]
    fn defaults_apply() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert_eq!(args.queue, "order-created");
        assert_eq!(args.exchange, "orders");
        assert_eq!(args.stock_timeout(), Duration::from_secs(30));
        assert_eq!(args.payment_success_rate, 0.8);
        assert_eq!(args.retry_policy().max_attempts, 5);
        assert_eq!(args.workers, 10);
    }

    #[test]
    fn success_rate_must_be_a_probability() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--payment-success-rate", "1.5"]);
        assert!(Args::try_parse_from(argv).is_err());
        assert_eq!(parse_rate("0.25"), Ok(0.25));
    }

    #[test]
    fn zero_prefetch_is_rejected() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--prefetch", "0"]);
        assert!(Args::try_parse_from(argv).is_err());
    }
}
