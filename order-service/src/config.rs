use clap::Parser;
use shared::retry::RetryPolicy;

#[derive(Debug, Parser)]
#[command(name = "order-service")]
pub struct Args {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "AMQP_URL")]
    pub amqp_url: String,

    #[arg(long, env = "ORDER_EXCHANGE", default_value = "orders")]
    pub exchange: String,

    #[arg(long, env = "STATUS_QUEUE", default_value = "order-status-updates")]
    pub status_queue: String,

    #[arg(long, env = "WORKERS", default_value_t = 10)]
    pub workers: usize,

    #[arg(long, env = "PREFETCH", default_value_t = 50, value_parser = clap::value_parser!(u16).range(1..))]
    pub prefetch: u16,

    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_delivery_attempts: u32,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,
}

impl Args {
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

    const REQUIRED: [&str; 5] = [
        "order-service",
        "--database-url",
        "postgres://localhost/orders",
        "--amqp-url",
        "amqp://localhost:5672/%2f",
    ];

    #[test]
    fn defaults_apply() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert_eq!(args.exchange, "orders");
        assert_eq!(args.status_queue, "order-status-updates");
        assert_eq!(args.workers, 10);
        assert_eq!(args.prefetch, 50);
        assert_eq!(args.retry_policy().max_attempts, 5);
        assert_eq!(args.port, 3001);
    }

    #[test]
    fn prefetch_must_be_bounded() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--prefetch", "0"]);
        assert!(Args::try_parse_from(argv).is_err());

        let mut argv = REQUIRED.to_vec();
        argv.extend(["--prefetch", "1"]);
        assert_eq!(Args::try_parse_from(argv).unwrap().prefetch, 1);
    }

    #[test]
    fn broker_url_is_required() {
        if std::env::var_os("AMQP_URL").is_some() {
            return;
        }
        let result = Args::try_parse_from(["order-service", "--database-url", "postgres://localhost/orders"]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut argv = REQUIRED.to_vec();
        argv.extend(["--max-delivery-attempts", "0"]);
        assert!(Args::try_parse_from(argv).is_err());
    }
}
