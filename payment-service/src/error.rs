use shared::consumer::HandlerError;
use shared::BrokerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StockError {
    #[error("stock service rejected update ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("stock service returned status {0}")]
    Status(u16),

    #[error("stock service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("corrupt payment row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("invalid order payload: {0}")]
    InvalidOrder(String),

    #[error("stock update failed for product {product_id}: {source}")]
    Stock {
        product_id: String,
        #[source]
        source: StockError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to publish payment outcome: {0}")]
    Publish(#[from] BrokerError),
}

impl From<ProcessError> for HandlerError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::InvalidOrder(_) => HandlerError::InvalidPayload(err.to_string()),
            _ => HandlerError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_payload_errors_are_final() {
        let invalid: HandlerError = ProcessError::InvalidOrder("missing items".to_string()).into();
        assert!(!invalid.is_retryable());

        let stock: HandlerError = ProcessError::Stock {
            product_id: "p-1".to_string(),
            source: StockError::Status(503),
        }
        .into();
        assert!(stock.is_retryable());

        let publish: HandlerError = ProcessError::Publish(BrokerError::Closed).into();
        assert!(publish.is_retryable());
    }
}
