use shared::OrderStatus;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("corrupt order row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order has no items")]
    NoItems,

    #[error("invalid item at position {index}: {reason}")]
    InvalidItem { index: usize, reason: String },

    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
