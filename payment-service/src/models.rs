use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::Payment;
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::payments)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: i64,
    pub status: String,
    pub processed_at: DateTime<Utc>,
}

impl From<&Payment> for DbPayment {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            amount: payment.amount,
            status: payment.status.as_str().to_string(),
            processed_at: payment.processed_at,
        }
    }
}

impl TryFrom<DbPayment> for Payment {
    type Error = StoreError;

    fn try_from(row: DbPayment) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("payment {}: {}", row.id, e)))?;
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            amount: row.amount,
            status,
            processed_at: row.processed_at,
        })
    }
}
