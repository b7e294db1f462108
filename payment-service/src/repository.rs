use async_trait::async_trait;
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::Payment;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::DbPayment;
use crate::schema::payments;

pub type DbPool = Pool<AsyncPgConnection>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Writes the payment unless one with the same id exists. Returns
    /// whether a row was written.
    async fn insert_if_absent(&self, payment: &Payment) -> Result<bool, StoreError>;

    async fn find(&self, order_id: Uuid) -> Result<Option<Payment>, StoreError>;
}

pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert_if_absent(&self, payment: &Payment) -> Result<bool, StoreError> {
        let row = DbPayment::from(payment);
        let mut conn = self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))?;

        let inserted = diesel::insert_into(payments::table)
            .values(&row)
            .on_conflict(payments::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn find(&self, order_id: Uuid) -> Result<Option<Payment>, StoreError> {
        let mut conn = self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))?;

        let row = payments::table
            .filter(payments::order_id.eq(order_id))
            .select(DbPayment::as_select())
            .first::<DbPayment>(&mut conn)
            .await
            .optional()?;
        row.map(Payment::try_from).transpose()
    }
}
