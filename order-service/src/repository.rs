use async_trait::async_trait;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::Order;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::models::DbOrder;
use crate::schema::orders;

pub type DbPool = Pool<AsyncPgConnection>;

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

impl PageRequest {
    /// Page numbers start at 1; the page size is clamped to `1..=100`.
    pub fn new(page: Option<i64>, page_size: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
}

impl OrderPage {
    pub fn total_pages(&self) -> i64 {
        (self.total_count + self.page_size - 1) / self.page_size
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Inserts the order, or overwrites items, total, status and
    /// `updated_at` of an existing one. `created_at` is never overwritten.
    async fn save(&self, order: &Order) -> Result<(), RepositoryError>;

    async fn find(&self, id: Uuid) -> Result<Option<Order>, RepositoryError>;

    /// Newest first.
    async fn list(&self, page: PageRequest) -> Result<OrderPage, RepositoryError>;
}

pub struct PgOrderRepository {
    pool: DbPool,
}

impl PgOrderRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, RepositoryError> {
        self.pool
            .get()
            .await
            .map_err(|e| RepositoryError::Pool(e.to_string()))
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn save(&self, order: &Order) -> Result<(), RepositoryError> {
        let row = DbOrder::try_from(order)?;
        let mut conn = self.conn().await?;

        diesel::insert_into(orders::table)
            .values(&row)
            .on_conflict(orders::id)
            .do_update()
            .set((
                orders::items.eq(excluded(orders::items)),
                orders::total.eq(excluded(orders::total)),
                orders::status.eq(excluded(orders::status)),
                orders::updated_at.eq(excluded(orders::updated_at)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>, RepositoryError> {
        let mut conn = self.conn().await?;
        let row = orders::table
            .find(id)
            .select(DbOrder::as_select())
            .first::<DbOrder>(&mut conn)
            .await
            .optional()?;
        row.map(Order::try_from).transpose()
    }

    async fn list(&self, page: PageRequest) -> Result<OrderPage, RepositoryError> {
        let mut conn = self.conn().await?;

        let total_count: i64 = orders::table.count().get_result(&mut conn).await?;
        let rows = orders::table
            .select(DbOrder::as_select())
            .order((orders::created_at.desc(), orders::id))
            .limit(page.page_size)
            .offset(page.offset())
            .load::<DbOrder>(&mut conn)
            .await?;

        let orders = rows
            .into_iter()
            .map(Order::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OrderPage {
            orders,
            total_count,
            page: page.page,
            page_size: page.page_size,
        })
    }
}

#[cfg(test)]
pub mod memory {
    use super::{OrderPage, OrderRepository, PageRequest};
    use crate::error::RepositoryError;
    use async_trait::async_trait;
    use shared::Order;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Same upsert semantics as the Postgres repository, for service tests.
    #[derive(Default)]
    pub struct MemoryOrderRepository {
        orders: Mutex<HashMap<Uuid, Order>>,
        writes: AtomicUsize,
    }

    impl MemoryOrderRepository {
        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub fn get(&self, id: Uuid) -> Option<Order> {
            self.orders.lock().unwrap().get(&id).cloned()
        }
    }

    #[async_trait]
    impl OrderRepository for MemoryOrderRepository {
        async fn save(&self, order: &Order) -> Result<(), RepositoryError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut orders = self.orders.lock().unwrap();
            match orders.get_mut(&order.id) {
                Some(existing) => {
                    existing.items = order.items.clone();
                    existing.total = order.total;
                    existing.status = order.status;
                    existing.updated_at = order.updated_at;
                }
                None => {
                    orders.insert(order.id, order.clone());
                }
            }
            Ok(())
        }

        async fn find(&self, id: Uuid) -> Result<Option<Order>, RepositoryError> {
            Ok(self.get(id))
        }

        async fn list(&self, page: PageRequest) -> Result<OrderPage, RepositoryError> {
            let mut all: Vec<Order> = self.orders.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            let total_count = all.len() as i64;
            let orders = all
                .into_iter()
                .skip(page.offset() as usize)
                .take(page.page_size as usize)
                .collect();
            Ok(OrderPage {
                orders,
                total_count,
                page: page.page,
                page_size: page.page_size,
            })
        }
    }
}
