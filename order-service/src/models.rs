use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared::{CartItem, Order, OrderStatus};
use uuid::Uuid;

use crate::error::RepositoryError;

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbOrder {
    pub id: Uuid,
    pub items: serde_json::Value,
    pub total: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&Order> for DbOrder {
    type Error = RepositoryError;

    fn try_from(order: &Order) -> Result<Self, Self::Error> {
        Ok(Self {
            id: order.id,
            items: serde_json::to_value(&order.items)
                .map_err(|e| RepositoryError::Corrupt(format!("items: {}", e)))?,
            total: order.total,
            status: order.status.as_str().to_string(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }
}

impl TryFrom<DbOrder> for Order {
    type Error = RepositoryError;

    fn try_from(row: DbOrder) -> Result<Self, Self::Error> {
        let items: Vec<CartItem> = serde_json::from_value(row.items)
            .map_err(|e| RepositoryError::Corrupt(format!("order {} items: {}", row.id, e)))?;
        let status: OrderStatus = row
            .status
            .parse()
            .map_err(|e| RepositoryError::Corrupt(format!("order {}: {}", row.id, e)))?;

        Ok(Self {
            id: row.id,
            items,
            total: row.total,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
