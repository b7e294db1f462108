use shared::CartItem;

use crate::error::OrderError;

/// Validates the cart and returns its total in whole currency units:
/// the sum of `price * quantity`, rounded half-up.
pub fn calculate_total(items: &[CartItem]) -> Result<i64, OrderError> {
    if items.is_empty() {
        return Err(OrderError::NoItems);
    }

    let mut sum = 0.0_f64;
    for (index, item) in items.iter().enumerate() {
        if item.quantity <= 0 {
            return Err(OrderError::InvalidItem {
                index,
                reason: format!("quantity must be positive, got {}", item.quantity),
            });
        }
        if !item.price.is_finite() || item.price < 0.0 {
            return Err(OrderError::InvalidItem {
                index,
                reason: format!("price must be a non-negative number, got {}", item.price),
            });
        }
        sum += item.price * f64::from(item.quantity);
    }

    let total = sum.round();
    if !total.is_finite() || total > i64::MAX as f64 {
        return Err(OrderError::InvalidItem {
            index: items.len() - 1,
            reason: "order total overflows".to_string(),
        });
    }
    Ok(total as i64)
}
