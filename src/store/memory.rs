use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{InventoryLedger, MarkPaid, OrderRepository, StoreError};
use crate::domain::order::{Confirmation, NewOrder, Order, OrderError, PaymentMerge};
use crate::domain::product::{Product, Reservation};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// Catalog and orders behind one async mutex. Every operation runs under the
// lock, which gives the same atomicity the conditional SQL gives PgStore.
//
// ============================================================================

#[derive(Default)]
struct Inner {
    products: HashMap<Uuid, Product>,
    orders: Vec<Order>,
    /// order id -> (attempt id, claimed at)
    payment_claims: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let products = products.into_iter().map(|p| (p.id, p)).collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                products,
                ..Inner::default()
            })),
        }
    }

    #[cfg(test)]
    pub async fn stock_of(&self, product_id: Uuid) -> Option<i32> {
        let inner = self.inner.lock().await;
        inner.products.get(&product_id).map(|p| p.count_in_stock)
    }

    /// Test hook for backdating orders so expiry can be exercised.
    #[cfg(test)]
    pub async fn set_created_at(&self, order_id: Uuid, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.iter_mut().find(|o| o.id == order_id) {
            order.created_at = created_at;
        }
    }
}

/// Read a JSON array of catalog products. Negative prices or stock counts
/// reject the whole file.
pub async fn load_catalog(path: impl AsRef<Path>) -> Result<Vec<Product>, StoreError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StoreError::Corrupt(format!("cannot read {}: {}", path.display(), e)))?;

    let products: Vec<Product> = serde_json::from_str(&raw)
        .map_err(|e| StoreError::Corrupt(format!("invalid catalog {}: {}", path.display(), e)))?;

    if let Some(bad) = products
        .iter()
        .find(|p| p.count_in_stock < 0 || p.price.is_sign_negative())
    {
        return Err(StoreError::Corrupt(format!(
            "invalid catalog {}: product {} has price {} and stock {}",
            path.display(),
            bad.id,
            bad.price,
            bad.count_in_stock
        )));
    }

    Ok(products)
}

fn newest_first(mut orders: Vec<Order>) -> Vec<Order> {
    // Stable sort over insertion order reversed: ties keep newest first.
    orders.reverse();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    orders
}

#[async_trait]
impl InventoryLedger for MemoryStore {
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<Reservation, StoreError> {
        let mut inner = self.inner.lock().await;
        let product = inner
            .products
            .get_mut(&product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;

        if product.count_in_stock < quantity {
            return Err(StoreError::InsufficientStock {
                product_id,
                requested: quantity,
                available: product.count_in_stock,
            });
        }

        product.count_in_stock -= quantity;
        Ok(Reservation {
            product_id,
            quantity,
            unit_price: product.price,
        })
    }

    async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let product = inner
            .products
            .get_mut(&product_id)
            .ok_or(StoreError::ProductNotFound(product_id))?;

        product.count_in_stock += quantity;
        Ok(())
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let order = order.into_order(Uuid::new_v4(), Utc::now());
        let mut inner = self.inner.lock().await;
        inner.orders.push(order.clone());
        Ok(order)
    }

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.orders.iter().find(|o| o.id == order_id).cloned())
    }

    async fn find_by_owner(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().await;
        let owned = inner
            .orders
            .iter()
            .filter(|o| o.is_owned_by(user_id))
            .cloned()
            .collect();
        Ok(newest_first(owned))
    }

    async fn find_all(&self) -> Result<Vec<Order>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(newest_first(inner.orders.clone()))
    }

    async fn claim_payment(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            orders,
            payment_claims,
            ..
        } = &mut *inner;

        let order = orders
            .iter()
            .find(|o| o.id == order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        order.ensure_payable()?;

        if let Some((_, held_since)) = payment_claims.get(&order_id) {
            if *held_since >= stale_before {
                return Err(OrderError::PaymentInProgress(order_id).into());
            }
        }

        payment_claims.insert(order_id, (attempt_id, claimed_at));
        Ok(order.clone())
    }

    async fn release_payment_claim(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.payment_claims.get(&order_id), Some((held, _)) if *held == attempt_id) {
            inner.payment_claims.remove(&order_id);
        }
        Ok(())
    }

    async fn mark_paid(
        &self,
        order_id: Uuid,
        confirmation: Confirmation,
        paid_at: DateTime<Utc>,
    ) -> Result<MarkPaid, StoreError> {
        let mut inner = self.inner.lock().await;
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;

        match order.apply_payment(confirmation, paid_at)? {
            PaymentMerge::Applied => Ok(MarkPaid::Applied(order.clone())),
            PaymentMerge::Duplicate => Ok(MarkPaid::AlreadyPaid(order.clone())),
        }
    }

    async fn mark_delivered(
        &self,
        order_id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut inner = self.inner.lock().await;
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;

        order.apply_delivery(delivered_at)?;
        Ok(order.clone())
    }

    async fn expire_unpaid(
        &self,
        created_before: DateTime<Utc>,
        expired_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Inner {
            products, orders, ..
        } = &mut *inner;

        let mut expired = Vec::new();
        for order in orders.iter_mut().filter(|o| o.created_at < created_before) {
            if !order.expire(expired_at) {
                continue;
            }
            for line in &order.lines {
                if let Some(product) = products.get_mut(&line.product_id) {
                    product.count_in_stock += line.quantity;
                }
            }
            expired.push(order.id);
        }

        Ok(expired)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
