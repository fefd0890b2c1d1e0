// ============================================================================
// Storage - Inventory Ledger and Order Repository
// ============================================================================
//
// Two seams, one per concern:
// - InventoryLedger: atomic stock reservation against the catalog
// - OrderRepository: order persistence with idempotent payment merges
//
// Both are implemented by PgStore (production) and MemoryStore (local runs
// and tests). Business rules for merges live on the Order aggregate so both
// stores behave identically.
//
// ============================================================================

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::order::{Confirmation, NewOrder, Order, OrderError};
use crate::domain::product::Reservation;
use crate::utils::IsTransient;

pub use memory::{load_catalog, MemoryStore};
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Product not found: {0}")]
    ProductNotFound(Uuid),

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error(transparent)]
    Rule(#[from] OrderError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            )
        )
    }
}

/// Outcome of recording a provider confirmation against an order.
#[derive(Debug, Clone)]
pub enum MarkPaid {
    /// The order transitioned to paid just now.
    Applied(Order),
    /// The order already carried this receipt. Returned unchanged.
    AlreadyPaid(Order),
}

impl MarkPaid {
    pub fn order(&self) -> &Order {
        match self {
            MarkPaid::Applied(order) | MarkPaid::AlreadyPaid(order) => order,
        }
    }
}

#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Atomically decrement stock, failing without any change when the
    /// product is unknown or has fewer than `quantity` units.
    async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<Reservation, StoreError>;

    /// Return previously reserved units. Compensation only.
    async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist the order and all of its lines in one atomic write.
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError>;

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, StoreError>;

    /// Newest first.
    async fn find_by_owner(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Newest first.
    async fn find_all(&self) -> Result<Vec<Order>, StoreError>;

    /// Claim an order awaiting payment for one payment attempt.
    ///
    /// At most one attempt holds the claim at a time. A claim taken before
    /// `stale_before` counts as abandoned and may be taken over. Refuses with
    /// `OrderError::PaymentInProgress`, `AlreadyPaid` or `Expired`.
    async fn claim_payment(
        &self,
        order_id: Uuid,
        attempt_id: Uuid,
        claimed_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Order, StoreError>;

    /// Drop the claim if `attempt_id` still holds it.
    async fn release_payment_claim(&self, order_id: Uuid, attempt_id: Uuid)
        -> Result<(), StoreError>;

    /// Record a provider confirmation. Safe against concurrent delivery of
    /// the same confirmation; conflicting receipts surface as
    /// `StoreError::Rule(OrderError::ConflictingConfirmation)`.
    async fn mark_paid(
        &self,
        order_id: Uuid,
        confirmation: Confirmation,
        paid_at: DateTime<Utc>,
    ) -> Result<MarkPaid, StoreError>;

    async fn mark_delivered(
        &self,
        order_id: Uuid,
        delivered_at: DateTime<Utc>,
    ) -> Result<Order, StoreError>;

    /// Expire unpaid orders created before `created_before` and return their
    /// reserved stock to the catalog, in one atomic step per store.
    async fn expire_unpaid(
        &self,
        created_before: DateTime<Utc>,
        expired_at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_faults_are_transient() {
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::ProductNotFound(Uuid::new_v4()).is_transient());
    }
}
