use uuid::Uuid;

use crate::domain::order::OrderError;
use crate::payments::PaymentError;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    InsufficientStock,
    ProductNotFound,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientStock => "insufficient_stock",
            RejectionReason::ProductNotFound => "product_not_found",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Validation(OrderError),

    #[error("Checkout rejected ({}) for product {product_id}", reason.as_str())]
    Rejected {
        reason: RejectionReason,
        product_id: Uuid,
    },

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Not authorized to access this order")]
    Unauthorized,

    #[error("Order {0} is already paid")]
    AlreadyPaid(Uuid),

    #[error("Order {0} has expired")]
    OrderExpired(Uuid),

    #[error("A payment for order {0} is already in progress")]
    PaymentInProgress(Uuid),

    #[error("Order {0} must be paid before delivery")]
    NotPaid(Uuid),

    #[error("Payment for order {order_id} declined: {reason}")]
    PaymentDeclined { order_id: Uuid, reason: String },

    #[error("Payment provider failed for order {order_id}: {source}")]
    Provider {
        order_id: Uuid,
        #[source]
        source: PaymentError,
    },

    #[error(transparent)]
    ConflictingConfirmation(OrderError),

    #[error(transparent)]
    Storage(StoreError),
}

impl From<OrderError> for CheckoutError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::AlreadyPaid(id) => CheckoutError::AlreadyPaid(id),
            OrderError::Expired(id) => CheckoutError::OrderExpired(id),
            OrderError::PaymentInProgress(id) => CheckoutError::PaymentInProgress(id),
            OrderError::NotPaid(id) => CheckoutError::NotPaid(id),
            err @ OrderError::ConflictingConfirmation { .. } => {
                CheckoutError::ConflictingConfirmation(err)
            }
            err => CheckoutError::Validation(err),
        }
    }
}

impl From<StoreError> for CheckoutError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProductNotFound(product_id) => CheckoutError::Rejected {
                reason: RejectionReason::ProductNotFound,
                product_id,
            },
            StoreError::InsufficientStock { product_id, .. } => CheckoutError::Rejected {
                reason: RejectionReason::InsufficientStock,
                product_id,
            },
            StoreError::OrderNotFound(id) => CheckoutError::OrderNotFound(id),
            StoreError::Rule(err) => err.into(),
            err => CheckoutError::Storage(err),
        }
    }
}
