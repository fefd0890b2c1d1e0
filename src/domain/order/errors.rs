use uuid::Uuid;

use super::value_objects::PaymentMethod;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order items cannot be empty")]
    EmptyCart,

    #[error("Invalid quantity {quantity} for product {product_id}")]
    InvalidQuantity { product_id: Uuid, quantity: i32 },

    #[error("Too many order items: {0}")]
    TooManyLines(usize),

    #[error("Invalid shipping address field: {0}")]
    InvalidAddress(&'static str),

    #[error("Currency {currency} is not accepted for {} payments", method.as_str())]
    UnsupportedCurrency {
        method: PaymentMethod,
        currency: String,
    },

    #[error("Order {order_id} already paid with {existing}, refusing {incoming}")]
    ConflictingConfirmation {
        order_id: Uuid,
        existing: String,
        incoming: String,
    },

    #[error("Order {0} is already paid")]
    AlreadyPaid(Uuid),

    #[error("A payment for order {0} is already in progress")]
    PaymentInProgress(Uuid),

    #[error("Order {0} has expired")]
    Expired(Uuid),

    #[error("Order {0} must be paid before delivery")]
    NotPaid(Uuid),
}
