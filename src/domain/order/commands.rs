use uuid::Uuid;

use super::errors::OrderError;
use super::value_objects::{CartLine, PaymentMethod, ShippingAddress};

// ============================================================================
// Order Commands - Represent shopper intent
// ============================================================================

pub const MAX_LINE_QUANTITY: i32 = 999;
pub const MAX_CART_LINES: usize = 100;

/// A checkout as submitted by the shopper. Prices are never taken from the
/// client; they come from the catalog during reservation.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub lines: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_currency: Option<String>,
}

impl CheckoutRequest {
    /// Shape checks only. Stock and currency are checked by the orchestrator.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.lines.is_empty() {
            return Err(OrderError::EmptyCart);
        }
        if self.lines.len() > MAX_CART_LINES {
            return Err(OrderError::TooManyLines(self.lines.len()));
        }

        for line in &self.lines {
            if line.quantity < 1 || line.quantity > MAX_LINE_QUANTITY {
                return Err(OrderError::InvalidQuantity {
                    product_id: line.product_id,
                    quantity: line.quantity,
                });
            }
        }

        self.shipping_address.validate()
    }
}

/// The payment details supplied when paying for an existing order.
#[derive(Debug, Clone, Default)]
pub struct PaymentInstrument {
    /// Card token from the provider's client SDK. Unused for invoices.
    pub payment_token: Option<String>,
    pub buyer_email: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_request(lines: Vec<CartLine>) -> CheckoutRequest {
        CheckoutRequest {
            user_id: Uuid::new_v4(),
            lines,
            shipping_address: ShippingAddress {
                street: "1 Main St".to_string(),
                city: "Springfield".to_string(),
                postal_code: "12345".to_string(),
                country: "US".to_string(),
            },
            payment_method: PaymentMethod::Card,
            payment_currency: None,
        }
    }

    #[test]
    fn test_empty_cart_rejected() {
        assert!(matches!(
            create_request(vec![]).validate(),
            Err(OrderError::EmptyCart)
        ));
    }

    #[test]
    fn test_quantity_bounds() {
        let product_id = Uuid::new_v4();
        for quantity in [0, -1, MAX_LINE_QUANTITY + 1] {
            let request = create_request(vec![CartLine { product_id, quantity }]);
            assert!(matches!(
                request.validate(),
                Err(OrderError::InvalidQuantity { .. })
            ));
        }

        let request = create_request(vec![CartLine {
            product_id,
            quantity: MAX_LINE_QUANTITY,
        }]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_too_many_lines() {
        let lines = (0..=MAX_CART_LINES)
            .map(|_| CartLine {
                product_id: Uuid::new_v4(),
                quantity: 1,
            })
            .collect();
        assert!(matches!(
            create_request(lines).validate(),
            Err(OrderError::TooManyLines(_))
        ));
    }
}
