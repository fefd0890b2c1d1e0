use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;

// ============================================================================
// Order Value Objects
// ============================================================================

const MAX_ADDRESS_FIELD_LENGTH: usize = 120;

/// How the shopper chose to pay. The provider names used by the storefront
/// client (`stripe`, `bitpay`) are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "card", alias = "stripe")]
    Card,
    #[serde(rename = "crypto-invoice", alias = "bitpay")]
    CryptoInvoice,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::CryptoInvoice => "crypto-invoice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "card" | "stripe" => Some(PaymentMethod::Card),
            "crypto-invoice" | "bitpay" => Some(PaymentMethod::CryptoInvoice),
            _ => None,
        }
    }
}

/// Lifecycle position of a persisted order, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    Paid,
    Delivered,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    #[serde(alias = "address")]
    pub street: String,
    pub city: String,
    pub postal_code: String,
    pub country: String,
}

impl ShippingAddress {
    pub fn validate(&self) -> Result<(), OrderError> {
        let fields = [
            ("street", &self.street),
            ("city", &self.city),
            ("postalCode", &self.postal_code),
            ("country", &self.country),
        ];

        for (name, value) in fields {
            let value = value.trim();
            if value.is_empty() || value.len() > MAX_ADDRESS_FIELD_LENGTH {
                return Err(OrderError::InvalidAddress(name));
            }
        }

        Ok(())
    }
}

/// A line as submitted from the shopper's cart. Carries no price: the price
/// is read from the catalog when stock is reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// A purchased line, owned by its order. `unit_price` is the catalog price
/// snapshotted at reservation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(rename = "price")]
    pub unit_price: Decimal,
}

impl OrderLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Opaque provider receipt proving a charge or invoice settled.
///
/// Two confirmations are the same receipt when provider and reference match;
/// `detail` is provider chatter (e.g. `confirmed` then `complete` for one
/// invoice) and does not take part in the comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub provider: String,
    pub reference: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl Confirmation {
    pub fn new(provider: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reference: reference.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    pub fn same_receipt(&self, other: &Confirmation) -> bool {
        self.provider == other.provider && self.reference == other.reference
    }

    /// Short form used in logs and error messages.
    pub fn label(&self) -> String {
        format!("{}:{}", self.provider, self.reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBreakdown {
    pub items_price: Decimal,
    pub shipping_price: Decimal,
    pub tax_price: Decimal,
    pub total_price: Decimal,
}

// ============================================================================
// Unit Tests
// ============================================================================
