use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;
use super::value_objects::{
    Confirmation, OrderLine, OrderStatus, PaymentMethod, PriceBreakdown, ShippingAddress,
};

// ============================================================================
// Order Aggregate
// ============================================================================
//
// Created once, with all of its lines, awaiting payment. After that only the
// payment, delivery and expiry fields ever change, and only through the
// merge methods below, so every store applies identical rules.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    // Identity
    pub id: Uuid,
    pub user_id: Uuid,

    // Immutable after creation
    pub payment_method: PaymentMethod,
    pub payment_currency: String,
    #[serde(rename = "orderItems")]
    pub lines: Vec<OrderLine>,
    #[serde(flatten)]
    pub prices: PriceBreakdown,
    pub shipping_address: ShippingAddress,
    pub created_at: DateTime<Utc>,

    // Settlement
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_confirmation: Option<Confirmation>,

    // Fulfillment
    pub is_delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,

    pub expired_at: Option<DateTime<Utc>>,
}

/// Result of merging a confirmation into an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMerge {
    /// The order moved to paid.
    Applied,
    /// The order was already paid with this receipt; nothing changed.
    Duplicate,
}

/// Everything needed to persist a brand new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub lines: Vec<OrderLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_currency: String,
    pub prices: PriceBreakdown,
}

impl NewOrder {
    pub fn into_order(self, id: Uuid, created_at: DateTime<Utc>) -> Order {
        Order {
            id,
            user_id: self.user_id,
            payment_method: self.payment_method,
            payment_currency: self.payment_currency,
            lines: self.lines,
            prices: self.prices,
            shipping_address: self.shipping_address,
            created_at,
            is_paid: false,
            paid_at: None,
            payment_confirmation: None,
            is_delivered: false,
            delivered_at: None,
            expired_at: None,
        }
    }
}

impl Order {
    pub fn status(&self) -> OrderStatus {
        if self.is_delivered {
            OrderStatus::Delivered
        } else if self.is_paid {
            OrderStatus::Paid
        } else if self.expired_at.is_some() {
            OrderStatus::Expired
        } else {
            OrderStatus::AwaitingPayment
        }
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    /// Only orders still awaiting payment may start a payment attempt.
    pub fn ensure_payable(&self) -> Result<(), OrderError> {
        match self.status() {
            OrderStatus::AwaitingPayment => Ok(()),
            OrderStatus::Paid | OrderStatus::Delivered => Err(OrderError::AlreadyPaid(self.id)),
            OrderStatus::Expired => Err(OrderError::Expired(self.id)),
        }
    }

    /// Idempotent merge of a provider confirmation.
    ///
    /// The first receipt wins. Re-delivering that receipt is a no-op; any
    /// other receipt is refused and leaves the recorded one untouched.
    pub fn apply_payment(
        &mut self,
        confirmation: Confirmation,
        paid_at: DateTime<Utc>,
    ) -> Result<PaymentMerge, OrderError> {
        if self.is_paid {
            return match &self.payment_confirmation {
                Some(existing) if existing.same_receipt(&confirmation) => {
                    Ok(PaymentMerge::Duplicate)
                }
                existing => Err(OrderError::ConflictingConfirmation {
                    order_id: self.id,
                    existing: existing
                        .as_ref()
                        .map(Confirmation::label)
                        .unwrap_or_else(|| "<none>".to_string()),
                    incoming: confirmation.label(),
                }),
            };
        }

        if self.expired_at.is_some() {
            return Err(OrderError::Expired(self.id));
        }

        self.is_paid = true;
        self.paid_at = Some(paid_at);
        self.payment_confirmation = Some(confirmation);
        Ok(PaymentMerge::Applied)
    }

    /// Returns `true` when the order changed.
    pub fn apply_delivery(&mut self, delivered_at: DateTime<Utc>) -> Result<bool, OrderError> {
        if !self.is_paid {
            return Err(OrderError::NotPaid(self.id));
        }
        if self.is_delivered {
            return Ok(false);
        }

        self.is_delivered = true;
        self.delivered_at = Some(delivered_at);
        Ok(true)
    }

    /// Returns `true` when the order was awaiting payment and is now expired.
    pub fn expire(&mut self, expired_at: DateTime<Utc>) -> bool {
        if self.status() != OrderStatus::AwaitingPayment {
            return false;
        }
        self.expired_at = Some(expired_at);
        true
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
