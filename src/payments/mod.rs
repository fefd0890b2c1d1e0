// ============================================================================
// Payment Gateway Adapter
// ============================================================================
//
// One trait over both provider families. A gateway answers a payment either
// right away (card charge -> Settled) or later through a signed callback
// (invoice -> Pending). The orchestrator branches once on that tag and never
// on the provider type.
//
// ============================================================================

pub mod card;
pub mod invoice;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{Confirmation, PaymentMethod};
use crate::utils::{CircuitBreakerError, CircuitState, IsTransient};

pub use card::{StripeCardGateway, StripeConfig};
pub use invoice::{BitpayConfig, BitpayInvoiceGateway};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment declined: {reason}")]
    Declined { reason: String },

    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        transient: bool,
    },

    #[error("{0} is unavailable (circuit open)")]
    CircuitOpen(&'static str),

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },

    #[error("A payment token is required for card payments")]
    MissingToken,

    #[error("Malformed provider payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,
}

impl IsTransient for PaymentError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            PaymentError::Provider {
                transient: true,
                ..
            }
        )
    }
}

impl PaymentError {
    pub(crate) fn transient(provider: &'static str, message: impl Into<String>) -> Self {
        PaymentError::Provider {
            provider,
            message: message.into(),
            transient: true,
        }
    }

    pub(crate) fn permanent(provider: &'static str, message: impl Into<String>) -> Self {
        PaymentError::Provider {
            provider,
            message: message.into(),
            transient: false,
        }
    }

    pub(crate) fn from_breaker(provider: &'static str, err: CircuitBreakerError<Self>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen => PaymentError::CircuitOpen(provider),
            CircuitBreakerError::OperationFailed(err) => err,
        }
    }
}

/// What to charge and where the provider should report back.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    /// Fresh for every payment attempt on the order; provider retries
    /// within one attempt reuse it
    pub attempt_id: Uuid,
    pub amount: Decimal,
    /// Currency the amount is expressed in (the store's base currency)
    pub currency: String,
    /// Currency the shopper settles in; differs from `currency` for invoices
    pub settlement_currency: String,
    pub payment_token: Option<String>,
    pub buyer_email: Option<String>,
    pub notify_url: String,
    pub redirect_url: String,
}

/// Redirect handle for a pending invoice.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceHandle {
    pub invoice_id: String,
    pub url: String,
    pub status: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Settled(Confirmation),
    Pending(InvoiceHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStatus {
    Settled,
    Failed,
    Pending,
}

/// A verified, parsed provider callback.
#[derive(Debug, Clone)]
pub struct ProviderCallback {
    pub order_id: Uuid,
    pub reference: String,
    pub status: SettlementStatus,
    pub raw_status: String,
    pub detail: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name recorded on confirmations (`stripe`, `bitpay`).
    fn provider(&self) -> &'static str;

    fn method(&self) -> PaymentMethod;

    async fn charge_synchronously(
        &self,
        _request: &PaymentRequest,
    ) -> Result<Confirmation, PaymentError> {
        Err(PaymentError::Unsupported {
            provider: self.provider(),
            capability: "synchronous charges",
        })
    }

    async fn create_async_invoice(
        &self,
        _request: &PaymentRequest,
    ) -> Result<InvoiceHandle, PaymentError> {
        Err(PaymentError::Unsupported {
            provider: self.provider(),
            capability: "invoices",
        })
    }

    fn verify_webhook_signature(
        &self,
        _payload: &[u8],
        _signature: Option<&str>,
    ) -> Result<(), PaymentError> {
        Err(PaymentError::Unsupported {
            provider: self.provider(),
            capability: "webhooks",
        })
    }

    fn parse_callback(&self, _payload: &[u8]) -> Result<ProviderCallback, PaymentError> {
        Err(PaymentError::Unsupported {
            provider: self.provider(),
            capability: "webhooks",
        })
    }

    async fn circuit_state(&self) -> CircuitState {
        CircuitState::Closed
    }

    /// Drive one payment attempt through whichever capability this
    /// provider family has.
    async fn begin_payment(&self, request: &PaymentRequest) -> Result<PaymentOutcome, PaymentError> {
        match self.method() {
            PaymentMethod::Card => self
                .charge_synchronously(request)
                .await
                .map(PaymentOutcome::Settled),
            PaymentMethod::CryptoInvoice => self
                .create_async_invoice(request)
                .await
                .map(PaymentOutcome::Pending),
        }
    }
}

/// The configured gateway for each payment method.
#[derive(Clone)]
pub struct PaymentGateways {
    card: Arc<dyn PaymentGateway>,
    invoice: Arc<dyn PaymentGateway>,
}

impl PaymentGateways {
    pub fn new(card: Arc<dyn PaymentGateway>, invoice: Arc<dyn PaymentGateway>) -> Self {
        Self { card, invoice }
    }

    pub fn for_method(&self, method: PaymentMethod) -> &Arc<dyn PaymentGateway> {
        match method {
            PaymentMethod::Card => &self.card,
            PaymentMethod::CryptoInvoice => &self.invoice,
        }
    }

    pub fn invoice(&self) -> Arc<dyn PaymentGateway> {
        self.invoice.clone()
    }

    pub fn all(&self) -> [&Arc<dyn PaymentGateway>; 2] {
        [&self.card, &self.invoice]
    }
}

/// Minor units (cents) for providers that take integer amounts.
pub(crate) fn to_minor_units(amount: Decimal) -> Result<i64, PaymentError> {
    use rust_decimal::prelude::ToPrimitive;

    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .ok_or_else(|| PaymentError::MalformedPayload(format!("amount out of range: {}", amount)))
}
