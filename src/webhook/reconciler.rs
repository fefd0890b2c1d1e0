use chrono::Utc;
use std::sync::Arc;

use crate::domain::order::{Confirmation, OrderError};
use crate::metrics::Metrics;
use crate::payments::{PaymentGateway, SettlementStatus};
use crate::store::{MarkPaid, OrderRepository, StoreError};

// ============================================================================
// Webhook Reconciler
// ============================================================================
//
// Every callback is treated as an at-least-once delivery:
//   1. verify the signature before reading any field
//   2. resolve the order it refers to
//   3. settled  -> mark_paid (idempotent merge)
//      failed   -> logged, order left awaiting payment
//      pending  -> ignored
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    MalformedPayload,
    UnknownOrder,
    MethodMismatch,
    ConflictingConfirmation,
    OrderExpired,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::MalformedPayload => "malformed_payload",
            RejectReason::UnknownOrder => "unknown_order",
            RejectReason::MethodMismatch => "method_mismatch",
            RejectReason::ConflictingConfirmation => "conflicting_confirmation",
            RejectReason::OrderExpired => "order_expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Accepted,
    Rejected(RejectReason),
}

pub struct WebhookReconciler {
    orders: Arc<dyn OrderRepository>,
    gateway: Arc<dyn PaymentGateway>,
    metrics: Arc<Metrics>,
}

impl WebhookReconciler {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        gateway: Arc<dyn PaymentGateway>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            orders,
            gateway,
            metrics,
        }
    }

    pub async fn handle_provider_callback(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, StoreError> {
        let outcome = self.reconcile(payload, signature).await;
        let label = match &outcome {
            Ok(WebhookOutcome::Accepted) => "accepted",
            Ok(WebhookOutcome::Rejected(reason)) => reason.as_str(),
            Err(_) => "error",
        };
        self.metrics.record_webhook(label);
        outcome
    }

    async fn reconcile(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, StoreError> {
        let provider = self.gateway.provider();

        if let Err(e) = self.gateway.verify_webhook_signature(payload, signature) {
            tracing::warn!(provider, error = %e, "Rejected callback with bad signature");
            return Ok(WebhookOutcome::Rejected(RejectReason::InvalidSignature));
        }

        let callback = match self.gateway.parse_callback(payload) {
            Ok(callback) => callback,
            Err(e) => {
                tracing::warn!(provider, error = %e, "Rejected malformed callback");
                return Ok(WebhookOutcome::Rejected(RejectReason::MalformedPayload));
            }
        };
        let order_id = callback.order_id;

        let Some(order) = self.orders.find_by_id(order_id).await? else {
            tracing::warn!(
                provider,
                order_id = %order_id,
                reference = %callback.reference,
                "Callback for unknown order"
            );
            return Ok(WebhookOutcome::Rejected(RejectReason::UnknownOrder));
        };

        if order.payment_method != self.gateway.method() {
            tracing::warn!(
                provider,
                order_id = %order_id,
                payment_method = order.payment_method.as_str(),
                "Callback does not match the order's payment method"
            );
            return Ok(WebhookOutcome::Rejected(RejectReason::MethodMismatch));
        }

        match callback.status {
            SettlementStatus::Pending => {
                tracing::debug!(order_id = %order_id, status = %callback.raw_status, "Invoice not settled yet");
                return Ok(WebhookOutcome::Accepted);
            }
            SettlementStatus::Failed => {
                tracing::warn!(
                    order_id = %order_id,
                    reference = %callback.reference,
                    status = %callback.raw_status,
                    "Invoice failed; order left awaiting payment"
                );
                return Ok(WebhookOutcome::Accepted);
            }
            SettlementStatus::Settled => {}
        }

        let confirmation =
            Confirmation::new(provider, callback.reference).with_detail(callback.detail);
        let label = confirmation.label();

        match self.orders.mark_paid(order_id, confirmation, Utc::now()).await {
            Ok(MarkPaid::Applied(_)) => {
                tracing::info!(order_id = %order_id, confirmation = %label, "Order paid via callback");
                self.metrics.record_order_paid("webhook");
                Ok(WebhookOutcome::Accepted)
            }
            Ok(MarkPaid::AlreadyPaid(_)) => {
                tracing::debug!(order_id = %order_id, confirmation = %label, "Duplicate callback ignored");
                Ok(WebhookOutcome::Accepted)
            }
            Err(StoreError::Rule(e @ OrderError::ConflictingConfirmation { .. })) => {
                tracing::error!(order_id = %order_id, error = %e, "Conflicting payment confirmation");
                Ok(WebhookOutcome::Rejected(RejectReason::ConflictingConfirmation))
            }
            Err(StoreError::Rule(OrderError::Expired(_))) => {
                tracing::error!(
                    order_id = %order_id,
                    confirmation = %label,
                    "Payment settled for an expired order; manual refund required"
                );
                Ok(WebhookOutcome::Rejected(RejectReason::OrderExpired))
            }
            Err(StoreError::OrderNotFound(_)) => {
                Ok(WebhookOutcome::Rejected(RejectReason::UnknownOrder))
            }
            Err(e) => {
                tracing::error!(order_id = %order_id, error = %e, "Failed to record callback");
                Err(e)
            }
        }
    }
}
