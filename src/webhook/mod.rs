// ============================================================================
// Webhooks - out-of-band provider confirmations
// ============================================================================

mod reconciler;

pub use reconciler::{RejectReason, WebhookOutcome, WebhookReconciler};
