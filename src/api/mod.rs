// ============================================================================
// HTTP API (actix-web)
// ============================================================================
//
// Thin handlers: decode the request, resolve the caller's identity, call the
// orchestrator or reconciler, encode the result. Error-to-status mapping
// lives in `error.rs`.
//
// ============================================================================

mod auth;
mod error;
mod handlers;

use std::sync::Arc;

use crate::checkout::CheckoutOrchestrator;
use crate::webhook::WebhookReconciler;

pub use auth::JwtVerifier;
pub use handlers::configure;

pub struct AppState {
    pub orchestrator: Arc<CheckoutOrchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
}
