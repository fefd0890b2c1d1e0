// ============================================================================
// Checkout - turns carts into orders and drives payment
// ============================================================================

mod errors;
mod orchestrator;

pub use errors::{CheckoutError, RejectionReason};
pub use orchestrator::{CheckoutOrchestrator, PaymentStatus};
