// ============================================================================
// Order Domain - Business rules for the Order aggregate
// ============================================================================
//
// - Value objects (OrderLine, ShippingAddress, Confirmation, ...)
// - Commands (CheckoutRequest, PaymentInstrument)
// - Errors (OrderError)
// - Pricing (PricingPolicy, CurrencyPolicy)
// - Aggregate (Order with its payment/delivery/expiry merges)
//
// Nothing in here touches storage or providers.
//
// ============================================================================

pub mod value_objects;
pub mod commands;
pub mod errors;
pub mod pricing;
pub mod aggregate;

// Re-export for convenience
pub use value_objects::*;
pub use commands::*;
pub use errors::*;
pub use pricing::*;
pub use aggregate::*;
