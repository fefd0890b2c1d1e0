// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Orders, catalog products and caller identity. Storage, payment providers
// and HTTP live elsewhere and depend on this layer, never the reverse.
//
// ============================================================================

pub mod order;
pub mod product;
pub mod identity;
