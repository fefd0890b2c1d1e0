// ============================================================================
// Actors Module
// ============================================================================
//
// Background infrastructure on actix actors.
//
// Structure:
// - core/           - Health types shared with the HTTP layer
// - infrastructure/ - Health monitor, order expiry, coordinator
//
// Note: checkout and webhook handling run inline in request handlers, NOT
//       through actors. Actors are reserved for periodic background work.
//
// ============================================================================

mod core;
mod infrastructure;

pub use core::HealthStatus;
pub use infrastructure::{
    CoordinatorActor, GetHealthMonitor, GetSystemHealth, HealthMonitorActor, Shutdown,
    UpdateHealth,
};
