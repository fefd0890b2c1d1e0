// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// - Health monitoring
// - Abandoned-order expiry
// - Coordination and shutdown
//
// ============================================================================

mod coordinator;
mod health_monitor;
mod order_expiry;

pub use coordinator::{CoordinatorActor, GetHealthMonitor, Shutdown};
pub use health_monitor::{GetSystemHealth, HealthMonitorActor, UpdateHealth};
