use actix::prelude::*;
use std::sync::Arc;

use super::health_monitor::{GetSystemHealth, HealthMonitorActor, UpdateHealth};
use super::order_expiry::OrderExpiryActor;
use crate::actors::core::HealthStatus;
use crate::config::ExpiryPolicy;
use crate::metrics::Metrics;
use crate::payments::PaymentGateways;
use crate::store::OrderRepository;

// ============================================================================
// Coordinator Actor - Owns the background actors
// ============================================================================
//
// Actor Hierarchy:
//   CoordinatorActor
//   ├── HealthMonitorActor
//   └── OrderExpiryActor
//
// Request handling does not go through actors; the HTTP handlers call the
// checkout orchestrator and webhook reconciler directly.
//
// ============================================================================

#[derive(Message)]
#[rtype(result = "Option<Addr<HealthMonitorActor>>")]
pub struct GetHealthMonitor;

#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

pub struct CoordinatorActor {
    orders: Arc<dyn OrderRepository>,
    gateways: PaymentGateways,
    metrics: Arc<Metrics>,
    expiry_policy: ExpiryPolicy,
    health_monitor: Option<Addr<HealthMonitorActor>>,
    order_expiry: Option<Addr<OrderExpiryActor>>,
}

impl CoordinatorActor {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        gateways: PaymentGateways,
        metrics: Arc<Metrics>,
        expiry_policy: ExpiryPolicy,
    ) -> Self {
        Self {
            orders,
            gateways,
            metrics,
            expiry_policy,
            health_monitor: None,
            order_expiry: None,
        }
    }

    fn start_child_actors(&mut self) {
        tracing::info!("Starting background actors");

        let health_monitor = HealthMonitorActor::new(
            self.orders.clone(),
            self.gateways.clone(),
            self.metrics.clone(),
        )
        .start();
        self.health_monitor = Some(health_monitor.clone());

        let order_expiry = OrderExpiryActor::new(
            self.orders.clone(),
            self.metrics.clone(),
            self.expiry_policy.clone(),
        )
        .start();
        self.order_expiry = Some(order_expiry);

        health_monitor.do_send(UpdateHealth {
            component: "order_expiry".to_string(),
            status: HealthStatus::Healthy,
            details: Some("Order expiry actor started".to_string()),
        });
    }
}

impl Actor for CoordinatorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("CoordinatorActor started");
        self.start_child_actors();

        ctx.run_interval(std::time::Duration::from_secs(30), |act, _ctx| {
            let Some(health_monitor) = act.health_monitor.clone() else {
                return;
            };

            actix::spawn(async move {
                match health_monitor.send(GetSystemHealth).await {
                    Ok(health) => match health.overall_status {
                        HealthStatus::Healthy => {
                            tracing::debug!("System health check: Healthy");
                        }
                        HealthStatus::Degraded(ref msg) => {
                            tracing::warn!("System health check: Degraded - {}", msg);
                        }
                        HealthStatus::Unhealthy(ref msg) => {
                            tracing::error!("System health check: Unhealthy - {}", msg);
                        }
                    },
                    Err(e) => {
                        tracing::error!("Failed to get system health: {}", e);
                    }
                }
            });
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        tracing::info!("CoordinatorActor stopping");
        Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("CoordinatorActor stopped");
    }
}

impl Handler<GetHealthMonitor> for CoordinatorActor {
    type Result = Option<Addr<HealthMonitorActor>>;

    fn handle(&mut self, _msg: GetHealthMonitor, _: &mut Self::Context) -> Self::Result {
        self.health_monitor.clone()
    }
}

impl Handler<Shutdown> for CoordinatorActor {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        tracing::info!("Shutting down background actors");
        self.health_monitor = None;
        self.order_expiry = None;
        ctx.stop();
    }
}
