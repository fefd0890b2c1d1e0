use actix::prelude::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::actors::core::{ComponentHealth, HealthStatus};
use crate::metrics::Metrics;
use crate::payments::PaymentGateways;
use crate::store::OrderRepository;

// ============================================================================
// Health Monitor Actor - Aggregates component health
// ============================================================================
//
// Periodically checks:
// - storage (a round trip to the order repository)
// - each payment provider's circuit breaker
//
// and answers GetSystemHealth for the /health endpoint.
//
// ============================================================================

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Messages
// ============================================================================

#[derive(Message)]
#[rtype(result = "()")]
pub struct UpdateHealth {
    pub component: String,
    pub status: HealthStatus,
    pub details: Option<String>,
}

#[derive(Message)]
#[rtype(result = "SystemHealth")]
pub struct GetSystemHealth;

#[derive(Message)]
#[rtype(result = "()")]
pub struct CheckNow;

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    #[serde(flatten)]
    pub overall_status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub check_time: DateTime<Utc>,
}

// ============================================================================
// Health Monitor Actor
// ============================================================================

pub struct HealthMonitorActor {
    components: BTreeMap<String, ComponentHealth>,
    orders: Arc<dyn OrderRepository>,
    gateways: PaymentGateways,
    metrics: Arc<Metrics>,
}

impl HealthMonitorActor {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        gateways: PaymentGateways,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            components: BTreeMap::new(),
            orders,
            gateways,
            metrics,
        }
    }

    fn record(&mut self, component: String, status: HealthStatus, details: Option<String>) {
        tracing::debug!(
            component = %component,
            status = ?status,
            "Updated component health"
        );

        self.metrics
            .update_component_health(&component, status.as_gauge());
        self.components.insert(
            component.clone(),
            ComponentHealth::new(component, status).with_details(details),
        );
    }

    fn compute_overall_status(&self) -> HealthStatus {
        let mut has_degraded = false;
        let mut unhealthy_components = Vec::new();

        for (name, health) in &self.components {
            match &health.status {
                HealthStatus::Unhealthy(msg) => {
                    unhealthy_components.push(format!("{}: {}", name, msg));
                }
                HealthStatus::Degraded(_) => has_degraded = true,
                HealthStatus::Healthy => {}
            }
        }

        if !unhealthy_components.is_empty() {
            HealthStatus::Unhealthy(unhealthy_components.join(", "))
        } else if has_degraded {
            HealthStatus::Degraded("Some components degraded".to_string())
        } else {
            HealthStatus::Healthy
        }
    }
}

async fn check_components(
    orders: Arc<dyn OrderRepository>,
    gateways: PaymentGateways,
    metrics: Arc<Metrics>,
) -> Vec<(String, HealthStatus)> {
    let mut results = Vec::new();

    let storage = match orders.ping().await {
        Ok(()) => HealthStatus::Healthy,
        Err(e) => HealthStatus::Unhealthy(e.to_string()),
    };
    results.push(("storage".to_string(), storage));

    for gateway in gateways.all() {
        let state = gateway.circuit_state().await;
        metrics.update_circuit_breaker_state(gateway.provider(), state.as_gauge());
        results.push((format!("payments.{}", gateway.provider()), state.into()));
    }

    results
}

impl Actor for HealthMonitorActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!("HealthMonitorActor started");

        ctx.notify(CheckNow);
        ctx.run_interval(CHECK_INTERVAL, |_act, ctx| ctx.notify(CheckNow));
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Handler<UpdateHealth> for HealthMonitorActor {
    type Result = ();

    fn handle(&mut self, msg: UpdateHealth, _: &mut Self::Context) {
        self.record(msg.component, msg.status, msg.details);
    }
}

impl Handler<CheckNow> for HealthMonitorActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, _msg: CheckNow, _: &mut Self::Context) -> Self::Result {
        let check = check_components(
            self.orders.clone(),
            self.gateways.clone(),
            self.metrics.clone(),
        );

        Box::pin(check.into_actor(self).map(|results, act, _ctx| {
            for (component, status) in results {
                act.record(component, status, None);
            }
        }))
    }
}

impl Handler<GetSystemHealth> for HealthMonitorActor {
    type Result = MessageResult<GetSystemHealth>;

    fn handle(&mut self, _msg: GetSystemHealth, _: &mut Self::Context) -> Self::Result {
        MessageResult(SystemHealth {
            overall_status: self.compute_overall_status(),
            components: self.components.clone(),
            check_time: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::testing::{FakeCardGateway, FakeInvoiceGateway};
    use crate::store::MemoryStore;

    fn monitor() -> HealthMonitorActor {
        HealthMonitorActor::new(
            Arc::new(MemoryStore::new()),
            PaymentGateways::new(
                Arc::new(FakeCardGateway::new()),
                Arc::new(FakeInvoiceGateway::new()),
            ),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[actix::test]
    async fn test_check_reports_all_components_healthy() {
        let addr = monitor().start();

        addr.send(CheckNow).await.unwrap();
        let health = addr.send(GetSystemHealth).await.unwrap();

        assert!(health.overall_status.is_healthy());
        assert!(health.components.contains_key("storage"));
        assert!(health.components.contains_key("payments.stripe"));
        assert!(health.components.contains_key("payments.bitpay"));
    }

    #[actix::test]
    async fn test_unhealthy_component_makes_system_unhealthy() {
        let addr = monitor().start();

        addr.send(UpdateHealth {
            component: "order_expiry".to_string(),
            status: HealthStatus::Unhealthy("sweep failed".to_string()),
            details: None,
        })
        .await
        .unwrap();
        let health = addr.send(GetSystemHealth).await.unwrap();

        match health.overall_status {
            HealthStatus::Unhealthy(reason) => assert!(reason.contains("order_expiry")),
            other => panic!("expected unhealthy, got {:?}", other),
        }
    }
}
