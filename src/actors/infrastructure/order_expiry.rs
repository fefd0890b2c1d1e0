use actix::prelude::*;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::ExpiryPolicy;
use crate::metrics::Metrics;
use crate::store::{OrderRepository, StoreError};

// ============================================================================
// Order Expiry Actor - Releases stock held by abandoned orders
// ============================================================================
//
// An order that never gets paid keeps its reserved stock. Every sweep, orders
// still awaiting payment after the TTL are marked expired and their lines are
// returned to the catalog, atomically per sweep. Expired is terminal; a late
// confirmation for such an order is refused by the repository.
//
// ============================================================================

#[derive(Message)]
#[rtype(result = "Result<Vec<Uuid>, StoreError>")]
pub struct SweepNow;

pub struct OrderExpiryActor {
    orders: Arc<dyn OrderRepository>,
    metrics: Arc<Metrics>,
    policy: ExpiryPolicy,
}

impl OrderExpiryActor {
    pub fn new(orders: Arc<dyn OrderRepository>, metrics: Arc<Metrics>, policy: ExpiryPolicy) -> Self {
        Self {
            orders,
            metrics,
            policy,
        }
    }
}

pub async fn sweep_expired(
    orders: Arc<dyn OrderRepository>,
    metrics: Arc<Metrics>,
    order_ttl: chrono::Duration,
) -> Result<Vec<Uuid>, StoreError> {
    let now = Utc::now();
    let expired = orders.expire_unpaid(now - order_ttl, now).await?;

    if !expired.is_empty() {
        tracing::info!(
            count = expired.len(),
            ttl_minutes = order_ttl.num_minutes(),
            "Expired unpaid orders and released their stock"
        );
        for order_id in &expired {
            tracing::debug!(order_id = %order_id, "Order expired");
        }
        metrics.record_expired(expired.len());
    }

    Ok(expired)
}

impl Actor for OrderExpiryActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            ttl_minutes = self.policy.order_ttl.num_minutes(),
            sweep_secs = self.policy.sweep_interval.as_secs(),
            "OrderExpiryActor started"
        );

        ctx.run_interval(self.policy.sweep_interval, |act, _ctx| {
            let sweep = sweep_expired(act.orders.clone(), act.metrics.clone(), act.policy.order_ttl);

            actix::spawn(async move {
                if let Err(e) = sweep.await {
                    tracing::error!(error = %e, "Order expiry sweep failed");
                }
            });
        });
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        tracing::info!("OrderExpiryActor stopped");
    }
}

impl Handler<SweepNow> for OrderExpiryActor {
    type Result = ResponseFuture<Result<Vec<Uuid>, StoreError>>;

    fn handle(&mut self, _msg: SweepNow, _: &mut Self::Context) -> Self::Result {
        Box::pin(sweep_expired(
            self.orders.clone(),
            self.metrics.clone(),
            self.policy.order_ttl,
        ))
    }
}
