mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

pub use server::{health_handler, metrics_handler};

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// - Checkout outcomes and stock rejections
// - Payment attempts per provider, provider call latency
// - Webhook callbacks by outcome
// - Orders paid (inline vs webhook) and expired
// - Circuit breaker state and component health
//
// Scraped via GET /metrics on the main HTTP server.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Checkout
    pub checkouts_total: IntCounterVec,
    pub stock_rejections_total: IntCounterVec,
    pub stock_release_failures_total: IntCounter,

    // Payments
    pub payments_total: IntCounterVec,
    pub provider_call_duration: HistogramVec,
    pub orders_paid_total: IntCounterVec,

    // Webhooks
    pub webhooks_total: IntCounterVec,

    // Expiry
    pub orders_expired_total: IntCounter,

    // Health
    pub circuit_breaker_state: IntGaugeVec,
    pub component_health: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let checkouts_total = IntCounterVec::new(
            Opts::new("checkouts_total", "Checkout attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(checkouts_total.clone()))?;

        let stock_rejections_total = IntCounterVec::new(
            Opts::new("stock_rejections_total", "Checkouts rejected by the inventory ledger"),
            &["reason"],
        )?;
        registry.register(Box::new(stock_rejections_total.clone()))?;

        let stock_release_failures_total = IntCounter::new(
            "stock_release_failures_total",
            "Reservations that could not be returned after a failed checkout",
        )?;
        registry.register(Box::new(stock_release_failures_total.clone()))?;

        let payments_total = IntCounterVec::new(
            Opts::new("payments_total", "Payment attempts by provider and outcome"),
            &["provider", "outcome"],
        )?;
        registry.register(Box::new(payments_total.clone()))?;

        let provider_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "payment_provider_call_duration_seconds",
                "Latency of charge and invoice calls",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]),
            &["provider"],
        )?;
        registry.register(Box::new(provider_call_duration.clone()))?;

        let orders_paid_total = IntCounterVec::new(
            Opts::new("orders_paid_total", "Orders transitioned to paid"),
            &["path"],
        )?;
        registry.register(Box::new(orders_paid_total.clone()))?;

        let webhooks_total = IntCounterVec::new(
            Opts::new("webhooks_total", "Provider callbacks by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(webhooks_total.clone()))?;

        let orders_expired_total = IntCounter::new(
            "orders_expired_total",
            "Unpaid orders expired and their stock released",
        )?;
        registry.register(Box::new(orders_expired_total.clone()))?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state per provider (0=Closed, 1=HalfOpen, 2=Open)",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new(
                "component_health_status",
                "Component health (0=Unhealthy, 1=Degraded, 2=Healthy)",
            ),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            registry,
            checkouts_total,
            stock_rejections_total,
            stock_release_failures_total,
            payments_total,
            provider_call_duration,
            orders_paid_total,
            webhooks_total,
            orders_expired_total,
            circuit_breaker_state,
            component_health,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_checkout(&self, outcome: &str) {
        self.checkouts_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_stock_rejection(&self, reason: &str) {
        self.stock_rejections_total.with_label_values(&[reason]).inc();
    }

    pub fn record_stock_release_failure(&self) {
        self.stock_release_failures_total.inc();
    }

    pub fn record_payment(&self, provider: &str, outcome: &str, duration_secs: f64) {
        self.payments_total.with_label_values(&[provider, outcome]).inc();
        self.provider_call_duration
            .with_label_values(&[provider])
            .observe(duration_secs);
    }

    pub fn record_order_paid(&self, path: &str) {
        self.orders_paid_total.with_label_values(&[path]).inc();
    }

    pub fn record_webhook(&self, outcome: &str) {
        self.webhooks_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_expired(&self, count: usize) {
        self.orders_expired_total.inc_by(count as u64);
    }

    pub fn update_circuit_breaker_state(&self, provider: &str, state: i64) {
        self.circuit_breaker_state
            .with_label_values(&[provider])
            .set(state);
    }

    pub fn update_component_health(&self, component: &str, status: i64) {
        self.component_health
            .with_label_values(&[component])
            .set(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(metrics: &Metrics, name: &str) -> f64 {
        metrics
            .registry
            .gather()
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.metric.iter().map(|s| s.counter.value.unwrap_or(0.0)).sum())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_checkout("created");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_payment_and_paid() {
        let metrics = Metrics::new().unwrap();
        metrics.record_payment("stripe", "settled", 0.2);
        metrics.record_payment("stripe", "declined", 0.1);
        metrics.record_order_paid("inline");

        assert_eq!(counter(&metrics, "payments_total"), 2.0);
        assert_eq!(counter(&metrics, "orders_paid_total"), 1.0);
    }

    #[test]
    fn test_record_expired() {
        let metrics = Metrics::new().unwrap();
        metrics.record_expired(3);
        metrics.record_expired(0);
        assert_eq!(counter(&metrics, "orders_expired_total"), 3.0);
    }

    #[test]
    fn test_circuit_breaker_gauge_per_provider() {
        let metrics = Metrics::new().unwrap();
        metrics.update_circuit_breaker_state("stripe", 2);
        metrics.update_circuit_breaker_state("bitpay", 0);

        let gathered = metrics.registry.gather();
        let state = gathered
            .iter()
            .find(|m| m.name() == "circuit_breaker_state")
            .unwrap();
        assert_eq!(state.metric.len(), 2);
    }
}
