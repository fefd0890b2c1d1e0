use actix::Addr;
use actix_web::{web, HttpResponse, Responder};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

use super::Metrics;
use crate::actors::{GetSystemHealth, HealthMonitorActor};

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler(metrics: web::Data<Arc<Metrics>>) -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry().gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// GET /health - 503 once any component reports unhealthy
pub async fn health_handler(monitor: web::Data<Addr<HealthMonitorActor>>) -> impl Responder {
    match monitor.send(GetSystemHealth).await {
        Ok(health) if health.overall_status.is_unhealthy() => {
            HttpResponse::ServiceUnavailable().json(health)
        }
        Ok(health) => HttpResponse::Ok().json(health),
        Err(e) => {
            tracing::error!(error = %e, "Health monitor unreachable");
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "unhealthy",
                "reason": "health monitor unavailable",
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{HealthStatus, UpdateHealth};
    use crate::payments::testing::{FakeCardGateway, FakeInvoiceGateway};
    use crate::payments::PaymentGateways;
    use crate::store::MemoryStore;
    use actix::Actor;
    use actix_web::{test, App};

    fn monitor(metrics: Arc<Metrics>) -> Addr<HealthMonitorActor> {
        HealthMonitorActor::new(
            Arc::new(MemoryStore::new()),
            PaymentGateways::new(
                Arc::new(FakeCardGateway::new()),
                Arc::new(FakeInvoiceGateway::new()),
            ),
            metrics,
        )
        .start()
    }

    #[actix_web::test]
    async fn test_metrics_endpoint_exposes_registry() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_checkout("created");

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(metrics))
                .route("/metrics", web::get().to(metrics_handler)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("checkouts_total{outcome=\"created\"} 1"));
    }

    #[actix_web::test]
    async fn test_health_endpoint_reports_unhealthy_as_503() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let addr = monitor(metrics);
        addr.send(UpdateHealth {
            component: "catalog_seed".to_string(),
            status: HealthStatus::Unhealthy("seed file unreadable".to_string()),
            details: None,
        })
        .await
        .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(addr))
                .route("/health", web::get().to(health_handler)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
