use actix::prelude::*;
use actix_web::{middleware, web, App, HttpServer};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod actors;
mod api;
mod checkout;
mod config;
mod domain;
mod metrics;
mod payments;
mod store;
mod utils;
mod webhook;

use actors::{CoordinatorActor, GetHealthMonitor, Shutdown};
use api::{AppState, JwtVerifier};
use checkout::CheckoutOrchestrator;
use config::{Config, StorageConfig};
use payments::{BitpayInvoiceGateway, PaymentGateways, StripeCardGateway};
use store::{load_catalog, InventoryLedger, MemoryStore, OrderRepository, PgStore};
use webhook::WebhookReconciler;

struct Storage {
    ledger: Arc<dyn InventoryLedger>,
    orders: Arc<dyn OrderRepository>,
}

async fn open_storage(config: &Config) -> anyhow::Result<Storage> {
    let catalog = match &config.catalog_seed_path {
        Some(path) => {
            let products = load_catalog(path).await?;
            tracing::info!(path = %path, products = products.len(), "Loaded catalog seed");
            products
        }
        None => Vec::new(),
    };

    match &config.storage {
        StorageConfig::Postgres {
            url,
            max_connections,
        } => {
            tracing::info!(max_connections, "Connecting to Postgres");
            let store = PgStore::connect(url, *max_connections).await?;
            store.ensure_schema().await?;

            if !catalog.is_empty() {
                let inserted = store.seed_products(&catalog).await?;
                tracing::info!(inserted, "Seeded catalog");
            }

            Ok(Storage {
                ledger: Arc::new(store.clone()),
                orders: Arc::new(store),
            })
        }
        StorageConfig::Memory => {
            if !config.is_development() {
                tracing::warn!("In-memory storage selected; orders will not survive a restart");
            }
            let store = MemoryStore::with_products(catalog);
            Ok(Storage {
                ledger: Arc::new(store.clone()),
                orders: Arc::new(store),
            })
        }
    }
}

#[actix::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Default to INFO, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,storefront=debug")),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(environment = %config.environment, "Starting storefront");

    // === 1. Storage ===
    let storage = open_storage(&config).await?;

    // === 2. Metrics ===
    let metrics = Arc::new(metrics::Metrics::new()?);
    tracing::info!(
        families = metrics.registry().gather().len(),
        "Metrics registry created"
    );

    // === 3. Payment providers ===
    let gateways = PaymentGateways::new(
        Arc::new(StripeCardGateway::new(config.stripe.clone())?),
        Arc::new(BitpayInvoiceGateway::new(config.bitpay.clone())?),
    );
    tracing::info!(
        stripe = %config.stripe.api_base,
        bitpay = %config.bitpay.api_base,
        "Payment providers configured"
    );

    // === 4. Core services ===
    let orchestrator = CheckoutOrchestrator::new(
        storage.ledger.clone(),
        storage.orders.clone(),
        gateways.clone(),
        metrics.clone(),
    )
    .with_pricing(config.pricing.clone())
    .with_currencies(config.currencies.clone())
    .with_public_base_url(config.public_base_url.clone());

    let reconciler = WebhookReconciler::new(
        storage.orders.clone(),
        gateways.invoice(),
        metrics.clone(),
    );

    // === 5. Background actors ===
    let coordinator = CoordinatorActor::new(
        storage.orders.clone(),
        gateways,
        metrics.clone(),
        config.expiry.clone(),
    )
    .start();
    let health_monitor = coordinator
        .send(GetHealthMonitor)
        .await?
        .ok_or_else(|| anyhow::anyhow!("health monitor did not start"))?;

    // === 6. HTTP ===
    let state = web::Data::new(AppState {
        orchestrator: Arc::new(orchestrator),
        reconciler: Arc::new(reconciler),
    });
    let verifier = web::Data::new(JwtVerifier::new(&config.jwt_secret));
    let metrics_data = web::Data::new(metrics);
    let health_data = web::Data::new(health_monitor);

    tracing::info!(bind = %config.http_bind, "HTTP server listening");
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(verifier.clone())
            .app_data(metrics_data.clone())
            .app_data(health_data.clone())
            .configure(api::configure)
            .route("/metrics", web::get().to(metrics::metrics_handler))
            .route("/health", web::get().to(metrics::health_handler))
    })
    .bind(&config.http_bind)?
    .run()
    .await?;

    coordinator.send(Shutdown).await?;
    tracing::info!("Storefront stopped");

    Ok(())
}
