use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::errors::CheckoutError;
use crate::domain::identity::Identity;
use crate::domain::order::{
    CheckoutRequest, CurrencyPolicy, NewOrder, Order, OrderLine, PaymentInstrument, PricingPolicy,
};
use crate::domain::product::Reservation;
use crate::metrics::Metrics;
use crate::payments::{InvoiceHandle, PaymentError, PaymentGateways, PaymentOutcome, PaymentRequest};
use crate::store::{InventoryLedger, MarkPaid, OrderRepository, StoreError};
use crate::utils::{retry_on_transient, RetryConfig};

// ============================================================================
// Checkout Orchestrator
// ============================================================================
//
// Draft ──reserve all lines──> AwaitingPayment ──charge / webhook──> Paid
//   │                              │
//   └─ any line rejected:          └─ decline / provider error:
//      release what was taken,        order stays AwaitingPayment,
//      nothing persisted              shopper may retry
//
// Lines are reserved one at a time, in submitted order, so that a rejection
// can walk back exactly the reservations already made.
//
// Each payment attempt claims the order in the store before any provider is
// called. A second attempt while the first is in flight is refused, so a
// double submit cannot charge the shopper twice.
//
// ============================================================================

/// Result of a payment attempt on an existing order.
#[derive(Debug, Clone)]
pub enum PaymentStatus {
    /// Card charge settled and recorded.
    Paid(Order),
    /// Invoice created; the order is paid when the provider calls back.
    AwaitingConfirmation { order: Order, invoice: InvoiceHandle },
}

/// A claim older than this belongs to an attempt that never finished.
const PAYMENT_CLAIM_LEASE_MINUTES: i64 = 5;

pub struct CheckoutOrchestrator {
    ledger: Arc<dyn InventoryLedger>,
    orders: Arc<dyn OrderRepository>,
    gateways: PaymentGateways,
    pricing: PricingPolicy,
    currencies: CurrencyPolicy,
    public_base_url: String,
    release_retry: RetryConfig,
    metrics: Arc<Metrics>,
}

impl CheckoutOrchestrator {
    pub fn new(
        ledger: Arc<dyn InventoryLedger>,
        orders: Arc<dyn OrderRepository>,
        gateways: PaymentGateways,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger,
            orders,
            gateways,
            pricing: PricingPolicy::default(),
            currencies: CurrencyPolicy::default(),
            public_base_url: "http://localhost:4321".to_string(),
            release_retry: RetryConfig::default(),
            metrics,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingPolicy) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_currencies(mut self, currencies: CurrencyPolicy) -> Self {
        self.currencies = currencies;
        self
    }

    pub fn with_public_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.public_base_url = base_url.into();
        self
    }

    #[cfg(test)]
    fn with_release_retry(mut self, retry: RetryConfig) -> Self {
        self.release_retry = retry;
        self
    }

    // ========================================================================
    // Draft -> AwaitingPayment
    // ========================================================================

    pub async fn checkout(&self, request: CheckoutRequest) -> Result<Order, CheckoutError> {
        let settlement_currency = request.validate().and_then(|()| {
            self.currencies
                .settlement_currency(request.payment_method, request.payment_currency.as_deref())
        });
        let payment_currency = match settlement_currency {
            Ok(currency) => currency,
            Err(e) => {
                tracing::warn!(user_id = %request.user_id, error = %e, "Checkout failed validation");
                self.metrics.record_checkout("invalid");
                return Err(CheckoutError::Validation(e));
            }
        };

        let mut reserved: Vec<Reservation> = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            match self.ledger.reserve(line.product_id, line.quantity).await {
                Ok(reservation) => reserved.push(reservation),
                Err(e) => {
                    self.release_all(&reserved).await;
                    return Err(self.rejected(request.user_id, e));
                }
            }
        }

        let lines: Vec<OrderLine> = reserved
            .iter()
            .map(|r| OrderLine {
                product_id: r.product_id,
                quantity: r.quantity,
                unit_price: r.unit_price,
            })
            .collect();
        let prices = self.pricing.price(&lines);

        let new_order = NewOrder {
            user_id: request.user_id,
            lines,
            shipping_address: request.shipping_address,
            payment_method: request.payment_method,
            payment_currency,
            prices,
        };

        match self.orders.create_order(new_order).await {
            Ok(order) => {
                tracing::info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    payment_method = order.payment_method.as_str(),
                    total_price = %order.prices.total_price,
                    lines = order.lines.len(),
                    "Order created, awaiting payment"
                );
                self.metrics.record_checkout("created");
                Ok(order)
            }
            Err(e) => {
                tracing::error!(user_id = %request.user_id, error = %e, "Order creation failed, releasing stock");
                self.release_all(&reserved).await;
                self.metrics.record_checkout("error");
                Err(e.into())
            }
        }
    }

    fn rejected(&self, user_id: Uuid, err: StoreError) -> CheckoutError {
        let err = CheckoutError::from(err);
        match &err {
            CheckoutError::Rejected { reason, product_id } => {
                tracing::warn!(
                    user_id = %user_id,
                    product_id = %product_id,
                    reason = reason.as_str(),
                    "Checkout rejected by inventory"
                );
                self.metrics.record_stock_rejection(reason.as_str());
                self.metrics.record_checkout("rejected");
            }
            other => {
                tracing::error!(user_id = %user_id, error = %other, "Stock reservation failed");
                self.metrics.record_checkout("error");
            }
        }
        err
    }

    /// Walk back reservations newest first. No order exists for these units,
    /// so a release that still fails after retries is counted and logged for
    /// a manual restock.
    async fn release_all(&self, reserved: &[Reservation]) {
        for reservation in reserved.iter().rev() {
            let released = retry_on_transient(&self.release_retry, "inventory.release", |_attempt| {
                self.ledger
                    .release(reservation.product_id, reservation.quantity)
            })
            .await
            .into_result();

            if let Err(e) = released {
                tracing::error!(
                    product_id = %reservation.product_id,
                    quantity = reservation.quantity,
                    error = %e,
                    "Failed to release reservation, stock needs a manual restock"
                );
                self.metrics.record_stock_release_failure();
            }
        }
    }

    // ========================================================================
    // AwaitingPayment -> Paid
    // ========================================================================

    pub async fn pay(
        &self,
        identity: Identity,
        order_id: Uuid,
        instrument: PaymentInstrument,
    ) -> Result<PaymentStatus, CheckoutError> {
        self.order_for(identity, order_id).await?;

        let attempt_id = Uuid::new_v4();
        let claimed_at = Utc::now();
        let stale_before = claimed_at - Duration::minutes(PAYMENT_CLAIM_LEASE_MINUTES);
        let order = self
            .orders
            .claim_payment(order_id, attempt_id, claimed_at, stale_before)
            .await
            .map_err(CheckoutError::from)
            .inspect_err(|e| {
                if matches!(e, CheckoutError::PaymentInProgress(_)) {
                    tracing::warn!(order_id = %order_id, "Payment refused, another attempt is in flight");
                }
            })?;

        let result = self.attempt_payment(order, attempt_id, instrument).await;

        if let Err(e) = self.orders.release_payment_claim(order_id, attempt_id).await {
            tracing::warn!(
                order_id = %order_id,
                error = %e,
                "Failed to release payment claim, it lapses with its lease"
            );
        }
        result
    }

    async fn attempt_payment(
        &self,
        order: Order,
        attempt_id: Uuid,
        instrument: PaymentInstrument,
    ) -> Result<PaymentStatus, CheckoutError> {
        let order_id = order.id;
        let settlement_currency = self
            .currencies
            .settlement_currency(order.payment_method, Some(&order.payment_currency))
            .map_err(CheckoutError::Validation)?;

        let gateway = self.gateways.for_method(order.payment_method);
        let provider = gateway.provider();
        let request = PaymentRequest {
            order_id,
            attempt_id,
            amount: order.prices.total_price,
            currency: self.currencies.base_currency.clone(),
            settlement_currency,
            payment_token: instrument.payment_token,
            buyer_email: instrument.buyer_email,
            notify_url: format!("{}/api/payments/bitpay/webhook", self.public_base_url),
            redirect_url: format!("{}/order/{}/success", self.public_base_url, order_id),
        };

        let started = Instant::now();
        let outcome = gateway.begin_payment(&request).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(PaymentOutcome::Settled(confirmation)) => {
                self.metrics.record_payment(provider, "settled", elapsed);
                let reference = confirmation.label();

                match self.orders.mark_paid(order_id, confirmation, Utc::now()).await {
                    Ok(MarkPaid::Applied(order)) => {
                        tracing::info!(order_id = %order_id, confirmation = %reference, "Order paid");
                        self.metrics.record_order_paid("inline");
                        Ok(PaymentStatus::Paid(order))
                    }
                    Ok(MarkPaid::AlreadyPaid(order)) => Ok(PaymentStatus::Paid(order)),
                    Err(e) => {
                        tracing::error!(
                            order_id = %order_id,
                            confirmation = %reference,
                            error = %e,
                            "Charge settled but could not be recorded; refund may be required"
                        );
                        Err(e.into())
                    }
                }
            }
            Ok(PaymentOutcome::Pending(invoice)) => {
                self.metrics.record_payment(provider, "pending", elapsed);
                tracing::info!(
                    order_id = %order_id,
                    invoice_id = %invoice.invoice_id,
                    "Invoice created, awaiting provider confirmation"
                );
                Ok(PaymentStatus::AwaitingConfirmation { order, invoice })
            }
            Err(PaymentError::Declined { reason }) => {
                self.metrics.record_payment(provider, "declined", elapsed);
                tracing::warn!(order_id = %order_id, provider, reason = %reason, "Payment declined");
                Err(CheckoutError::PaymentDeclined { order_id, reason })
            }
            Err(e) => {
                self.metrics.record_payment(provider, "error", elapsed);
                tracing::warn!(order_id = %order_id, provider, error = %e, "Payment attempt failed");
                Err(CheckoutError::Provider { order_id, source: e })
            }
        }
    }

    // ========================================================================
    // Queries and fulfillment
    // ========================================================================

    /// Owner or admin only. Non-admins get the same refusal for a missing
    /// order and for someone else's, so ids cannot be enumerated.
    pub async fn order_for(&self, identity: Identity, order_id: Uuid) -> Result<Order, CheckoutError> {
        match self.orders.find_by_id(order_id).await? {
            Some(order) if identity.can_view(order.user_id) => Ok(order),
            None if identity.is_admin => Err(CheckoutError::OrderNotFound(order_id)),
            _ => {
                tracing::warn!(order_id = %order_id, user_id = %identity.user_id, "Order access denied");
                Err(CheckoutError::Unauthorized)
            }
        }
    }

    pub async fn orders_of(&self, identity: Identity) -> Result<Vec<Order>, CheckoutError> {
        Ok(self.orders.find_by_owner(identity.user_id).await?)
    }

    pub async fn all_orders(&self, identity: Identity) -> Result<Vec<Order>, CheckoutError> {
        if !identity.is_admin {
            return Err(CheckoutError::Unauthorized);
        }
        Ok(self.orders.find_all().await?)
    }

    pub async fn mark_delivered(
        &self,
        identity: Identity,
        order_id: Uuid,
    ) -> Result<Order, CheckoutError> {
        if !identity.is_admin {
            return Err(CheckoutError::Unauthorized);
        }

        let order = self.orders.mark_delivered(order_id, Utc::now()).await?;
        tracing::info!(order_id = %order_id, "Order delivered");
        Ok(order)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::RejectionReason;
    use crate::domain::order::{CartLine, OrderError, OrderStatus, PaymentMethod, ShippingAddress};
    use crate::domain::product::Product;
    use crate::payments::testing::{FakeCardGateway, FakeInvoiceGateway};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Semaphore;

    struct Harness {
        store: MemoryStore,
        card: Arc<FakeCardGateway>,
        invoice: Arc<FakeInvoiceGateway>,
        orchestrator: Arc<CheckoutOrchestrator>,
    }

    fn product(price: Decimal, stock: i32) -> Product {
        Product {
            id: Uuid::new_v4(),
            name: "Widget".to_string(),
            price,
            count_in_stock: stock,
        }
    }

    fn harness(products: Vec<Product>, card: FakeCardGateway) -> Harness {
        let store = MemoryStore::with_products(products);
        let card = Arc::new(card);
        let invoice = Arc::new(FakeInvoiceGateway::new());
        let gateways = PaymentGateways::new(card.clone(), invoice.clone());
        let orchestrator = CheckoutOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            gateways,
            Arc::new(Metrics::new().unwrap()),
        );

        Harness {
            store,
            card,
            invoice,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn transient_fault() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }

    /// Ledger whose releases fail transiently a set number of times.
    struct FlakyLedger {
        inner: MemoryStore,
        release_failures: AtomicU32,
    }

    #[async_trait]
    impl InventoryLedger for FlakyLedger {
        async fn reserve(&self, product_id: Uuid, quantity: i32) -> Result<Reservation, StoreError> {
            self.inner.reserve(product_id, quantity).await
        }

        async fn release(&self, product_id: Uuid, quantity: i32) -> Result<(), StoreError> {
            let failing = self
                .release_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(transient_fault());
            }
            self.inner.release(product_id, quantity).await
        }
    }

    /// Repository that cannot persist new orders.
    struct UnwritableOrders(MemoryStore);

    #[async_trait]
    impl OrderRepository for UnwritableOrders {
        async fn create_order(&self, _order: NewOrder) -> Result<Order, StoreError> {
            Err(transient_fault())
        }

        async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
            self.0.find_by_id(order_id).await
        }

        async fn find_by_owner(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
            self.0.find_by_owner(user_id).await
        }

        async fn find_all(&self) -> Result<Vec<Order>, StoreError> {
            self.0.find_all().await
        }

        async fn claim_payment(
            &self,
            order_id: Uuid,
            attempt_id: Uuid,
            claimed_at: DateTime<Utc>,
            stale_before: DateTime<Utc>,
        ) -> Result<Order, StoreError> {
            self.0
                .claim_payment(order_id, attempt_id, claimed_at, stale_before)
                .await
        }

        async fn release_payment_claim(
            &self,
            order_id: Uuid,
            attempt_id: Uuid,
        ) -> Result<(), StoreError> {
            self.0.release_payment_claim(order_id, attempt_id).await
        }

        async fn mark_paid(
            &self,
            order_id: Uuid,
            confirmation: crate::domain::order::Confirmation,
            paid_at: DateTime<Utc>,
        ) -> Result<MarkPaid, StoreError> {
            self.0.mark_paid(order_id, confirmation, paid_at).await
        }

        async fn mark_delivered(
            &self,
            order_id: Uuid,
            delivered_at: DateTime<Utc>,
        ) -> Result<Order, StoreError> {
            self.0.mark_delivered(order_id, delivered_at).await
        }

        async fn expire_unpaid(
            &self,
            created_before: DateTime<Utc>,
            expired_at: DateTime<Utc>,
        ) -> Result<Vec<Uuid>, StoreError> {
            self.0.expire_unpaid(created_before, expired_at).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
    }

    /// Orchestrator whose order writes always fail, over a flaky ledger.
    fn unwritable(store: &MemoryStore, release_failures: u32) -> (CheckoutOrchestrator, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let ledger = FlakyLedger {
            inner: store.clone(),
            release_failures: AtomicU32::new(release_failures),
        };
        let gateways = PaymentGateways::new(
            Arc::new(FakeCardGateway::new()),
            Arc::new(FakeInvoiceGateway::new()),
        );
        let orchestrator = CheckoutOrchestrator::new(
            Arc::new(ledger),
            Arc::new(UnwritableOrders(store.clone())),
            gateways,
            metrics.clone(),
        )
        .with_release_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            multiplier: 2.0,
        });
        (orchestrator, metrics)
    }

    fn request(user_id: Uuid, lines: &[(Uuid, i32)], method: PaymentMethod) -> CheckoutRequest {
        CheckoutRequest {
            user_id,
            lines: lines
                .iter()
                .map(|&(product_id, quantity)| CartLine {
                    product_id,
                    quantity,
                })
                .collect(),
            shipping_address: ShippingAddress {
                street: "1 Main St".to_string(),
                city: "Springfield".to_string(),
                postal_code: "12345".to_string(),
                country: "US".to_string(),
            },
            payment_method: method,
            payment_currency: None,
        }
    }

    fn card_token() -> PaymentInstrument {
        PaymentInstrument {
            payment_token: Some("pm_card_visa".to_string()),
            buyer_email: None,
        }
    }

    #[tokio::test]
    async fn test_checkout_prices_order_from_catalog() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());

        let order = h
            .orchestrator
            .checkout(request(Uuid::new_v4(), &[(p1.id, 2)], PaymentMethod::Card))
            .await
            .unwrap();

        assert_eq!(order.prices.items_price, Decimal::new(2000, 2));
        assert_eq!(order.prices.shipping_price, Decimal::new(1000, 2));
        assert_eq!(order.prices.tax_price, Decimal::new(300, 2));
        assert_eq!(order.prices.total_price, Decimal::new(3300, 2));
        assert_eq!(order.payment_currency, "USD");
        assert_eq!(order.status(), OrderStatus::AwaitingPayment);
        assert_eq!(h.store.stock_of(p1.id).await, Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_for_last_unit() {
        let p2 = product(Decimal::new(500, 2), 1);
        let h = harness(vec![p2.clone()], FakeCardGateway::new());

        let (a, b) = tokio::join!(
            h.orchestrator
                .checkout(request(Uuid::new_v4(), &[(p2.id, 1)], PaymentMethod::Card)),
            h.orchestrator
                .checkout(request(Uuid::new_v4(), &[(p2.id, 1)], PaymentMethod::Card)),
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(CheckoutError::Rejected {
                reason: RejectionReason::InsufficientStock,
                ..
            })
        )));
        assert_eq!(h.store.stock_of(p2.id).await, Some(0));
        assert_eq!(h.store.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_line_releases_earlier_reservations() {
        let plenty = product(Decimal::new(1000, 2), 10);
        let scarce = product(Decimal::new(1000, 2), 1);
        let h = harness(vec![plenty.clone(), scarce.clone()], FakeCardGateway::new());

        let result = h
            .orchestrator
            .checkout(request(
                Uuid::new_v4(),
                &[(plenty.id, 4), (scarce.id, 2)],
                PaymentMethod::Card,
            ))
            .await;

        assert!(matches!(
            result,
            Err(CheckoutError::Rejected { product_id, .. }) if product_id == scarce.id
        ));
        assert_eq!(h.store.stock_of(plenty.id).await, Some(10));
        assert_eq!(h.store.stock_of(scarce.id).await, Some(1));
        assert!(h.store.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_product_rejected() {
        let h = harness(vec![], FakeCardGateway::new());
        let missing = Uuid::new_v4();

        let result = h
            .orchestrator
            .checkout(request(Uuid::new_v4(), &[(missing, 1)], PaymentMethod::Card))
            .await;

        assert!(matches!(
            result,
            Err(CheckoutError::Rejected {
                reason: RejectionReason::ProductNotFound,
                product_id,
            }) if product_id == missing
        ));
    }

    #[tokio::test]
    async fn test_unsupported_invoice_currency_touches_nothing() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());

        let mut req = request(Uuid::new_v4(), &[(p1.id, 1)], PaymentMethod::CryptoInvoice);
        req.payment_currency = Some("DOGE".to_string());

        let result = h.orchestrator.checkout(req).await;

        assert!(matches!(
            result,
            Err(CheckoutError::Validation(OrderError::UnsupportedCurrency { .. }))
        ));
        assert_eq!(h.store.stock_of(p1.id).await, Some(5));
    }

    #[tokio::test]
    async fn test_card_payment_marks_order_paid() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let user = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(user.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();
        let status = h.orchestrator.pay(user, order.id, card_token()).await.unwrap();

        let PaymentStatus::Paid(paid) = status else {
            panic!("expected a settled card payment");
        };
        assert!(paid.is_paid);
        assert_eq!(
            paid.payment_confirmation.unwrap().label(),
            "stripe:pi_fake_1"
        );

        let again = h.orchestrator.pay(user, order.id, card_token()).await;
        assert!(matches!(again, Err(CheckoutError::AlreadyPaid(_))));
        assert_eq!(h.card.calls(), 1);
    }

    #[tokio::test]
    async fn test_declined_card_keeps_order_for_retry() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let card = FakeCardGateway::new().then(Err(PaymentError::Declined {
            reason: "card_declined".to_string(),
        }));
        let h = harness(vec![p1.clone()], card);
        let user = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(user.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();

        let declined = h.orchestrator.pay(user, order.id, card_token()).await;
        assert!(matches!(declined, Err(CheckoutError::PaymentDeclined { .. })));

        let stored = h.store.find_by_id(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::AwaitingPayment);
        assert_eq!(h.store.stock_of(p1.id).await, Some(4));

        let retried = h.orchestrator.pay(user, order.id, card_token()).await.unwrap();
        assert!(matches!(retried, PaymentStatus::Paid(_)));
    }

    #[tokio::test]
    async fn test_invoice_payment_stays_pending() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let user = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(user.user_id, &[(p1.id, 1)], PaymentMethod::CryptoInvoice))
            .await
            .unwrap();
        assert_eq!(order.payment_currency, "BTC");

        let status = h
            .orchestrator
            .pay(user, order.id, PaymentInstrument::default())
            .await
            .unwrap();

        let PaymentStatus::AwaitingConfirmation { order, invoice } = status else {
            panic!("expected a pending invoice");
        };
        assert_eq!(invoice.invoice_id, "inv_fake_1");
        assert!(!order.is_paid);
        assert_eq!(h.card.calls(), 0);
        assert_eq!(h.invoice.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_owner_cannot_see_or_pay_order() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let owner = Identity::user(Uuid::new_v4());
        let stranger = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(owner.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.order_for(stranger, order.id).await,
            Err(CheckoutError::Unauthorized)
        ));
        assert!(matches!(
            h.orchestrator.pay(stranger, order.id, card_token()).await,
            Err(CheckoutError::Unauthorized)
        ));
        assert!(h
            .orchestrator
            .order_for(Identity::admin(Uuid::new_v4()), order.id)
            .await
            .is_ok());
        assert_eq!(h.card.calls(), 0);
    }

    #[tokio::test]
    async fn test_delivery_is_admin_only_and_requires_payment() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let owner = Identity::user(Uuid::new_v4());
        let admin = Identity::admin(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(owner.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.mark_delivered(owner, order.id).await,
            Err(CheckoutError::Unauthorized)
        ));
        assert!(matches!(
            h.orchestrator.mark_delivered(admin, order.id).await,
            Err(CheckoutError::NotPaid(_))
        ));

        h.orchestrator.pay(owner, order.id, card_token()).await.unwrap();
        let delivered = h.orchestrator.mark_delivered(admin, order.id).await.unwrap();
        assert_eq!(delivered.status(), OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let h = harness(vec![], FakeCardGateway::new());
        let missing = Uuid::new_v4();

        assert!(matches!(
            h.orchestrator
                .order_for(Identity::admin(Uuid::new_v4()), missing)
                .await,
            Err(CheckoutError::OrderNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_missing_and_foreign_orders_look_the_same_to_users() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let owner = Identity::user(Uuid::new_v4());
        let stranger = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(owner.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();

        for id in [order.id, Uuid::new_v4()] {
            assert!(matches!(
                h.orchestrator.order_for(stranger, id).await,
                Err(CheckoutError::Unauthorized)
            ));
            assert!(matches!(
                h.orchestrator.pay(stranger, id, card_token()).await,
                Err(CheckoutError::Unauthorized)
            ));
        }
        assert_eq!(h.card.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_order_write_restores_stock() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let p2 = product(Decimal::new(500, 2), 2);
        let store = MemoryStore::with_products([p1.clone(), p2.clone()]);
        let (orchestrator, metrics) = unwritable(&store, 0);

        let result = orchestrator
            .checkout(request(
                Uuid::new_v4(),
                &[(p1.id, 3), (p2.id, 2)],
                PaymentMethod::Card,
            ))
            .await;

        assert!(matches!(result, Err(CheckoutError::Storage(_))));
        assert_eq!(store.stock_of(p1.id).await, Some(5));
        assert_eq!(store.stock_of(p2.id).await, Some(2));
        assert!(store.find_all().await.unwrap().is_empty());
        assert_eq!(metrics.stock_release_failures_total.get(), 0);
    }

    #[tokio::test]
    async fn test_transient_release_failure_is_retried() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let store = MemoryStore::with_products([p1.clone()]);
        let (orchestrator, metrics) = unwritable(&store, 2);

        let result = orchestrator
            .checkout(request(Uuid::new_v4(), &[(p1.id, 4)], PaymentMethod::Card))
            .await;

        assert!(result.is_err());
        assert_eq!(store.stock_of(p1.id).await, Some(5));
        assert_eq!(metrics.stock_release_failures_total.get(), 0);
    }

    #[tokio::test]
    async fn test_unreleasable_stock_is_counted() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let store = MemoryStore::with_products([p1.clone()]);
        let (orchestrator, metrics) = unwritable(&store, u32::MAX);

        let result = orchestrator
            .checkout(request(Uuid::new_v4(), &[(p1.id, 4)], PaymentMethod::Card))
            .await;

        assert!(result.is_err());
        assert_eq!(store.stock_of(p1.id).await, Some(1));
        assert_eq!(metrics.stock_release_failures_total.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_payment_is_refused_before_reaching_provider() {
        let gate = Arc::new(Semaphore::new(0));
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new().gated(gate.clone()));
        let user = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(user.user_id, &[(p1.id, 1)], PaymentMethod::Card))
            .await
            .unwrap();
        let order_id = order.id;

        let in_flight = tokio::spawn({
            let orchestrator = h.orchestrator.clone();
            async move { orchestrator.pay(user, order_id, card_token()).await }
        });
        while h.card.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let second = h.orchestrator.pay(user, order_id, card_token()).await;
        assert!(matches!(second, Err(CheckoutError::PaymentInProgress(id)) if id == order_id));
        assert_eq!(h.card.calls(), 1);

        gate.add_permits(1);
        let first = in_flight.await.unwrap().unwrap();
        assert!(matches!(first, PaymentStatus::Paid(_)));

        let again = h.orchestrator.pay(user, order_id, card_token()).await;
        assert!(matches!(again, Err(CheckoutError::AlreadyPaid(_))));
        assert_eq!(h.card.calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_order_never_reaches_provider() {
        let p1 = product(Decimal::new(1000, 2), 5);
        let h = harness(vec![p1.clone()], FakeCardGateway::new());
        let user = Identity::user(Uuid::new_v4());

        let order = h
            .orchestrator
            .checkout(request(user.user_id, &[(p1.id, 1)], PaymentMethod::CryptoInvoice))
            .await
            .unwrap();
        h.store
            .set_created_at(order.id, Utc::now() - Duration::hours(48))
            .await;
        h.store
            .expire_unpaid(Utc::now() - Duration::hours(24), Utc::now())
            .await
            .unwrap();

        let result = h
            .orchestrator
            .pay(user, order.id, PaymentInstrument::default())
            .await;

        assert!(matches!(result, Err(CheckoutError::OrderExpired(_))));
        assert_eq!(h.invoice.calls(), 0);
    }
}
