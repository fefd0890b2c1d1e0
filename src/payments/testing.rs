use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use super::invoice::{parse_ipn, sign_payload, verify_signature};
use super::{InvoiceHandle, PaymentError, PaymentGateway, PaymentRequest, ProviderCallback};
use crate::domain::order::{Confirmation, PaymentMethod};

// ============================================================================
// Scripted gateways for orchestrator, reconciler and HTTP tests
// ============================================================================

pub const WEBHOOK_SECRET: &str = "whsec_fake";

/// Card gateway that replays a script of outcomes, then succeeds.
#[derive(Default)]
pub struct FakeCardGateway {
    script: Mutex<VecDeque<Result<Confirmation, PaymentError>>>,
    calls: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl FakeCardGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, outcome: Result<Confirmation, PaymentError>) -> Self {
        self.script
            .lock()
            .expect("fake gateway script poisoned")
            .push_back(outcome);
        self
    }

    /// Hold every charge until `gate` hands out a permit.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeCardGateway {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn charge_synchronously(
        &self,
        request: &PaymentRequest,
    ) -> Result<Confirmation, PaymentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if request.payment_token.is_none() {
            return Err(PaymentError::MissingToken);
        }

        let scripted = self
            .script
            .lock()
            .expect("fake gateway script poisoned")
            .pop_front();

        scripted.unwrap_or_else(|| Ok(Confirmation::new("stripe", format!("pi_fake_{}", call))))
    }
}

/// Invoice gateway that hands out predictable invoice ids and verifies
/// callbacks with the real HMAC scheme.
#[derive(Default)]
pub struct FakeInvoiceGateway {
    calls: AtomicU32,
}

impl FakeInvoiceGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sign(payload: &[u8]) -> String {
        sign_payload(WEBHOOK_SECRET, payload)
    }
}

#[async_trait]
impl PaymentGateway for FakeInvoiceGateway {
    fn provider(&self) -> &'static str {
        "bitpay"
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::CryptoInvoice
    }

    async fn create_async_invoice(
        &self,
        request: &PaymentRequest,
    ) -> Result<InvoiceHandle, PaymentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InvoiceHandle {
            invoice_id: format!("inv_fake_{}", call),
            url: format!("https://pay.example/i/{}", request.order_id),
            status: "new".to_string(),
            expires_at: None,
        })
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<(), PaymentError> {
        verify_signature(WEBHOOK_SECRET, payload, signature)
    }

    fn parse_callback(&self, payload: &[u8]) -> Result<ProviderCallback, PaymentError> {
        parse_ipn(payload)
    }
}

/// Signed IPN body for `order_id` with the given invoice id and status.
pub fn signed_callback(order_id: uuid::Uuid, invoice_id: &str, status: &str) -> (Vec<u8>, String) {
    let payload = serde_json::json!({
        "event": { "name": format!("invoice_{}", status) },
        "data": { "id": invoice_id, "orderId": order_id.to_string(), "status": status }
    })
    .to_string()
    .into_bytes();
    let signature = FakeInvoiceGateway::sign(&payload);
    (payload, signature)
}
