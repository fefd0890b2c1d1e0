use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

use super::{
    InvoiceHandle, PaymentError, PaymentGateway, PaymentRequest, ProviderCallback,
    SettlementStatus,
};
use crate::domain::order::PaymentMethod;
use crate::utils::{
    retry_on_transient, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig,
};

// ============================================================================
// Invoice Gateway - BitPay-style crypto invoices
// ============================================================================
//
// Creating an invoice only yields a redirect URL. Settlement is reported
// later by a signed callback: `x-signature` carries the hex HMAC-SHA256 of
// the raw body keyed with the shared webhook secret.
//
// ============================================================================

const PROVIDER: &str = "bitpay";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct BitpayConfig {
    pub token: String,
    pub api_base: String,
    pub webhook_secret: String,
    pub timeout: Duration,
}

pub struct BitpayInvoiceGateway {
    client: reqwest::Client,
    config: BitpayConfig,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl BitpayInvoiceGateway {
    pub fn new(config: BitpayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        // Invoice creation is not idempotent on the provider side; a retry
        // could leave a second open invoice, so only one attempt is made.
        Ok(Self {
            client,
            config,
            breaker: CircuitBreaker::new(PROVIDER, CircuitBreakerConfig::default()),
            retry: RetryConfig::single_attempt(),
        })
    }

    async fn post_invoice(&self, body: &serde_json::Value) -> Result<InvoiceHandle, PaymentError> {
        let response = self
            .client
            .post(format!("{}/invoices", self.config.api_base))
            .header("X-Accept-Version", "2.0.0")
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::transient(PROVIDER, e.to_string()))?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.map_err(|e| {
            if status >= 500 {
                PaymentError::transient(PROVIDER, e.to_string())
            } else {
                PaymentError::MalformedPayload(e.to_string())
            }
        })?;

        interpret_invoice(status, &body)
    }
}

fn invoice_body(token: &str, request: &PaymentRequest) -> Result<serde_json::Value, PaymentError> {
    let price = request
        .amount
        .to_f64()
        .ok_or_else(|| PaymentError::MalformedPayload(format!("bad amount {}", request.amount)))?;

    let mut body = json!({
        "token": token,
        "price": price,
        "currency": request.currency,
        "paymentCurrencies": [request.settlement_currency],
        "orderId": request.order_id.to_string(),
        "notificationURL": request.notify_url,
        "redirectURL": request.redirect_url,
        "fullNotifications": true,
        "extendedNotifications": true,
        "transactionSpeed": "medium",
    });

    if let Some(email) = &request.buyer_email {
        body["buyer"] = json!({ "email": email, "notify": true });
    }

    Ok(body)
}

pub(crate) fn interpret_invoice(
    status: u16,
    body: &serde_json::Value,
) -> Result<InvoiceHandle, PaymentError> {
    if !(200..300).contains(&status) {
        let message = body["error"].as_str().unwrap_or("no error message");
        let message = format!("HTTP {}: {}", status, message);
        return Err(if status == 429 || status >= 500 {
            PaymentError::transient(PROVIDER, message)
        } else {
            PaymentError::permanent(PROVIDER, message)
        });
    }

    let data = &body["data"];
    let field = |name: &str| {
        data[name]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PaymentError::MalformedPayload(format!("invoice without {}", name)))
    };

    Ok(InvoiceHandle {
        invoice_id: field("id")?,
        url: field("url")?,
        status: data["status"].as_str().unwrap_or("new").to_string(),
        expires_at: data["expirationTime"]
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    })
}

/// Hex HMAC-SHA256 of `payload`, as the provider sends it in `x-signature`.
#[cfg(test)]
pub(crate) fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC takes keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn verify_signature(
    secret: &str,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<(), PaymentError> {
    let signature = signature.ok_or(PaymentError::InvalidSignature)?;
    let expected = hex::decode(signature.trim()).map_err(|_| PaymentError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature)
}

#[derive(Debug, Deserialize)]
struct IpnBody {
    #[serde(default)]
    event: serde_json::Value,
    data: IpnData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpnData {
    id: String,
    order_id: String,
    status: String,
}

pub(crate) fn settlement_status(raw: &str) -> SettlementStatus {
    match raw {
        "confirmed" | "complete" => SettlementStatus::Settled,
        "expired" | "invalid" | "declined" => SettlementStatus::Failed,
        _ => SettlementStatus::Pending,
    }
}

pub(crate) fn parse_ipn(payload: &[u8]) -> Result<ProviderCallback, PaymentError> {
    let body: IpnBody = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::MalformedPayload(e.to_string()))?;

    let order_id = Uuid::parse_str(&body.data.order_id)
        .map_err(|_| PaymentError::MalformedPayload(format!("bad orderId {}", body.data.order_id)))?;

    Ok(ProviderCallback {
        order_id,
        status: settlement_status(&body.data.status),
        detail: json!({ "status": body.data.status, "event": body.event }),
        raw_status: body.data.status,
        reference: body.data.id,
    })
}

#[async_trait]
impl PaymentGateway for BitpayInvoiceGateway {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::CryptoInvoice
    }

    async fn create_async_invoice(
        &self,
        request: &PaymentRequest,
    ) -> Result<InvoiceHandle, PaymentError> {
        let body = invoice_body(&self.config.token, request)?;
        let body = &body;

        tracing::debug!(
            order_id = %request.order_id,
            settlement_currency = %request.settlement_currency,
            "Creating invoice"
        );

        retry_on_transient(&self.retry, "bitpay.invoices.create", |_attempt| async move {
            self.breaker
                .call(self.post_invoice(body))
                .await
                .map_err(|e| PaymentError::from_breaker(PROVIDER, e))
        })
        .await
        .into_result()
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<(), PaymentError> {
        verify_signature(&self.config.webhook_secret, payload, signature)
    }

    fn parse_callback(&self, payload: &[u8]) -> Result<ProviderCallback, PaymentError> {
        parse_ipn(payload)
    }

    async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const SECRET: &str = "whsec_test";

    fn request() -> PaymentRequest {
        PaymentRequest {
            attempt_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            amount: Decimal::new(3300, 2),
            currency: "USD".to_string(),
            settlement_currency: "BTC".to_string(),
            payment_token: None,
            buyer_email: Some("shopper@example.com".to_string()),
            notify_url: "https://shop.example.com/api/payments/bitpay/webhook".to_string(),
            redirect_url: "https://shop.example.com/order/1/success".to_string(),
        }
    }

    #[test]
    fn test_invoice_body_fields() {
        let request = request();
        let body = invoice_body("tok", &request).unwrap();

        assert_eq!(body["price"], 33.0);
        assert_eq!(body["currency"], "USD");
        assert_eq!(body["paymentCurrencies"][0], "BTC");
        assert_eq!(body["orderId"], request.order_id.to_string());
        assert_eq!(body["transactionSpeed"], "medium");
        assert_eq!(body["buyer"]["email"], "shopper@example.com");
    }

    #[test]
    fn test_interpret_invoice_response() {
        let body = json!({
            "data": { "id": "inv_1", "url": "https://pay.example/i/inv_1", "status": "new", "expirationTime": 1_700_000_000_000i64 }
        });

        let handle = interpret_invoice(200, &body).unwrap();

        assert_eq!(handle.invoice_id, "inv_1");
        assert_eq!(handle.url, "https://pay.example/i/inv_1");
        assert_eq!(handle.expires_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_interpret_invoice_missing_url() {
        let body = json!({ "data": { "id": "inv_1" } });
        assert!(matches!(
            interpret_invoice(200, &body),
            Err(PaymentError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let payload = br#"{"data":{"id":"inv_1","orderId":"x","status":"confirmed"}}"#;
        let signature = sign_payload(SECRET, payload);

        assert!(verify_signature(SECRET, payload, Some(&signature)).is_ok());
        assert!(verify_signature("other", payload, Some(&signature)).is_err());
        assert!(verify_signature(SECRET, b"{}", Some(&signature)).is_err());
        assert!(verify_signature(SECRET, payload, Some("zz-not-hex")).is_err());
        assert!(verify_signature(SECRET, payload, None).is_err());
    }

    #[test]
    fn test_settlement_status_mapping() {
        assert_eq!(settlement_status("confirmed"), SettlementStatus::Settled);
        assert_eq!(settlement_status("complete"), SettlementStatus::Settled);
        assert_eq!(settlement_status("expired"), SettlementStatus::Failed);
        assert_eq!(settlement_status("invalid"), SettlementStatus::Failed);
        assert_eq!(settlement_status("paid"), SettlementStatus::Pending);
        assert_eq!(settlement_status("new"), SettlementStatus::Pending);
    }

    #[test]
    fn test_parse_ipn() {
        let order_id = Uuid::new_v4();
        let payload = json!({
            "event": { "code": 1005, "name": "invoice_confirmed" },
            "data": { "id": "inv_7", "orderId": order_id.to_string(), "status": "confirmed" }
        });

        let callback = parse_ipn(payload.to_string().as_bytes()).unwrap();

        assert_eq!(callback.order_id, order_id);
        assert_eq!(callback.reference, "inv_7");
        assert_eq!(callback.status, SettlementStatus::Settled);
        assert_eq!(callback.detail["event"]["name"], "invoice_confirmed");
    }

    #[test]
    fn test_parse_ipn_rejects_bad_order_id() {
        let payload = br#"{"data":{"id":"inv_7","orderId":"not-a-uuid","status":"confirmed"}}"#;
        assert!(matches!(
            parse_ipn(payload),
            Err(PaymentError::MalformedPayload(_))
        ));
    }
}
