use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use super::{to_minor_units, PaymentError, PaymentGateway, PaymentRequest};
use crate::domain::order::{Confirmation, PaymentMethod};
use crate::utils::{
    retry_on_transient, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig,
};

// ============================================================================
// Card Gateway - Stripe PaymentIntents over REST
// ============================================================================
//
// Create-and-confirm in one call, so the outcome is known before the HTTP
// response to the shopper is written. The Idempotency-Key is fixed for one
// payment attempt: transient retries inside it collapse into a single charge,
// while the shopper's next attempt gets a fresh answer from the provider.
//
// ============================================================================

const PROVIDER: &str = "stripe";

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
    pub timeout: Duration,
}

pub struct StripeCardGateway {
    client: reqwest::Client,
    config: StripeConfig,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

impl StripeCardGateway {
    pub fn new(config: StripeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            breaker: CircuitBreaker::new(PROVIDER, CircuitBreakerConfig::default()),
            retry: RetryConfig::default(),
        })
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn create_intent(
        &self,
        request: &PaymentRequest,
        token: &str,
        amount_minor: i64,
        idempotency_key: &str,
    ) -> Result<Confirmation, PaymentError> {
        let amount = amount_minor.to_string();
        let currency = request.currency.to_ascii_lowercase();
        let description = format!("Order {}", request.order_id);
        let order_id = request.order_id.to_string();

        let response = self
            .client
            .post(format!("{}/v1/payment_intents", self.config.api_base))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .header("Idempotency-Key", idempotency_key)
            .form(&[
                ("amount", amount.as_str()),
                ("currency", currency.as_str()),
                ("payment_method", token),
                ("confirm", "true"),
                ("automatic_payment_methods[enabled]", "true"),
                ("automatic_payment_methods[allow_redirects]", "never"),
                ("description", description.as_str()),
                ("metadata[order_id]", order_id.as_str()),
            ])
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

        interpret_intent(status, &body)
    }
}

/// One key per payment attempt on an order.
pub(crate) fn idempotency_key(request: &PaymentRequest) -> String {
    format!("order-{}-attempt-{}", request.order_id, request.attempt_id.simple())
}

/// Map a PaymentIntents response onto a confirmation or a payment error.
pub(crate) fn interpret_intent(
    status: u16,
    body: &serde_json::Value,
) -> Result<Confirmation, PaymentError> {
    if (200..300).contains(&status) {
        let intent_status = body["status"].as_str().unwrap_or("");
        if intent_status != "succeeded" {
            return Err(PaymentError::Declined {
                reason: format!("payment intent is {}", intent_status),
            });
        }

        let reference = body["id"]
            .as_str()
            .ok_or_else(|| PaymentError::MalformedPayload("payment intent without id".into()))?;

        return Ok(Confirmation::new(PROVIDER, reference).with_detail(json!({
            "status": intent_status,
            "amount": body["amount"],
            "currency": body["currency"],
        })));
    }

    let error = &body["error"];
    let message = error["message"]
        .as_str()
        .unwrap_or("no error message")
        .to_string();

    if status == 402 || error["type"].as_str() == Some("card_error") {
        let reason = error["decline_code"]
            .as_str()
            .or_else(|| error["code"].as_str())
            .map(|code| format!("{}: {}", code, message))
            .unwrap_or(message);
        return Err(PaymentError::Declined { reason });
    }

    if status == 429 || status >= 500 {
        Err(PaymentError::transient(PROVIDER, format!("HTTP {}: {}", status, message)))
    } else {
        Err(PaymentError::permanent(PROVIDER, format!("HTTP {}: {}", status, message)))
    }
}

#[async_trait]
impl PaymentGateway for StripeCardGateway {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn method(&self) -> PaymentMethod {
        PaymentMethod::Card
    }

    async fn charge_synchronously(
        &self,
        request: &PaymentRequest,
    ) -> Result<Confirmation, PaymentError> {
        let token = request
            .payment_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(PaymentError::MissingToken)?;
        let amount_minor = to_minor_units(request.amount)?;
        let key = idempotency_key(request);
        let key = key.as_str();

        tracing::debug!(
            order_id = %request.order_id,
            amount_minor,
            currency = %request.currency,
            idempotency_key = key,
            "Creating payment intent"
        );

        retry_on_transient(&self.retry, "stripe.payment_intents.create", |_attempt| async move {
            self.breaker
                .call(self.create_intent(request, token, amount_minor, key))
                .await
                .map_err(|e| PaymentError::from_breaker(PROVIDER, e))
        })
        .await
        .into_result()
    }

    async fn circuit_state(&self) -> CircuitState {
        self.breaker.state().await
    }
}
