use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::checkout::PaymentStatus;
use crate::domain::identity::Identity;
use crate::domain::order::{
    CartLine, CheckoutRequest, Order, OrderStatus, PaymentInstrument, PaymentMethod,
    ShippingAddress,
};
use crate::payments::InvoiceHandle;
use crate::webhook::{RejectReason, WebhookOutcome};

// ============================================================================
// Routes
// ============================================================================

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .error_handler(|err, _req| ApiError::BadRequest(err.to_string()).into()),
    )
    .service(
        web::scope("/api")
            .route("/orders", web::post().to(create_order))
            .route("/orders", web::get().to(list_all_orders))
            .route("/orders/myorders", web::get().to(my_orders))
            .route("/orders/{id}", web::get().to(get_order))
            .route("/orders/{id}/pay", web::post().to(pay_order))
            .route("/orders/{id}/pay", web::put().to(pay_order))
            .route("/orders/{id}/deliver", web::put().to(deliver_order))
            .route("/payments/bitpay/webhook", web::post().to(bitpay_webhook)),
    );
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub order_items: Vec<CartLine>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_currency: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayOrderRequest {
    #[serde(default, alias = "paymentMethodId")]
    pub payment_token: Option<String>,
    #[serde(default)]
    pub buyer_email: Option<String>,
}

#[derive(Debug, Serialize)]
struct OrderResponse<'a> {
    #[serde(flatten)]
    order: &'a Order,
    status: OrderStatus,
}

impl<'a> From<&'a Order> for OrderResponse<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            order,
            status: order.status(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PendingPaymentResponse<'a> {
    order: OrderResponse<'a>,
    invoice: &'a InvoiceHandle,
}

fn order_list(orders: &[Order]) -> Vec<OrderResponse<'_>> {
    orders.iter().map(OrderResponse::from).collect()
}

// ============================================================================
// Order handlers
// ============================================================================

async fn create_order(
    state: web::Data<AppState>,
    identity: Identity,
    body: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    let request = CheckoutRequest {
        user_id: identity.user_id,
        lines: body.order_items,
        shipping_address: body.shipping_address,
        payment_method: body.payment_method,
        payment_currency: body.payment_currency,
    };

    let order = state.orchestrator.checkout(request).await?;
    Ok(HttpResponse::Created().json(OrderResponse::from(&order)))
}

async fn get_order(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let order = state.orchestrator.order_for(identity, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(OrderResponse::from(&order)))
}

async fn my_orders(
    state: web::Data<AppState>,
    identity: Identity,
) -> Result<HttpResponse, ApiError> {
    let orders = state.orchestrator.orders_of(identity).await?;
    Ok(HttpResponse::Ok().json(order_list(&orders)))
}

async fn list_all_orders(
    state: web::Data<AppState>,
    identity: Identity,
) -> Result<HttpResponse, ApiError> {
    let orders = state.orchestrator.all_orders(identity).await?;
    Ok(HttpResponse::Ok().json(order_list(&orders)))
}

async fn pay_order(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<Uuid>,
    body: Option<web::Json<PayOrderRequest>>,
) -> Result<HttpResponse, ApiError> {
    let body = body.map(web::Json::into_inner).unwrap_or_default();
    let instrument = PaymentInstrument {
        payment_token: body.payment_token,
        buyer_email: body.buyer_email,
    };

    match state
        .orchestrator
        .pay(identity, path.into_inner(), instrument)
        .await?
    {
        PaymentStatus::Paid(order) => Ok(HttpResponse::Ok().json(OrderResponse::from(&order))),
        PaymentStatus::AwaitingConfirmation { order, invoice } => {
            Ok(HttpResponse::Accepted().json(PendingPaymentResponse {
                order: OrderResponse::from(&order),
                invoice: &invoice,
            }))
        }
    }
}

async fn deliver_order(
    state: web::Data<AppState>,
    identity: Identity,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, ApiError> {
    let order = state
        .orchestrator
        .mark_delivered(identity, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(OrderResponse::from(&order)))
}

// ============================================================================
// Provider callbacks
// ============================================================================

/// Public endpoint. Rejections carry no body so forged payloads learn
/// nothing about why they failed.
async fn bitpay_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let signature = req
        .headers()
        .get("x-signature")
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .reconciler
        .handle_provider_callback(&body, signature)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(match outcome {
        WebhookOutcome::Accepted => HttpResponse::Ok().finish(),
        WebhookOutcome::Rejected(reason) => match reason {
            RejectReason::InvalidSignature | RejectReason::MalformedPayload => {
                HttpResponse::BadRequest().finish()
            }
            RejectReason::UnknownOrder => HttpResponse::NotFound().finish(),
            RejectReason::MethodMismatch
            | RejectReason::ConflictingConfirmation
            | RejectReason::OrderExpired => HttpResponse::Conflict().finish(),
        },
    })
}
