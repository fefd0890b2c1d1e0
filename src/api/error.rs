use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

use crate::checkout::{CheckoutError, RejectionReason};
use crate::payments::PaymentError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not authorized, no valid token")]
    Unauthenticated,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Internal(_) => "internal_error",
            ApiError::Checkout(err) => match err {
                CheckoutError::Validation(_) => "validation_failed",
                CheckoutError::Rejected { reason, .. } => reason.as_str(),
                CheckoutError::OrderNotFound(_) => "order_not_found",
                CheckoutError::Unauthorized => "forbidden",
                CheckoutError::AlreadyPaid(_) => "already_paid",
                CheckoutError::OrderExpired(_) => "order_expired",
                CheckoutError::PaymentInProgress(_) => "payment_in_progress",
                CheckoutError::NotPaid(_) => "not_paid",
                CheckoutError::PaymentDeclined { .. } => "payment_declined",
                CheckoutError::Provider { source, .. } => match source {
                    PaymentError::MissingToken | PaymentError::Unsupported { .. } => {
                        "invalid_payment"
                    }
                    PaymentError::CircuitOpen(_) => "provider_unavailable",
                    _ => "provider_error",
                },
                CheckoutError::ConflictingConfirmation(_) => "conflicting_confirmation",
                CheckoutError::Storage(_) => "internal_error",
            },
        }
    }

    /// Faults that must not leak detail to the caller.
    fn is_internal(&self) -> bool {
        matches!(
            self,
            ApiError::Internal(_) | ApiError::Checkout(CheckoutError::Storage(_))
        )
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Checkout(err) => match err {
                CheckoutError::Validation(_) => StatusCode::BAD_REQUEST,
                CheckoutError::Rejected { reason, .. } => match reason {
                    RejectionReason::InsufficientStock => StatusCode::BAD_REQUEST,
                    RejectionReason::ProductNotFound => StatusCode::NOT_FOUND,
                },
                CheckoutError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                CheckoutError::Unauthorized => StatusCode::FORBIDDEN,
                CheckoutError::AlreadyPaid(_)
                | CheckoutError::OrderExpired(_)
                | CheckoutError::PaymentInProgress(_)
                | CheckoutError::NotPaid(_)
                | CheckoutError::ConflictingConfirmation(_) => StatusCode::CONFLICT,
                CheckoutError::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
                CheckoutError::Provider { source, .. } => match source {
                    PaymentError::MissingToken | PaymentError::Unsupported { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    PaymentError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                },
                CheckoutError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = if self.is_internal() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": message,
        }))
    }
}
