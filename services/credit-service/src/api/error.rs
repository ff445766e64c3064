//! JSON rendering of [`ServiceError`].

use crate::error::ServiceError;
use actix_web::http::{header, StatusCode};
use actix_web::{HttpResponse, ResponseError};

impl ServiceError {
    /// Stable machine-readable code for the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPackage(_) => "InvalidPackage",
            Self::Validation(_) => "ValidationError",
            Self::InvalidSignature => "InvalidSignature",
            Self::OrderNotFound(_) => "OrderNotFound",
            Self::ResourceNotFound(_) => "ResourceNotFound",
            Self::InsufficientCredit { .. } => "InsufficientCredit",
            Self::GatewayUnavailable(_) => "GatewayUnavailable",
            Self::StorageUnavailable(_) => "StorageUnavailable",
            Self::RateLimited { .. } => "RateLimited",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Forbidden(_) => "Forbidden",
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPackage(_) | Self::Validation(_) | Self::InvalidSignature => {
                StatusCode::BAD_REQUEST
            }
            Self::OrderNotFound(_) | Self::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = serde_json::json!({
            "success": false,
            "error": self.code(),
            "message": self.to_string(),
        });
        let mut response = HttpResponse::build(self.status_code());
        match self {
            Self::InsufficientCredit { balance, required } => {
                body["creditsRemaining"] = (*balance).into();
                body["creditsRequired"] = (*required).into();
            }
            Self::RateLimited { retry_after_secs } => {
                body["retryAfter"] = (*retry_after_secs).into();
                response.insert_header((header::RETRY_AFTER, retry_after_secs.to_string()));
            }
            _ => {}
        }
        response.json(body)
    }
}
