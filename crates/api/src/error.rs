//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::DomainError;
use settlement::SettlementError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// The resource moved on before the request applied.
    Conflict(String),
    /// Pipeline error.
    Settlement(SettlementError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Settlement(err) => settlement_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn settlement_error_to_response(err: SettlementError) -> (StatusCode, String) {
    let status = match &err {
        SettlementError::Validation(_) | SettlementError::InsufficientStock { .. } => {
            StatusCode::BAD_REQUEST
        }
        SettlementError::OrderNotFound(_)
        | SettlementError::OrderItemNotFound(_)
        | SettlementError::PaymentNotFound(_)
        | SettlementError::JobNotFound(_)
        | SettlementError::EndpointNotFound(_)
        | SettlementError::DeliveryNotFound(_) => StatusCode::NOT_FOUND,
        SettlementError::Domain(DomainError::InvalidTransition { .. }) => StatusCode::CONFLICT,
        SettlementError::Domain(DomainError::InvalidOrder(_)) => StatusCode::BAD_REQUEST,
        SettlementError::ExternalTransient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SettlementError::ExternalPermanent { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, err.to_string())
}

impl From<SettlementError> for ApiError {
    fn from(err: SettlementError) -> Self {
        ApiError::Settlement(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderId;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_settlement_error_statuses() {
        assert_eq!(
            status_of(SettlementError::Validation("bad".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SettlementError::OrderNotFound(OrderId::new()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                SettlementError::ExternalTransient {
                    service: "payment gateway",
                    reason: "timeout".into()
                }
                .into()
            ),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(
                SettlementError::Domain(DomainError::InvalidTransition {
                    entity: "order",
                    from: "DELIVERED".into(),
                    to: "CANCELLED".into(),
                })
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SettlementError::InvariantViolation("x".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
