//! Axum-facing errors: failures the ingress produces before a request ever
//! reaches the middleware chain (blocked path, disallowed CORS origin,
//! admission rejection, unmapped port). Rendered in the same `{"err": {...}}`
//! envelope shape as errors that cross the bus, for a consistent external
//! contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fabric_kernel::error::FabricError;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("path is blocked")]
    BlockedPath,
    #[error("origin not allowed")]
    CorsDisallowed,
    #[error("request body exceeds the memory budget")]
    RequestTooLarge,
    #[error("no internal route for this port")]
    Unmapped,
    #[error(transparent)]
    Upstream(#[from] FabricError),
}

impl GatewayError {
    fn to_fabric_error(&self) -> FabricError {
        match self {
            GatewayError::BlockedPath | GatewayError::Unmapped => FabricError::not_found(self.to_string()),
            GatewayError::CorsDisallowed => FabricError::forbidden(self.to_string()),
            GatewayError::RequestTooLarge => FabricError::payload_too_large(self.to_string()),
            GatewayError::Upstream(err) => err.clone(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let fabric_error = self.to_fabric_error();
        let status = StatusCode::from_u16(fabric_error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = fabric_error.to_envelope().render(true);
        (status, axum::Json(body)).into_response()
    }
}
