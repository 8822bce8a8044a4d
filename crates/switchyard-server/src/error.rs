use axum::Json;
use axum::response::{IntoResponse, Response};
use switchyard_core::{GatewayError, HttpError};

/// JSON error body for a [`GatewayError`]
#[derive(Debug)]
pub struct ErrorResponse(pub GatewayError);

impl From<GatewayError> for ErrorResponse {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({
            "error": {
                "type": self.0.error_type(),
                "message": self.0.client_message(),
                "code": status.as_u16(),
            }
        });

        (status, Json(body)).into_response()
    }
}
