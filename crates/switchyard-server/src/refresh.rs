use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use switchyard_core::GatewayError;

use crate::{ErrorResponse, Gateway};

/// Shared state for the refresh endpoint
#[derive(Clone)]
pub struct RefreshState {
    pub gateway: Arc<Gateway>,
    pub gateway_secret: Option<SecretString>,
}

/// Reload every cache from the source of truth on demand
///
/// Disabled (403) unless a gateway secret is configured.
pub async fn refresh_handler(State(state): State<RefreshState>, headers: HeaderMap) -> Response {
    let Some(expected) = &state.gateway_secret else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let presented = headers.get("x-gateway-secret").and_then(|v| v.to_str().ok());
    if presented != Some(expected.expose_secret()) {
        return ErrorResponse(GatewayError::InvalidCredential).into_response();
    }

    match state.gateway.fabric.full_refresh().await {
        Ok(loaded) => {
            tracing::info!(entities = loaded, "manual cache refresh");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ErrorResponse(e).into_response(),
    }
}
