use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::Gateway;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    caches: BTreeMap<&'static str, usize>,
}

/// Liveness plus the size of every cache
pub async fn health_handler(State(gateway): State<Arc<Gateway>>) -> Json<HealthResponse> {
    let caches = gateway
        .registry
        .counts()
        .into_iter()
        .map(|(kind, count)| (kind.as_str(), count))
        .collect();

    Json(HealthResponse { status: "ok", caches })
}
