use switchyard_core::{EntityKind, GatewayError};
use thiserror::Error;

/// Storage, counter and bus errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist
    #[error("{kind} `{id}` not found")]
    NotFound { kind: EntityKind, id: String },

    /// Backend connection or command error
    #[error("storage backend: {0}")]
    Backend(String),

    /// A stored document does not match the entity shape
    #[error("failed to decode {kind}: {message}")]
    Decode { kind: EntityKind, message: String },

    /// A value could not be serialized for storage
    #[error("serialization: {0}")]
    Serialization(String),

    /// Change bus publish or subscribe error
    #[error("change bus: {0}")]
    Bus(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Bus(message) => Self::Bus(message),
            other => Self::Storage(other.to_string()),
        }
    }
}
