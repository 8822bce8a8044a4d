use http::StatusCode;
use thiserror::Error;

use crate::EntityKind;

/// Trait for domain errors that can be converted to HTTP responses
///
/// The transport layer owns the actual response shaping; it only needs
/// a stable status, a machine-readable type and a safe message.
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Machine-readable error type (e.g. `insufficient_quota`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;
}

/// Error kinds produced by authentication, selection and bookkeeping
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The presented secret does not resolve to any app key
    #[error("invalid credential")]
    InvalidCredential,

    /// An entity in the credential chain is not enabled
    #[error("{entity} is disabled")]
    CredentialDisabled { entity: EntityKind },

    /// An entity in the credential chain is past its expiry
    #[error("{entity} has expired")]
    CredentialExpired { entity: EntityKind },

    /// An entity in the credential chain has no balance left
    #[error("{entity} quota exhausted")]
    QuotaExhausted { entity: EntityKind },

    /// An entity's balance is past its expiry
    #[error("{entity} quota expired")]
    QuotaExpired { entity: EntityKind },

    /// No bound group carries an enabled model with this name
    #[error("no eligible model for `{model}`")]
    NoEligibleModel { model: String },

    /// No agents are configured for the scope
    #[error("no agents configured for {scope}")]
    NoAvailableAgent { scope: String },

    /// Agents exist for the scope but none is enabled
    #[error("all agents for {scope} are disabled")]
    AllAgentsExcluded { scope: String },

    /// No keys are configured for the scope
    #[error("no keys configured for {scope}")]
    NoAvailableKey { scope: String },

    /// Keys exist for the scope but none is enabled
    #[error("all keys for {scope} are disabled")]
    AllKeysExcluded { scope: String },

    /// Client address rejected by an allow or deny list
    #[error("ip address {ip} is not allowed")]
    IpNotAllowed { ip: String },

    /// Source of truth or fast counters unreachable
    #[error("storage unavailable: {0}")]
    Storage(String),

    /// Change-notification bus failure
    #[error("change bus: {0}")]
    Bus(String),

    /// Stored configuration is unusable, e.g. a malformed IP range
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Every attempt within the retry budget failed upstream
    #[error("upstream failed after {attempts} attempt(s): {message}")]
    Upstream { attempts: u32, message: String },
}

impl GatewayError {
    /// Selection failure that a retry with a different candidate set may resolve
    pub const fn is_selection_exhausted(&self) -> bool {
        matches!(self, Self::AllAgentsExcluded { .. } | Self::AllKeysExcluded { .. })
    }

    /// Failure caused by infrastructure rather than by the request itself
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Bus(_))
    }
}

impl HttpError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidCredential | Self::CredentialExpired { .. } => StatusCode::UNAUTHORIZED,
            Self::CredentialDisabled { .. } | Self::IpNotAllowed { .. } => StatusCode::FORBIDDEN,
            Self::QuotaExhausted { .. } | Self::QuotaExpired { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NoEligibleModel { .. } => StatusCode::NOT_FOUND,
            Self::NoAvailableAgent { .. }
            | Self::AllAgentsExcluded { .. }
            | Self::NoAvailableKey { .. }
            | Self::AllKeysExcluded { .. }
            | Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Bus(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::InvalidCredential => "invalid_api_key",
            Self::CredentialDisabled { .. } => "api_key_disabled",
            Self::CredentialExpired { .. } => "api_key_expired",
            Self::QuotaExhausted { .. } => "insufficient_quota",
            Self::QuotaExpired { .. } => "quota_expired",
            Self::NoEligibleModel { .. } => "model_not_found",
            Self::NoAvailableAgent { .. } | Self::NoAvailableKey { .. } => "model_not_available",
            Self::AllAgentsExcluded { .. } | Self::AllKeysExcluded { .. } => "model_temporarily_unavailable",
            Self::IpNotAllowed { .. } => "ip_not_allowed",
            Self::Storage(_) | Self::Bus(_) | Self::Config(_) => "internal_error",
            Self::Upstream { .. } => "upstream_error",
        }
    }

    fn client_message(&self) -> String {
        match self {
            // Infrastructure detail stays in the logs
            Self::Storage(_) | Self::Bus(_) | Self::Config(_) => "internal server error".to_owned(),
            Self::Upstream { attempts, .. } => format!("upstream request failed after {attempts} attempt(s)"),
            Self::NoAvailableAgent { .. } | Self::NoAvailableKey { .. } => {
                "the requested model has no configured backends".to_owned()
            }
            Self::AllAgentsExcluded { .. } | Self::AllKeysExcluded { .. } => {
                "the requested model is temporarily unavailable".to_owned()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_vs_outage_are_distinct() {
        let none = GatewayError::NoAvailableAgent { scope: "model m1".to_owned() };
        let all = GatewayError::AllAgentsExcluded { scope: "model m1".to_owned() };

        assert_ne!(none.error_type(), all.error_type());
        assert!(!none.is_selection_exhausted());
        assert!(all.is_selection_exhausted());
    }

    #[test]
    fn storage_detail_is_not_exposed() {
        let err = GatewayError::Storage("redis://10.0.0.1 refused".to_owned());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.client_message().contains("10.0.0.1"));
        assert!(err.is_transient());
    }

    #[test]
    fn quota_errors_name_the_entity() {
        let err = GatewayError::QuotaExhausted { entity: EntityKind::AppKey };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.client_message(), "app_key quota exhausted");
    }
}
