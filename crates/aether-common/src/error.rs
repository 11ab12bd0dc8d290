pub type GatewayResult<T> = Result<T, GatewayError>;

/// Canonical gateway error kinds.
///
/// `kind()` values are stable identifiers used in logs, task records and
/// usage metadata; display strings are client-safe after sanitization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP 200 with an error payload in the body; retryable across candidates.
    #[error("embedded error from {provider}: {message}")]
    EmbeddedError {
        provider: String,
        code: Option<i64>,
        message: String,
        status: Option<String>,
    },

    /// HTML body or 5xx from an upstream; retryable across candidates.
    #[error("provider not available: {0}")]
    ProviderNotAvailable(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("poll failed permanently: {0}")]
    PollPermanentError(String),

    #[error("poll budget exhausted after {0} polls")]
    PollTimeout(i32),

    #[error("failed to decrypt provider credential")]
    DecryptionError,

    #[error("task missing provider endpoint or key")]
    MissingProviderInfo,

    #[error("task missing external task id")]
    MissingExternalTaskId,

    #[error("billing incomplete, missing dimensions: {0:?}")]
    BillingIncomplete(Vec<String>),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Duplicate external id on submit and similar uniqueness races.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::EmbeddedError { .. } => "embedded_error",
            GatewayError::ProviderNotAvailable(_) => "provider_not_available",
            GatewayError::ClientDisconnected => "client_disconnected",
            GatewayError::PollPermanentError(_) => "poll_permanent_error",
            GatewayError::PollTimeout(_) => "poll_timeout",
            GatewayError::DecryptionError => "decryption_error",
            GatewayError::MissingProviderInfo => "missing_provider_info",
            GatewayError::MissingExternalTaskId => "missing_external_task_id",
            GatewayError::BillingIncomplete(_) => "billing_incomplete",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::NotFound(_) => "not_found",
        }
    }

    /// Whether the scheduler may advance to the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::EmbeddedError { .. }
                | GatewayError::ProviderNotAvailable(_)
                | GatewayError::Upstream(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_canonical() {
        assert_eq!(
            GatewayError::ProviderNotAvailable("x".into()).kind(),
            "provider_not_available"
        );
        assert_eq!(GatewayError::ClientDisconnected.kind(), "client_disconnected");
    }

    #[test]
    fn retryability_matches_dispatch_contract() {
        assert!(
            GatewayError::EmbeddedError {
                provider: "gemini".into(),
                code: Some(429),
                message: "quota".into(),
                status: Some("RESOURCE_EXHAUSTED".into()),
            }
            .is_retryable()
        );
        assert!(!GatewayError::ClientDisconnected.is_retryable());
        assert!(!GatewayError::InvalidRequest("bad".into()).is_retryable());
    }
}
