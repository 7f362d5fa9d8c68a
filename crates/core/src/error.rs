use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Rate-limit reset information recovered from upstream response headers.
///
/// Providers expose more than one concurrent rate-limit window (e.g. a
/// short request-rate window alongside a longer quota window); `primary` is
/// the window the cooldown engine actually consumes, `secondary` is kept
/// around for forward-compatibility but never consulted — which of the two
/// windows upstream intends as authoritative isn't specified anywhere in
/// the APIs that send both, so treating the second as informational-only is
/// a deliberate, documented non-resolution rather than a guess.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub primary_reset: Option<DateTime<Utc>>,
    pub secondary_reset: Option<DateTime<Utc>>,
    /// True when the reset header/body indicates quota exhaustion rather
    /// than a transient request-rate limit (e.g. an `insufficient_quota`
    /// error code or a billing-period reset window).
    pub quota_exhausted: bool,
}

/// Unified error type for all proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("no credentials available for provider {provider}, model {model}")]
    NoCredentials { provider: String, model: String },

    #[error("model {model} is in cooldown for {seconds}s")]
    ModelCooldown { model: String, seconds: u64 },

    #[error("upstream error (status {status}): {body}")]
    Upstream {
        status: u16,
        body: String,
        /// Parsed from upstream `Retry-After` header (seconds), if present.
        retry_after_secs: Option<u64>,
        /// Structured rate-limit reset info, when the response carried
        /// provider-specific rate-limit headers (richer than a bare
        /// `Retry-After`). When both are present, `rate_limit.primary_reset`
        /// takes precedence over `retry_after_secs` — see `explicit_until()`.
        rate_limit: Option<RateLimitInfo>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// The client disconnected or the request's context was cancelled before
    /// an upstream response arrived. Never counts against a credential's
    /// cooldown — a cancelled request says nothing about upstream health.
    #[error("request cancelled")]
    Cancelled,

    #[error("translation error: {0}")]
    Translation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::NoCredentials { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ModelCooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Translation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Auth(_) => "authentication_error",
            Self::NoCredentials { .. } => "insufficient_quota",
            Self::ModelCooldown { .. } => "rate_limit_error",
            Self::RateLimited(_) => "rate_limit_error",
            Self::Cancelled => "cancelled",
            Self::BadRequest(_) => "invalid_request_error",
            Self::ModelNotFound(_) => "invalid_request_error",
            Self::Upstream { .. } => "upstream_error",
            _ => "server_error",
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Self::Auth(_) => "invalid_api_key",
            Self::NoCredentials { .. } => "insufficient_quota",
            Self::ModelCooldown { .. } => "rate_limit_exceeded",
            Self::RateLimited(_) => "rate_limit_exceeded",
            Self::Cancelled => "request_cancelled",
            Self::ModelNotFound(_) => "model_not_found",
            Self::BadRequest(_) => "invalid_request",
            _ => "internal_error",
        }
    }

    /// HTTP status code of the upstream response, if this error originated from one.
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `Retry-After` value (seconds) parsed from the upstream response, if present.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Upstream {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    /// The explicit cooldown deadline to hand to `CooldownEngine::record_failure`,
    /// if this error carries one. `rate_limit.primary_reset` (a provider-reported
    /// reset timestamp) takes precedence over a bare `Retry-After` duration when
    /// both are present — the source this was distilled from uses the same
    /// precedence when a 429 carries both a structured reset time and a generic
    /// `Retry-After` header.
    pub fn explicit_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Upstream {
                rate_limit,
                retry_after_secs,
                ..
            } => rate_limit
                .and_then(|r| r.primary_reset)
                .or_else(|| retry_after_secs.map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64))),
            _ => None,
        }
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Upstream { status, .. } if (500..600).contains(status))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Upstream { status, .. } if *status == 429)
    }

    /// Whether retrying this request against a different credential/route is worthwhile.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Upstream { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }

    /// Classify this error into a cooldown reason, if it should trigger one.
    pub fn cooldown_reason(&self) -> Option<crate::cooldown::CooldownReason> {
        use crate::cooldown::CooldownReason;
        match self {
            Self::Network(_) => Some(CooldownReason::NetworkError),
            Self::Upstream {
                status,
                body,
                rate_limit,
                ..
            } if *status == 429 => {
                if rate_limit.is_some_and(|r| r.quota_exhausted)
                    || body.to_lowercase().contains("quota")
                    || body.to_lowercase().contains("insufficient_quota")
                {
                    Some(CooldownReason::QuotaExhausted)
                } else if body.to_lowercase().contains("concurren") {
                    Some(CooldownReason::ConcurrentLimit)
                } else {
                    Some(CooldownReason::RateLimit)
                }
            }
            Self::Upstream { status, .. } if (500..600).contains(status) => {
                Some(CooldownReason::ServerError)
            }
            // Unauthorized: the adapter already had its shot at an in-place
            // token refresh/retry before this ever reaches here. A 401 that
            // still came through says nothing about the upstream's general
            // health, so it shouldn't cool the credential down.
            Self::Upstream { status, .. } if *status == 401 => None,
            Self::Upstream { .. } => Some(CooldownReason::Unknown),
            _ => None,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // For upstream errors, try to pass through the original JSON body
        if let Self::Upstream { body, .. } = &self
            && serde_json::from_str::<serde_json::Value>(body).is_ok()
        {
            return (status, [("content-type", "application/json")], body.clone()).into_response();
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.error_code(),
            }
        });

        (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::Network(format!("connection failed: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Translation(format!("JSON error: {e}"))
    }
}
