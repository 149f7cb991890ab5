use axum::response::IntoResponse;

/// Canonical error type used across all modules.
///
/// Each variant carries the stable category name surfaced to clients; the
/// HTTP edge is the only place categories become status codes.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Blocked by policy: {0}")]
    BlockedByPolicy(String),
    #[error("Empty prompt")]
    EmptyPrompt,
    #[error("Unsupported media type")]
    UnsupportedMediaType,
    #[error("Authentication required")]
    AuthRequired,
    #[error("Model not allowed: {model} for vendor {vendor}")]
    ModelNotAllowed { model: String, vendor: String },
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Vendor unavailable: {0}")]
    VendorUnavailable(String),
    #[error("All vendors unavailable")]
    AllVendorsUnavailable,
    #[error("Downstream error: {0}")]
    Downstream(String),
    #[error("Client cancelled the request")]
    Cancelled,
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Stable category name used in traces and streaming error tokens.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            RouterError::InvalidRequest(_) => "invalid_request",
            RouterError::BlockedByPolicy(_) => "blocked_by_policy",
            RouterError::EmptyPrompt => "empty_prompt",
            RouterError::UnsupportedMediaType => "unsupported_media_type",
            RouterError::AuthRequired => "auth_error",
            RouterError::ModelNotAllowed { .. } => "model_not_allowed",
            RouterError::RateLimited(_) => "rate_limited",
            RouterError::QuotaExceeded(_) => "quota_exceeded",
            RouterError::Timeout(_) => "timeout",
            RouterError::VendorUnavailable(_) => "vendor_unavailable",
            RouterError::AllVendorsUnavailable => "all_vendors_unavailable",
            RouterError::Downstream(_) => "downstream_error",
            RouterError::Cancelled => "cancelled",
            RouterError::Config(_) | RouterError::Internal(_) => "downstream_error",
        }
    }

    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            RouterError::InvalidRequest(_) | RouterError::BlockedByPolicy(_) => {
                http::StatusCode::BAD_REQUEST
            }
            RouterError::EmptyPrompt => http::StatusCode::UNPROCESSABLE_ENTITY,
            RouterError::UnsupportedMediaType => http::StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RouterError::AuthRequired => http::StatusCode::UNAUTHORIZED,
            RouterError::ModelNotAllowed { .. } => http::StatusCode::FORBIDDEN,
            RouterError::RateLimited(_) | RouterError::QuotaExceeded(_) => {
                http::StatusCode::TOO_MANY_REQUESTS
            }
            RouterError::Timeout(_) => http::StatusCode::GATEWAY_TIMEOUT,
            RouterError::VendorUnavailable(_) | RouterError::AllVendorsUnavailable => {
                http::StatusCode::SERVICE_UNAVAILABLE
            }
            RouterError::Downstream(_) | RouterError::Config(_) | RouterError::Internal(_) => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
            // Client is gone; the status is never observed but pick something sane.
            RouterError::Cancelled => http::StatusCode::from_u16(499)
                .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Category token emitted inline on an already-started stream.
    #[must_use]
    pub fn stream_token(&self) -> String {
        let category = match self {
            RouterError::AuthRequired | RouterError::ModelNotAllowed { .. } => "auth_error",
            RouterError::RateLimited(_) | RouterError::QuotaExceeded(_) => "rate_limited",
            RouterError::Timeout(_) => "timeout",
            RouterError::BlockedByPolicy(_) => "blocked_by_policy",
            RouterError::InvalidRequest(_)
            | RouterError::EmptyPrompt
            | RouterError::UnsupportedMediaType => "client_error",
            _ => "downstream_error",
        };
        format!("[error:{category}]")
    }

    /// Whether the router may try the opposite vendor after this failure.
    ///
    /// Provider 4xx responses never trigger fallback; only transient classes
    /// (timeout, 5xx, network, rate limiting) may.
    #[must_use]
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            RouterError::Timeout(_)
                | RouterError::VendorUnavailable(_)
                | RouterError::Downstream(_)
                | RouterError::RateLimited(_)
        )
    }

    /// Format the JSON error body returned on non-streaming responses.
    #[must_use]
    pub fn detail_body(&self) -> serde_json::Value {
        match self {
            RouterError::ModelNotAllowed { model, vendor } => serde_json::json!({
                "detail": {
                    "error": "model_not_allowed",
                    "model": model,
                    "vendor": vendor,
                }
            }),
            RouterError::AllVendorsUnavailable => serde_json::json!({
                "detail": { "error": "all_vendors_unavailable" }
            }),
            other => serde_json::json!({ "detail": other.category() }),
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> axum::response::Response {
        let status = self.http_status();
        if matches!(self, RouterError::Cancelled) {
            // Client gone: no body.
            return status.into_response();
        }
        (status, axum::Json(self.detail_body())).into_response()
    }
}
