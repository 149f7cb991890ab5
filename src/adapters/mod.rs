//! Uniform call surface over the two vendor backends.
//!
//! Adapters own their HTTP client and a counting semaphore bounding
//! concurrent streams. Upstream failures are normalized into a closed error
//! set; only the router decides what falls back.

pub mod ollama;
pub mod openai;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RouterError;
use crate::routing::Vendor;

pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 1_000;

/// Generation options forwarded from the client payload.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct GenOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Standardized request to any vendor backend.
#[derive(Debug)]
pub struct VendorRequest {
    pub prompt: String,
    pub model: String,
    pub system: Option<String>,
    pub stream: bool,
    /// When streaming, every decoded chunk is sent here as received; the
    /// adapter still accumulates and returns the full text.
    pub token_tx: Option<mpsc::Sender<String>>,
    /// Deadline for the whole call, already bounded by the request budget.
    pub timeout: Duration,
    pub gen_opts: GenOptions,
}

/// Standardized response from any vendor backend.
#[derive(Debug, Clone, Default)]
pub struct VendorResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// Closed set of normalized upstream failures.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("upstream call timed out")]
    Timeout,
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("provider 4xx ({status}): {message}")]
    Provider4xx { status: u16, message: String },
    #[error("provider 5xx ({status}): {message}")]
    Provider5xx { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("unknown upstream error: {0}")]
    Unknown(String),
}

impl AdapterError {
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            AdapterError::Timeout => "timeout",
            AdapterError::RateLimited(_) => "rate_limited",
            AdapterError::QuotaExceeded(_) => "quota_exceeded",
            AdapterError::Provider4xx { .. } => "provider_4xx",
            AdapterError::Provider5xx { .. } => "provider_5xx",
            AdapterError::Network(_) => "network",
            AdapterError::Cancelled => "cancelled",
            AdapterError::Unknown(_) => "unknown",
        }
    }

    /// Whether the router may try the opposite vendor once after this.
    /// Provider 4xx (including 429) never falls back.
    #[must_use]
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout | AdapterError::Provider5xx { .. } | AdapterError::Network(_)
        )
    }

    /// Whether a bounded in-adapter retry of the same upstream is worthwhile.
    #[must_use]
    pub fn is_transient_transport(&self) -> bool {
        match self {
            AdapterError::Network(message) => should_retry_transport_message(message),
            _ => false,
        }
    }

    #[must_use]
    pub fn into_router_error(self, vendor: Vendor) -> RouterError {
        match self {
            AdapterError::Timeout => RouterError::Timeout(vendor.as_str().to_string()),
            AdapterError::RateLimited(message) => RouterError::RateLimited(message),
            AdapterError::QuotaExceeded(message) => RouterError::QuotaExceeded(message),
            AdapterError::Provider4xx { status, message } => {
                RouterError::InvalidRequest(format!("{vendor} rejected the request ({status}): {message}"))
            }
            AdapterError::Provider5xx { status, message } => {
                RouterError::Downstream(format!("{vendor} failed ({status}): {message}"))
            }
            AdapterError::Network(message) => {
                RouterError::VendorUnavailable(format!("{vendor}: {message}"))
            }
            AdapterError::Cancelled => RouterError::Cancelled,
            AdapterError::Unknown(message) => RouterError::Downstream(message),
        }
    }
}

/// Uniform adapter seam; the composition root wires concrete adapters in at
/// startup so the router never names a vendor SDK.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Execute one call. Streaming requests deliver chunks through
    /// `request.token_tx` as they arrive and still return the full text.
    /// The call observes `cancel` and `request.timeout` cooperatively.
    async fn call(
        &self,
        request: VendorRequest,
        cancel: &CancellationToken,
    ) -> Result<VendorResponse, AdapterError>;

    /// Minimal health probe; never counts against the circuit breakers.
    async fn probe(&self, timeout: Duration) -> Result<(), String>;
}

/// Build the shared HTTP client used by both adapters.
#[must_use]
pub fn build_http_client(pool_max_idle_per_host: usize) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(15))
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to build configured HTTP client, falling back to defaults");
            reqwest::Client::new()
        })
}

/// Normalize a reqwest transport error.
pub(crate) fn normalize_transport_error(err: &reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        return AdapterError::Timeout;
    }
    if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
        return AdapterError::Network(err.to_string());
    }
    AdapterError::Unknown(err.to_string())
}

/// Normalize an upstream HTTP status plus body excerpt.
pub(crate) fn normalize_status_error(status: u16, body: &str) -> AdapterError {
    let message = body.chars().take(200).collect::<String>();
    match status {
        429 => {
            if message.to_lowercase().contains("quota") {
                AdapterError::QuotaExceeded(message)
            } else {
                AdapterError::RateLimited(message)
            }
        }
        402 => AdapterError::QuotaExceeded(message),
        400..=499 => AdapterError::Provider4xx { status, message },
        500..=599 => AdapterError::Provider5xx { status, message },
        _ => AdapterError::Unknown(format!("unexpected status {status}: {message}")),
    }
}

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&str; 8] = [
        "timed out",
        "timeout",
        "connection reset",
        "connection aborted",
        "broken pipe",
        "connection refused",
        "unexpected eof",
        "stream closed",
    ];
    let lowered = message.to_lowercase();
    NEEDLES.iter().any(|needle| lowered.contains(needle))
}

#[inline]
pub(crate) fn retry_backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(10);
    let multiplier = 1_u64 << shift;
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// Whether another retry attempt fits before `deadline`.
#[inline]
pub(crate) fn retry_fits_deadline(started: Instant, timeout: Duration, attempt: u32) -> bool {
    attempt < RETRY_MAX_ATTEMPTS && started.elapsed() + retry_backoff_delay(attempt) < timeout
}
