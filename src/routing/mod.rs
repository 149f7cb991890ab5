pub mod budget;
pub mod dispatch;
pub mod orchestrate;
pub mod picker;

use std::time::Instant;

use serde::Serialize;

use crate::intent::Intent;

/// The two modeled vendor classes: a hosted remote API and a local
/// self-hosted model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Primary,
    Secondary,
}

impl Vendor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Primary => "primary",
            Vendor::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn opposite(self) -> Vendor {
        match self {
            Vendor::Primary => Vendor::Secondary,
            Vendor::Secondary => Vendor::Primary,
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the picker chose a (vendor, model) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    ExplicitOverride,
    HeavyLength,
    Keyword,
    HeavyIntent,
    Attachments,
    LongContext,
    OpsSimple,
    OpsComplex,
    LightDefault,
    FallbackPrimaryHealth,
    FallbackSecondaryHealth,
    FallbackPrimary,
    FallbackSecondary,
    SelfCheckEscalation,
    CacheHit,
}

impl RouteReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RouteReason::ExplicitOverride => "explicit_override",
            RouteReason::HeavyLength => "heavy_length",
            RouteReason::Keyword => "keyword",
            RouteReason::HeavyIntent => "heavy_intent",
            RouteReason::Attachments => "attachments",
            RouteReason::LongContext => "long_context",
            RouteReason::OpsSimple => "ops_simple",
            RouteReason::OpsComplex => "ops_complex",
            RouteReason::LightDefault => "light_default",
            RouteReason::FallbackPrimaryHealth => "fallback_primary_health",
            RouteReason::FallbackSecondaryHealth => "fallback_secondary_health",
            RouteReason::FallbackPrimary => "fallback_primary",
            RouteReason::FallbackSecondary => "fallback_secondary",
            RouteReason::SelfCheckEscalation => "self_check_escalation",
            RouteReason::CacheHit => "cache_hit",
        }
    }

    /// Health-downgrade reason named after the vendor routed *away from*.
    #[must_use]
    pub fn fallback_health(unhealthy: Vendor) -> RouteReason {
        match unhealthy {
            Vendor::Primary => RouteReason::FallbackPrimaryHealth,
            Vendor::Secondary => RouteReason::FallbackSecondaryHealth,
        }
    }

    /// Runtime-failure fallback reason named after the vendor switched *to*.
    #[must_use]
    pub fn fallback_to(target: Vendor) -> RouteReason {
        match target {
            Vendor::Primary => RouteReason::FallbackPrimary,
            Vendor::Secondary => RouteReason::FallbackSecondary,
        }
    }
}

impl std::fmt::Display for RouteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable routing decision produced by the picker.
///
/// A decision may be replaced once by a fallback decision carrying
/// `allow_fallback = false`, which prevents recursion.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub vendor: Vendor,
    pub model: String,
    pub reason: RouteReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_hit: Option<String>,
    pub stream: bool,
    pub allow_fallback: bool,
    pub request_id: String,
}

impl RoutingDecision {
    /// Derive the single permitted fallback decision targeting the opposite
    /// vendor's default model.
    #[must_use]
    pub fn fallback(&self, fallback_model: &str, reason: RouteReason) -> RoutingDecision {
        RoutingDecision {
            vendor: self.vendor.opposite(),
            model: fallback_model.to_string(),
            reason,
            keyword_hit: self.keyword_hit.clone(),
            stream: self.stream,
            allow_fallback: false,
            request_id: self.request_id.clone(),
        }
    }
}

/// Payload shape observed at the entrypoint before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptShape {
    Text,
    Chat,
    Nested,
}

impl PromptShape {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PromptShape::Text => "text",
            PromptShape::Chat => "chat",
            PromptShape::Nested => "nested",
        }
    }
}

/// Per-request context created at entry and alive until response completion.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: String,
    pub path: &'static str,
    pub start: Instant,
    pub budget_ms: u64,
    pub intent: Intent,
    pub tokens_est: usize,
    pub shape: PromptShape,
    pub normalized_from: Option<&'static str>,
}

impl RequestContext {
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id == "anon"
    }
}
