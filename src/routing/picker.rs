//! Deterministic model selection.
//!
//! Rules evaluate in a fixed order and the first match wins; the terminal
//! step swaps vendors on health or breaker signals when fallback is allowed.

use crate::config::AppConfig;
use crate::error::RouterError;
use crate::intent::{keyword_hit, Intent, HEAVY_PRIORITY};
use crate::policy::{vendor_for_override, RouterRules};
use crate::routing::{RouteReason, RoutingDecision, Vendor};

const RAG_LONG_CONTEXT_CHAR_FALLBACK: usize = 5_000;

/// Caller-visible availability for one vendor: probe health combined with
/// the global circuit state.
#[derive(Debug, Clone, Copy)]
pub struct VendorAvailability {
    pub healthy: bool,
    pub cb_open: bool,
}

impl VendorAvailability {
    #[must_use]
    pub fn available(self) -> bool {
        self.healthy && !self.cb_open
    }
}

/// Availability snapshot for both vendors at pick time.
#[derive(Debug, Clone, Copy)]
pub struct AvailabilityView {
    pub primary: VendorAvailability,
    pub secondary: VendorAvailability,
}

impl AvailabilityView {
    #[must_use]
    pub fn vendor(&self, vendor: Vendor) -> VendorAvailability {
        match vendor {
            Vendor::Primary => self.primary,
            Vendor::Secondary => self.secondary,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn all_available() -> Self {
        let up = VendorAvailability {
            healthy: true,
            cb_open: false,
        };
        Self {
            primary: up,
            secondary: up,
        }
    }
}

/// Model names resolved from configuration for both vendors.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub primary_baseline: String,
    pub primary_mid: String,
    pub primary_heavy: String,
    pub secondary_default: String,
}

impl ModelCatalog {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            primary_baseline: config.primary.models.baseline.clone(),
            primary_mid: config.primary.models.mid().to_string(),
            primary_heavy: config.primary.models.heavy().to_string(),
            secondary_default: config.secondary.models.baseline.clone(),
        }
    }

    /// The default model used when falling over to `vendor`.
    #[must_use]
    pub fn fallback_model(&self, vendor: Vendor) -> &str {
        match vendor {
            Vendor::Primary => &self.primary_mid,
            Vendor::Secondary => &self.secondary_default,
        }
    }
}

/// Everything the picker needs about one request.
#[derive(Debug, Clone)]
pub struct PickInput<'a> {
    pub prompt: &'a str,
    pub intent: Intent,
    /// Classifier priority for `intent`; [`HEAVY_PRIORITY`] routes heavy.
    pub priority: u8,
    pub tokens: usize,
    pub override_model: Option<&'a str>,
    pub stream: bool,
    pub request_id: &'a str,
    pub attachments_count: usize,
    pub retrieved_docs: &'a [String],
    pub ops_files_count: Option<usize>,
    pub user_cb_open: bool,
}

/// Produce a routing decision from prompt features, overrides, and health.
///
/// # Errors
///
/// - [`RouterError::ModelNotAllowed`] when an override fails the allow-list.
/// - [`RouterError::InvalidRequest`] when an override matches no known vendor.
/// - [`RouterError::VendorUnavailable`] when the only permitted vendor is down.
/// - [`RouterError::AllVendorsUnavailable`] when neither vendor can serve.
pub fn pick(
    input: &PickInput<'_>,
    rules: &RouterRules,
    catalog: &ModelCatalog,
    availability: &AvailabilityView,
) -> Result<RoutingDecision, RouterError> {
    if let Some(override_model) = input.override_model {
        return pick_with_override(input, override_model, rules, catalog, availability);
    }

    let (vendor, model, reason, hit) = heuristic_choice(input, rules, catalog);
    let decision = RoutingDecision {
        vendor,
        model: model.to_string(),
        reason,
        keyword_hit: hit.map(str::to_string),
        stream: input.stream,
        allow_fallback: true,
        request_id: input.request_id.to_string(),
    };
    finalize(decision, input, catalog, availability)
}

fn pick_with_override(
    input: &PickInput<'_>,
    override_model: &str,
    rules: &RouterRules,
    catalog: &ModelCatalog,
    availability: &AvailabilityView,
) -> Result<RoutingDecision, RouterError> {
    let Some(vendor) = vendor_for_override(override_model) else {
        return Err(RouterError::InvalidRequest(format!(
            "unknown model '{override_model}'"
        )));
    };
    rules.validate_model(override_model, vendor)?;

    let mut decision = RoutingDecision {
        vendor,
        model: override_model.to_string(),
        reason: RouteReason::ExplicitOverride,
        keyword_hit: None,
        stream: input.stream,
        allow_fallback: true,
        request_id: input.request_id.to_string(),
    };

    if !availability.vendor(vendor).available() {
        let target = vendor.opposite();
        decision = decision.fallback(
            catalog.fallback_model(target),
            RouteReason::fallback_health(vendor),
        );
        rules.validate_model(&decision.model, decision.vendor)?;
        if !availability.vendor(decision.vendor).available() {
            return Err(RouterError::AllVendorsUnavailable);
        }
        tracing::info!(
            from = %vendor,
            to = %decision.vendor,
            model = %decision.model,
            "override vendor unhealthy, routed to fallback"
        );
        return Ok(decision);
    }

    finalize(decision, input, catalog, availability)
}

/// Heuristic rules evaluated in order; first match wins.
fn heuristic_choice<'a>(
    input: &PickInput<'_>,
    rules: &'a RouterRules,
    catalog: &'a ModelCatalog,
) -> (Vendor, &'a str, RouteReason, Option<&'a str>) {
    let words = input.prompt.split_whitespace().count();
    if words > rules.heavy_word_count || input.tokens > rules.heavy_tokens {
        return (
            Vendor::Primary,
            &catalog.primary_heavy,
            RouteReason::HeavyLength,
            None,
        );
    }

    if let Some(hit) = keyword_hit(input.prompt, &rules.keywords) {
        return (
            Vendor::Primary,
            &catalog.primary_heavy,
            RouteReason::Keyword,
            Some(hit),
        );
    }

    if rules.is_heavy_intent(input.intent) || input.priority >= HEAVY_PRIORITY {
        return (
            Vendor::Primary,
            &catalog.primary_heavy,
            RouteReason::HeavyIntent,
            None,
        );
    }

    if input.attachments_count > 0 {
        return (
            Vendor::Primary,
            &catalog.primary_mid,
            RouteReason::Attachments,
            None,
        );
    }

    if long_retrieved_context(input.retrieved_docs, rules) {
        return (
            Vendor::Primary,
            &catalog.primary_mid,
            RouteReason::LongContext,
            None,
        );
    }

    if input.intent == Intent::Ops {
        let files = input.ops_files_count.unwrap_or(0);
        if files <= rules.ops_max_files_simple {
            return (
                Vendor::Primary,
                &catalog.primary_baseline,
                RouteReason::OpsSimple,
                None,
            );
        }
        return (
            Vendor::Primary,
            &catalog.primary_mid,
            RouteReason::OpsComplex,
            None,
        );
    }

    (
        Vendor::Secondary,
        &catalog.secondary_default,
        RouteReason::LightDefault,
        None,
    )
}

fn long_retrieved_context(docs: &[String], rules: &RouterRules) -> bool {
    if docs.is_empty() {
        return false;
    }
    let rag_tokens: usize = docs.iter().map(|d| crate::intent::count_tokens(d)).sum();
    let approx: usize = docs.iter().map(|d| (d.len() / 4).max(1)).sum();
    if rag_tokens.max(approx) > rules.rag_long_context_threshold {
        return true;
    }
    let char_total: usize = docs.iter().map(String::len).sum();
    char_total > RAG_LONG_CONTEXT_CHAR_FALLBACK
}

/// Terminal availability check: swap to the opposite vendor's default when
/// the chosen one cannot serve and fallback is allowed.
fn finalize(
    decision: RoutingDecision,
    input: &PickInput<'_>,
    catalog: &ModelCatalog,
    availability: &AvailabilityView,
) -> Result<RoutingDecision, RouterError> {
    let chosen_unavailable = !availability.vendor(decision.vendor).available();
    let user_gated = decision.vendor == Vendor::Secondary && input.user_cb_open;

    if !chosen_unavailable && !user_gated {
        return Ok(decision);
    }

    if !decision.allow_fallback {
        return Err(RouterError::VendorUnavailable(
            decision.vendor.as_str().to_string(),
        ));
    }

    let target = decision.vendor.opposite();
    if !availability.vendor(target).available() {
        if chosen_unavailable {
            return Err(RouterError::AllVendorsUnavailable);
        }
        return Err(RouterError::VendorUnavailable(target.as_str().to_string()));
    }

    let reason = if chosen_unavailable {
        RouteReason::fallback_health(decision.vendor)
    } else {
        RouteReason::fallback_to(target)
    };
    let swapped = decision.fallback(catalog.fallback_model(target), reason);
    tracing::info!(
        from = %decision.vendor,
        to = %swapped.vendor,
        reason = %swapped.reason,
        user_cb = user_gated,
        "vendor unavailable, routed to fallback"
    );
    Ok(swapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            primary_baseline: "gpt-4o-mini".to_string(),
            primary_mid: "gpt-4o".to_string(),
            primary_heavy: "gpt-4o".to_string(),
            secondary_default: "llama3:latest".to_string(),
        }
    }

    fn base_input<'a>(prompt: &'a str) -> PickInput<'a> {
        PickInput {
            prompt,
            intent: Intent::Chat,
            priority: 0,
            tokens: crate::intent::count_tokens(prompt),
            override_model: None,
            stream: false,
            request_id: "rid",
            attachments_count: 0,
            retrieved_docs: &[],
            ops_files_count: None,
            user_cb_open: false,
        }
    }

    fn availability(primary: bool, secondary: bool) -> AvailabilityView {
        AvailabilityView {
            primary: VendorAvailability {
                healthy: primary,
                cb_open: false,
            },
            secondary: VendorAvailability {
                healthy: secondary,
                cb_open: false,
            },
        }
    }

    #[test]
    fn light_default_routes_to_secondary() {
        let rules = RouterRules::from_env();
        let decision = pick(
            &base_input("hi"),
            &rules,
            &catalog(),
            &AvailabilityView::all_available(),
        )
        .unwrap();
        assert_eq!(decision.vendor, Vendor::Secondary);
        assert_eq!(decision.model, "llama3:latest");
        assert_eq!(decision.reason, RouteReason::LightDefault);
    }

    #[test]
    fn override_allowed_and_healthy() {
        let rules = RouterRules::from_env();
        let mut input = base_input("ping");
        input.override_model = Some("gpt-4o");
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.model, "gpt-4o");
        assert_eq!(decision.reason, RouteReason::ExplicitOverride);
    }

    #[test]
    fn override_disallowed_fails_closed() {
        let rules = RouterRules::from_env();
        let mut input = base_input("x");
        input.override_model = Some("gpt-forbidden");
        let err = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap_err();
        assert_eq!(err.category(), "model_not_allowed");
    }

    #[test]
    fn override_unknown_vendor_is_invalid_request() {
        let rules = RouterRules::from_env();
        let mut input = base_input("x");
        input.override_model = Some("claude-3");
        let err = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap_err();
        assert_eq!(err.category(), "invalid_request");
    }

    #[test]
    fn override_unhealthy_vendor_downgrades() {
        let rules = RouterRules::from_env();
        let mut input = base_input("x");
        input.override_model = Some("llama3");
        let decision = pick(&input, &rules, &catalog(), &availability(true, false)).unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.reason, RouteReason::FallbackSecondaryHealth);
        assert!(!decision.allow_fallback);
    }

    #[test]
    fn heavy_length_routes_primary_heavy() {
        let rules = RouterRules::from_env();
        let long_prompt = "word ".repeat(64);
        let decision = pick(
            &base_input(&long_prompt),
            &rules,
            &catalog(),
            &AvailabilityView::all_available(),
        )
        .unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.reason, RouteReason::HeavyLength);
    }

    #[test]
    fn keyword_routes_primary_heavy_with_hit() {
        let rules = RouterRules::from_env();
        let decision = pick(
            &base_input("please explain this to me"),
            &rules,
            &catalog(),
            &AvailabilityView::all_available(),
        )
        .unwrap();
        assert_eq!(decision.reason, RouteReason::Keyword);
        assert_eq!(decision.keyword_hit.as_deref(), Some("explain"));
    }

    #[test]
    fn heavy_intent_routes_primary_heavy() {
        let rules = RouterRules::from_env();
        let mut input = base_input("short one");
        input.intent = Intent::Research;
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::HeavyIntent);
        assert_eq!(decision.vendor, Vendor::Primary);
    }

    #[test]
    fn heavy_priority_routes_primary_heavy() {
        let rules = RouterRules::from_env();
        let mut input = base_input("short one");
        input.priority = HEAVY_PRIORITY;
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::HeavyIntent);
        assert_eq!(decision.model, "gpt-4o");
    }

    #[test]
    fn attachments_route_primary_mid() {
        let rules = RouterRules::from_env();
        let mut input = base_input("look at this");
        input.attachments_count = 2;
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::Attachments);
        assert_eq!(decision.model, "gpt-4o");
    }

    #[test]
    fn long_context_routes_primary_mid() {
        let rules = RouterRules::from_env();
        let docs = vec!["doc content ".repeat(600)];
        let mut input = base_input("short question");
        input.retrieved_docs = &docs;
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::LongContext);
    }

    #[test]
    fn ops_simple_vs_complex() {
        let rules = RouterRules::from_env();
        let mut input = base_input("tidy up");
        input.intent = Intent::Ops;
        input.ops_files_count = Some(1);
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::OpsSimple);
        assert_eq!(decision.model, "gpt-4o-mini");

        input.ops_files_count = Some(9);
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.reason, RouteReason::OpsComplex);
        assert_eq!(decision.model, "gpt-4o");
    }

    #[test]
    fn secondary_unhealthy_falls_back_to_primary() {
        let rules = RouterRules::from_env();
        let decision = pick(
            &base_input("hi"),
            &rules,
            &catalog(),
            &availability(true, false),
        )
        .unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.reason, RouteReason::FallbackSecondaryHealth);
        assert!(!decision.allow_fallback);
    }

    #[test]
    fn both_unavailable_is_terminal() {
        let rules = RouterRules::from_env();
        let err = pick(
            &base_input("hi"),
            &rules,
            &catalog(),
            &availability(false, false),
        )
        .unwrap_err();
        assert_eq!(err.category(), "all_vendors_unavailable");
    }

    #[test]
    fn user_breaker_swaps_secondary_to_primary() {
        let rules = RouterRules::from_env();
        let mut input = base_input("hi");
        input.user_cb_open = true;
        let decision = pick(&input, &rules, &catalog(), &AvailabilityView::all_available()).unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.reason, RouteReason::FallbackPrimary);
    }

    #[test]
    fn global_breaker_counts_as_unavailable() {
        let rules = RouterRules::from_env();
        let view = AvailabilityView {
            primary: VendorAvailability {
                healthy: true,
                cb_open: false,
            },
            secondary: VendorAvailability {
                healthy: true,
                cb_open: true,
            },
        };
        let decision = pick(&base_input("hi"), &rules, &catalog(), &view).unwrap();
        assert_eq!(decision.vendor, Vendor::Primary);
        assert_eq!(decision.reason, RouteReason::FallbackSecondaryHealth);
    }
}
