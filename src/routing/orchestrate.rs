//! Request execution: one adapter call, at most one vendor fallback, at most
//! one self-check escalation, with every deadline derived from the request
//! budget.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterError, GenOptions, VendorRequest, VendorResponse};
use crate::error::RouterError;
use crate::policy::RouterRules;
use crate::routing::budget::adapter_deadline;
use crate::routing::{RequestContext, RouteReason, RoutingDecision, Vendor};
use crate::selfcheck::{escalation_allowed, score_response};
use crate::state::AppState;

/// Inputs for executing an already-made routing decision.
pub struct ExecuteParams {
    pub system: Option<String>,
    pub gen_opts: GenOptions,
    pub retrieved_docs: Vec<String>,
    /// When present the adapter streams decoded chunks here as received.
    pub token_tx: Option<mpsc::Sender<String>>,
    pub cancel: CancellationToken,
}

/// Terminal result of executing a decision.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub text: String,
    pub final_vendor: Vendor,
    pub final_model: String,
    pub used_fallback: bool,
    pub fallback_reason: Option<RouteReason>,
    pub self_check_score: Option<f64>,
    pub escalated: bool,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

#[must_use]
pub fn vendor_timeout_ms(rules: &RouterRules, vendor: Vendor) -> u64 {
    match vendor {
        Vendor::Primary => rules.primary_timeout_ms,
        Vendor::Secondary => rules.secondary_timeout_ms,
    }
}

/// Execute `decision`, applying the fallback and self-check policies.
///
/// # Errors
///
/// Returns the normalized terminal error when the call (and its single
/// permitted fallback) cannot produce a response.
pub async fn execute_decision(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    decision: &RoutingDecision,
    prompt: &str,
    params: &ExecuteParams,
) -> Result<ExecutionOutcome, RouterError> {
    let rules = state.rules();

    let first = call_vendor(state, ctx, &rules, decision.vendor, &decision.model, prompt, params)
        .await;
    state.record_vendor_outcome(decision.vendor, &ctx.user_id, &rules, &first);

    let (response, vendor, model, used_fallback, fallback_reason) = match first {
        Ok(response) => (response, decision.vendor, decision.model.clone(), false, None),
        Err(AdapterError::Cancelled) => return Err(RouterError::Cancelled),
        Err(err) => {
            if !(err.allows_fallback() && decision.allow_fallback) {
                return Err(err.into_router_error(decision.vendor));
            }
            let target = decision.vendor.opposite();
            if !state.availability_view().vendor(target).available() {
                tracing::warn!(rid = %ctx.request_id, from = %decision.vendor, "fallback target unavailable");
                return Err(RouterError::AllVendorsUnavailable);
            }
            let reason = RouteReason::fallback_to(target);
            let fallback = decision.fallback(state.catalog().fallback_model(target), reason);
            tracing::info!(
                rid = %ctx.request_id,
                from = %decision.vendor,
                to = %target,
                error = err.category(),
                "transient vendor failure, trying opposite vendor once"
            );
            let second = call_vendor(
                state,
                ctx,
                &rules,
                fallback.vendor,
                &fallback.model,
                prompt,
                params,
            )
            .await;
            state.record_vendor_outcome(fallback.vendor, &ctx.user_id, &rules, &second);
            match second {
                Ok(response) => (response, fallback.vendor, fallback.model, true, Some(reason)),
                Err(AdapterError::Cancelled) => return Err(RouterError::Cancelled),
                Err(second_err) => return Err(second_err.into_router_error(fallback.vendor)),
            }
        }
    };

    let mut outcome = ExecutionOutcome {
        text: response.text,
        final_vendor: vendor,
        final_model: model,
        used_fallback,
        fallback_reason,
        self_check_score: None,
        escalated: false,
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
        cost: response.cost,
    };

    let score = score_response(&outcome.text, &params.retrieved_docs, ctx.intent, &rules);
    outcome.self_check_score = Some(score);

    if should_escalate(&outcome, score, &rules, state, params) {
        escalate(state, ctx, &rules, prompt, params, &mut outcome).await;
    }

    Ok(outcome)
}

/// Escalation preconditions: failed score, retries permitted, quota intact,
/// a stronger model to go to, budget left, and a non-streaming response
/// (stream tokens are already on the wire).
fn should_escalate(
    outcome: &ExecutionOutcome,
    score: f64,
    rules: &RouterRules,
    state: &Arc<AppState>,
    params: &ExecuteParams,
) -> bool {
    if score >= rules.self_check_fail_threshold || !escalation_allowed(rules) {
        return false;
    }
    if params.token_tx.is_some() {
        return false;
    }
    let heavy = &state.catalog().primary_heavy;
    if outcome.final_vendor == Vendor::Primary && &outcome.final_model == heavy {
        return false;
    }
    state.availability_view().primary.available()
}

/// One escalation attempt to the primary heavy model. Best-effort: a failed
/// escalation keeps the original response.
async fn escalate(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    rules: &Arc<RouterRules>,
    prompt: &str,
    params: &ExecuteParams,
    outcome: &mut ExecutionOutcome,
) {
    let heavy = state.catalog().primary_heavy.clone();
    tracing::info!(
        rid = %ctx.request_id,
        score = outcome.self_check_score.unwrap_or(0.0),
        model = %heavy,
        "self-check below threshold, escalating once"
    );
    let result =
        call_vendor(state, ctx, rules, Vendor::Primary, &heavy, prompt, params).await;
    state.record_vendor_outcome(Vendor::Primary, &ctx.user_id, rules, &result);
    let Ok(response) = result else {
        tracing::warn!(rid = %ctx.request_id, "escalation call failed, keeping original response");
        return;
    };
    let new_score = score_response(&response.text, &params.retrieved_docs, ctx.intent, rules);
    outcome.text = response.text;
    outcome.final_vendor = Vendor::Primary;
    outcome.final_model = heavy;
    outcome.escalated = true;
    outcome.self_check_score = Some(new_score);
    outcome.prompt_tokens = outcome.prompt_tokens.saturating_add(response.prompt_tokens);
    outcome.completion_tokens = outcome
        .completion_tokens
        .saturating_add(response.completion_tokens);
    outcome.cost += response.cost;
}

async fn call_vendor(
    state: &Arc<AppState>,
    ctx: &RequestContext,
    rules: &Arc<RouterRules>,
    vendor: Vendor,
    model: &str,
    prompt: &str,
    params: &ExecuteParams,
) -> Result<VendorResponse, AdapterError> {
    let deadline = adapter_deadline(ctx.start, ctx.budget_ms, vendor_timeout_ms(rules, vendor));
    if deadline.is_zero() {
        return Err(AdapterError::Timeout);
    }
    let request = VendorRequest {
        prompt: prompt.to_string(),
        model: model.to_string(),
        system: params.system.clone(),
        stream: params.token_tx.is_some(),
        token_tx: params.token_tx.clone(),
        timeout: deadline,
        gen_opts: params.gen_opts,
    };
    state.adapter(vendor).call(request, &params.cancel).await
}
