use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::api::{ask, dry_explain, health, replay, stream};
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

enum RouteMatch<'a> {
    Health,
    Ask,
    DryExplain,
    AskStream,
    Replay { rid: &'a str },
    MethodNotAllowed,
    NotFound,
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    let response = match route {
        RouteMatch::Health => health::health_handler(&state).into_response(),
        RouteMatch::Ask => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            ask::handler(state, parts.headers, body_bytes).await
        }
        RouteMatch::DryExplain => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            dry_explain::handler(state, parts.headers, body_bytes).await
        }
        RouteMatch::AskStream => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            stream::handler(state, parts.headers, body_bytes).await
        }
        RouteMatch::Replay { rid } => replay::handler(state, parts.headers, rid).await,
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large (max 2MiB)",
            )
                .into_response()
        })
}

fn match_route<'a>(method: &Method, path: &'a str, base_path: &str) -> RouteMatch<'a> {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    match path {
        "/" => {
            if method == Method::GET {
                RouteMatch::Health
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/ask" => {
            if method == Method::POST {
                RouteMatch::Ask
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/ask/dry-explain" => {
            if method == Method::POST {
                RouteMatch::DryExplain
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        "/v1/ask/stream" => {
            if method == Method::POST {
                RouteMatch::AskStream
            } else {
                RouteMatch::MethodNotAllowed
            }
        }
        _ => {
            if let Some(rid) = path.strip_prefix("/v1/ask/replay/") {
                if rid.is_empty() || rid.contains('/') {
                    return RouteMatch::NotFound;
                }
                if method == Method::GET {
                    return RouteMatch::Replay { rid };
                }
                return RouteMatch::MethodNotAllowed;
            }
            RouteMatch::NotFound
        }
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }
    let stripped = path.strip_prefix(base_path)?;
    if stripped.is_empty() {
        return Some("/");
    }
    if stripped.starts_with('/') {
        return Some(stripped);
    }
    None
}
