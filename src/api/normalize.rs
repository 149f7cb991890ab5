//! Liberal payload normalization for the ask family of routes.
//!
//! Accepts the canonical `prompt: string`, chat-style `prompt: [{role,
//! content}]`, nested `{input: {...}}`, and the legacy aliases
//! (`model_override`, `message`, `text`, `query`, `q`, `input.prompt`,
//! `input.text`, `input.messages`). Normalization is idempotent: feeding a
//! normalized prompt back through yields the same text.

use serde_json::Value;

use crate::adapters::GenOptions;
use crate::error::RouterError;
use crate::routing::PromptShape;

const PROMPT_ALIASES: &[&str] = &["message", "text", "query", "q"];
const NESTED_PROMPT_KEYS: &[&str] = &["prompt", "text", "message"];

/// The canonical request extracted from a raw JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAsk {
    pub prompt: String,
    pub override_model: Option<String>,
    pub stream_flag: bool,
    pub stream_explicit: bool,
    pub gen_opts: GenOptions,
    pub shape: PromptShape,
    pub normalized_from: Option<&'static str>,
}

/// Normalize a raw request body.
///
/// # Errors
///
/// - [`RouterError::InvalidRequest`] when the body is not a JSON object.
/// - [`RouterError::EmptyPrompt`] when no non-blank prompt can be extracted.
pub fn normalize_payload(raw: &Value) -> Result<NormalizedAsk, RouterError> {
    let Some(object) = raw.as_object() else {
        return Err(RouterError::InvalidRequest(
            "request body must be a JSON object".to_string(),
        ));
    };

    let (shape, normalized_from) = detect_shape(object);

    let override_model = object
        .get("model")
        .or_else(|| object.get("model_override"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let stream_explicit = object.contains_key("stream");
    let stream_flag = object
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let prompt = extract_prompt(object).ok_or(RouterError::EmptyPrompt)?;

    Ok(NormalizedAsk {
        prompt,
        override_model,
        stream_flag,
        stream_explicit,
        gen_opts: extract_gen_opts(object),
        shape,
        normalized_from,
    })
}

fn detect_shape(
    object: &serde_json::Map<String, Value>,
) -> (PromptShape, Option<&'static str>) {
    if object.get("prompt").is_some_and(Value::is_array) {
        return (PromptShape::Chat, Some("prompt_list"));
    }
    if object.get("input").is_some_and(Value::is_object) {
        return (PromptShape::Nested, Some("input_nested"));
    }
    if object.get("messages").is_some_and(Value::is_array) {
        return (PromptShape::Chat, Some("messages_list"));
    }
    (PromptShape::Text, None)
}

fn extract_prompt(object: &serde_json::Map<String, Value>) -> Option<String> {
    let mut candidate = object.get("prompt").cloned();

    // `prompt: {text|content}` object form.
    if let Some(Value::Object(inner)) = &candidate {
        candidate = inner.get("text").or_else(|| inner.get("content")).cloned();
    }

    // Top-level string aliases.
    if candidate.is_none() {
        candidate = PROMPT_ALIASES
            .iter()
            .find_map(|key| object.get(*key).filter(|v| v.is_string()).cloned());
    }

    // Nested input object: string keys first, then messages.
    if candidate.is_none() {
        if let Some(Value::Object(inner)) = object.get("input") {
            candidate = NESTED_PROMPT_KEYS
                .iter()
                .find_map(|key| inner.get(*key).filter(|v| v.is_string()).cloned());
            if candidate.is_none() {
                candidate = inner.get("messages").filter(|v| v.is_array()).cloned();
            }
        }
    }

    // Top-level messages list.
    if candidate.is_none() {
        candidate = object.get("messages").filter(|v| v.is_array()).cloned();
    }

    let text = match candidate? {
        Value::String(text) => text,
        Value::Array(messages) => join_message_contents(&messages)?,
        _ => return None,
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn join_message_contents(messages: &[Value]) -> Option<String> {
    let mut parts = Vec::new();
    for message in messages {
        let Some(content) = message.get("content").and_then(Value::as_str) else {
            continue;
        };
        let trimmed = content.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("\n"))
}

fn extract_gen_opts(object: &serde_json::Map<String, Value>) -> GenOptions {
    GenOptions {
        temperature: object.get("temperature").and_then(Value::as_f64),
        top_p: object.get("top_p").and_then(Value::as_f64),
        max_tokens: object.get("max_tokens").and_then(Value::as_u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_prompt() {
        let normalized = normalize_payload(&json!({"prompt": "hello"})).unwrap();
        assert_eq!(normalized.prompt, "hello");
        assert_eq!(normalized.shape, PromptShape::Text);
        assert!(normalized.normalized_from.is_none());
        assert!(!normalized.stream_explicit);
    }

    #[test]
    fn chat_prompt_list() {
        let normalized = normalize_payload(&json!({
            "prompt": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ]
        }))
        .unwrap();
        assert_eq!(normalized.prompt, "be brief\nhello");
        assert_eq!(normalized.shape, PromptShape::Chat);
        assert_eq!(normalized.normalized_from, Some("prompt_list"));
    }

    #[test]
    fn nested_input_prompt() {
        let normalized =
            normalize_payload(&json!({"input": {"prompt": "from input"}})).unwrap();
        assert_eq!(normalized.prompt, "from input");
        assert_eq!(normalized.shape, PromptShape::Nested);
        assert_eq!(normalized.normalized_from, Some("input_nested"));
    }

    #[test]
    fn nested_input_messages() {
        let normalized = normalize_payload(&json!({
            "input": {"messages": [{"role": "user", "content": "nested msg"}]}
        }))
        .unwrap();
        assert_eq!(normalized.prompt, "nested msg");
    }

    #[test]
    fn top_level_aliases() {
        for key in ["message", "text", "query", "q"] {
            let normalized = normalize_payload(&json!({key: "aliased"})).unwrap();
            assert_eq!(normalized.prompt, "aliased", "alias {key}");
        }
    }

    #[test]
    fn prompt_object_text_form() {
        let normalized = normalize_payload(&json!({"prompt": {"text": "obj text"}})).unwrap();
        assert_eq!(normalized.prompt, "obj text");
    }

    #[test]
    fn model_override_alias() {
        let normalized =
            normalize_payload(&json!({"prompt": "x", "model_override": "llama3"})).unwrap();
        assert_eq!(normalized.override_model.as_deref(), Some("llama3"));
        // canonical key wins over the alias
        let normalized = normalize_payload(
            &json!({"prompt": "x", "model": "gpt-4o", "model_override": "llama3"}),
        )
        .unwrap();
        assert_eq!(normalized.override_model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn empty_prompt_rejected() {
        for body in [json!({}), json!({"prompt": "   "}), json!({"prompt": []})] {
            let err = normalize_payload(&body).unwrap_err();
            assert_eq!(err.category(), "empty_prompt");
        }
    }

    #[test]
    fn non_object_rejected() {
        let err = normalize_payload(&json!("just a string")).unwrap_err();
        assert_eq!(err.category(), "invalid_request");
    }

    #[test]
    fn gen_opts_forwarded() {
        let normalized = normalize_payload(&json!({
            "prompt": "x", "temperature": 0.5, "top_p": 0.9, "max_tokens": 256
        }))
        .unwrap();
        assert_eq!(normalized.gen_opts.temperature, Some(0.5));
        assert_eq!(normalized.gen_opts.top_p, Some(0.9));
        assert_eq!(normalized.gen_opts.max_tokens, Some(256));
    }

    #[test]
    fn stream_flag_and_explicitness() {
        let normalized = normalize_payload(&json!({"prompt": "x", "stream": true})).unwrap();
        assert!(normalized.stream_flag);
        assert!(normalized.stream_explicit);
        let normalized = normalize_payload(&json!({"prompt": "x", "stream": false})).unwrap();
        assert!(!normalized.stream_flag);
        assert!(normalized.stream_explicit);
    }

    #[test]
    fn normalization_is_idempotent() {
        let first = normalize_payload(&json!({
            "prompt": [{"role": "user", "content": "  hello there  "}]
        }))
        .unwrap();
        let second = normalize_payload(&json!({"prompt": first.prompt})).unwrap();
        assert_eq!(first.prompt, second.prompt);
    }
}
