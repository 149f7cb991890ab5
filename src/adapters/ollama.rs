//! Secondary vendor adapter: local Ollama-style generate API.
//!
//! The generate endpoint streams newline-delimited JSON objects; token text
//! rides in `response`, usage in `prompt_eval_count` / `eval_count`, and the
//! final object carries `done: true`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::intent::count_tokens;
use crate::routing::Vendor;

use super::{
    normalize_status_error, normalize_transport_error, retry_backoff_delay, retry_fits_deadline,
    AdapterError, VendorAdapter, VendorRequest, VendorResponse,
};

const DEFAULT_NUM_CTX: u32 = 2048;

pub struct OllamaAdapter {
    client: reqwest::Client,
    generate_url: String,
    streams: Semaphore,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, max_streams: usize) -> Self {
        Self {
            client,
            generate_url: format!("{}/api/generate", base_url.trim_end_matches('/')),
            streams: Semaphore::new(max_streams.max(1)),
        }
    }

    fn request_body(request: &VendorRequest) -> serde_json::Value {
        let mut options = serde_json::json!({ "num_ctx": DEFAULT_NUM_CTX });
        if let Some(temperature) = request.gen_opts.temperature {
            options["temperature"] = temperature.into();
        }
        if let Some(top_p) = request.gen_opts.top_p {
            options["top_p"] = top_p.into();
        }
        if let Some(max_tokens) = request.gen_opts.max_tokens {
            options["num_predict"] = max_tokens.into();
        }

        let prompt = match &request.system {
            Some(system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        serde_json::json!({
            "model": request.model,
            "prompt": prompt,
            "stream": request.stream,
            "options": options,
        })
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        started: Instant,
        timeout: Duration,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut attempt = 0_u32;
        loop {
            match self.client.post(&self.generate_url).json(body).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(normalize_status_error(status, &text));
                }
                Err(err) => {
                    let normalized = normalize_transport_error(&err);
                    if normalized.is_transient_transport()
                        && retry_fits_deadline(started, timeout, attempt)
                    {
                        tokio::time::sleep(retry_backoff_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(normalized);
                }
            }
        }
    }

    async fn run(&self, request: VendorRequest) -> Result<VendorResponse, AdapterError> {
        let _permit = self
            .streams
            .acquire()
            .await
            .map_err(|_| AdapterError::Unknown("adapter semaphore closed".to_string()))?;

        let started = Instant::now();
        let body = Self::request_body(&request);
        let response = self.send(&body, started, request.timeout).await?;

        if request.stream {
            self.consume_stream(&request, response).await
        } else {
            let line: GenerateLine = response
                .json()
                .await
                .map_err(|err| normalize_transport_error(&err))?;
            let text = line.response.unwrap_or_default();
            Ok(finish(
                &request,
                text,
                line.prompt_eval_count,
                line.eval_count,
            ))
        }
    }

    async fn consume_stream(
        &self,
        request: &VendorRequest,
        response: reqwest::Response,
    ) -> Result<VendorResponse, AdapterError> {
        let mut text = String::new();
        let mut prompt_tokens = None;
        let mut completion_tokens = None;
        let mut buffer = String::new();
        let mut byte_stream = response.bytes_stream();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|err| normalize_transport_error(&err))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<GenerateLine>(line) else {
                    continue;
                };
                if let Some(count) = parsed.prompt_eval_count {
                    prompt_tokens.get_or_insert(count);
                }
                if let Some(count) = parsed.eval_count {
                    completion_tokens = Some(count);
                }
                if let Some(token) = parsed.response {
                    if !token.is_empty() {
                        text.push_str(&token);
                        if let Some(tx) = &request.token_tx {
                            if tx.send(token).await.is_err() {
                                return Err(AdapterError::Cancelled);
                            }
                        }
                    }
                }
                if parsed.done {
                    break 'outer;
                }
            }
        }
        Ok(finish(request, text, prompt_tokens, completion_tokens))
    }
}

fn finish(
    request: &VendorRequest,
    text: String,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
) -> VendorResponse {
    let prompt_tokens =
        prompt_tokens.unwrap_or_else(|| count_tokens(&request.prompt) as u64);
    let completion_tokens = completion_tokens.unwrap_or_else(|| count_tokens(&text) as u64);
    VendorResponse {
        text,
        prompt_tokens,
        completion_tokens,
        // Local inference has no metered cost.
        cost: 0.0,
    }
}

#[async_trait]
impl VendorAdapter for OllamaAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Secondary
    }

    async fn call(
        &self,
        request: VendorRequest,
        cancel: &CancellationToken,
    ) -> Result<VendorResponse, AdapterError> {
        let timeout = request.timeout;
        tokio::select! {
            () = cancel.cancelled() => Err(AdapterError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(AdapterError::Timeout),
            result = self.run(request) => result,
        }
    }

    async fn probe(&self, timeout: Duration) -> Result<(), String> {
        let body = serde_json::json!({
            "model": "",
            "prompt": "ping",
            "stream": false,
        });
        match self
            .client
            .post(&self.generate_url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(()),
            // A 4xx still proves the server is up and answering.
            Ok(response) if response.status().is_client_error() => Ok(()),
            Ok(response) => Err(format!("probe status {}", response.status())),
            Err(err) => Err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::GenOptions;

    fn make_request() -> VendorRequest {
        VendorRequest {
            prompt: "hello there".to_string(),
            model: "llama3:latest".to_string(),
            system: None,
            stream: true,
            token_tx: None,
            timeout: Duration::from_secs(5),
            gen_opts: GenOptions::default(),
        }
    }

    #[test]
    fn body_defaults_num_ctx() {
        let body = OllamaAdapter::request_body(&make_request());
        assert_eq!(body["options"]["num_ctx"], 2048);
        assert_eq!(body["model"], "llama3:latest");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn body_prepends_system_prompt() {
        let mut request = make_request();
        request.system = Some("be terse".to_string());
        let body = OllamaAdapter::request_body(&request);
        let prompt = body["prompt"].as_str().unwrap();
        assert!(prompt.starts_with("be terse\n\n"));
        assert!(prompt.ends_with("hello there"));
    }

    #[test]
    fn max_tokens_maps_to_num_predict() {
        let mut request = make_request();
        request.gen_opts.max_tokens = Some(128);
        let body = OllamaAdapter::request_body(&request);
        assert_eq!(body["options"]["num_predict"], 128);
    }

    #[test]
    fn finish_estimates_missing_counts() {
        let request = make_request();
        let response = finish(&request, "three word reply".to_string(), None, None);
        assert_eq!(response.prompt_tokens, 2);
        assert_eq!(response.completion_tokens, 3);
        assert_eq!(response.cost, 0.0);
    }

    #[test]
    fn generate_line_parses_usage() {
        let line: GenerateLine = serde_json::from_str(
            r#"{"response":"hi","done":true,"prompt_eval_count":9,"eval_count":4}"#,
        )
        .unwrap();
        assert_eq!(line.prompt_eval_count, Some(9));
        assert_eq!(line.eval_count, Some(4));
        assert!(line.done);
    }
}
