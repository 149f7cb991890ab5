//! Primary vendor adapter: hosted OpenAI-style chat completions API.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::intent::count_tokens;
use crate::routing::Vendor;
use crate::stream::SseParser;

use super::{
    normalize_status_error, normalize_transport_error, retry_backoff_delay, retry_fits_deadline,
    AdapterError, VendorAdapter, VendorRequest, VendorResponse,
};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    chat_url: String,
    api_key: Option<String>,
    streams: Semaphore,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiAdapter {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>, max_streams: usize) -> Self {
        Self {
            client,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            streams: Semaphore::new(max_streams.max(1)),
        }
    }

    fn request_body(request: &VendorRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(temperature) = request.gen_opts.temperature {
            body["temperature"] = temperature.into();
        }
        if let Some(top_p) = request.gen_opts.top_p {
            body["top_p"] = top_p.into();
        }
        if let Some(max_tokens) = request.gen_opts.max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        started: Instant,
        timeout: Duration,
    ) -> Result<reqwest::Response, AdapterError> {
        let mut attempt = 0_u32;
        loop {
            let mut builder = self.client.post(&self.chat_url).json(body);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }
            match builder.send().await {
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
            let completion: ChatCompletion = response
                .json()
                .await
                .map_err(|err| normalize_transport_error(&err))?;
            let text = completion
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .unwrap_or_default();
            let usage = completion.usage.unwrap_or_default();
            Ok(self.finish(&request, text, usage))
        }
    }

    async fn consume_stream(
        &self,
        request: &VendorRequest,
        response: reqwest::Response,
    ) -> Result<VendorResponse, AdapterError> {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        let mut text = String::new();
        let mut usage = ChatUsage::default();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|err| normalize_transport_error(&err))?;
            let chunk_str = String::from_utf8_lossy(&chunk);
            events.clear();
            parser.feed_into(&chunk_str, &mut events);
            for event in events.drain(..) {
                if event.data == "[DONE]" {
                    return Ok(self.finish(request, text, usage));
                }
                let Ok(parsed) = serde_json::from_str::<ChatChunk>(&event.data) else {
                    continue;
                };
                if let Some(chunk_usage) = parsed.usage {
                    usage = chunk_usage;
                }
                let Some(delta) = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta.content)
                else {
                    continue;
                };
                if delta.is_empty() {
                    continue;
                }
                text.push_str(&delta);
                if let Some(tx) = &request.token_tx {
                    // A dropped receiver means the client is gone.
                    if tx.send(delta).await.is_err() {
                        return Err(AdapterError::Cancelled);
                    }
                }
            }
        }
        Ok(self.finish(request, text, usage))
    }

    fn finish(&self, request: &VendorRequest, text: String, usage: ChatUsage) -> VendorResponse {
        let prompt_tokens = if usage.prompt_tokens > 0 {
            usage.prompt_tokens
        } else {
            count_tokens(&request.prompt) as u64
        };
        let completion_tokens = if usage.completion_tokens > 0 {
            usage.completion_tokens
        } else {
            count_tokens(&text) as u64
        };
        VendorResponse {
            text,
            prompt_tokens,
            completion_tokens,
            cost: 0.0,
        }
    }
}

#[async_trait]
impl VendorAdapter for OpenAiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Primary
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
        let mut builder = self
            .client
            .get(self.chat_url.replace("/chat/completions", "/models"))
            .timeout(timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(format!("probe status {}", response.status())),
            Err(err) => Err(err.to_string()),
        }
    }
}
