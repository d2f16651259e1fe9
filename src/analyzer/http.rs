//! OpenAI-compatible chat-completions client
//!
//! Maps HTTP outcomes onto [`CallStatus`]; it never retries on its own. The
//! retry/fallback machine above it owns that policy.

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::call::{CallRequest, CallResponse, ModelClient};
use crate::config::HttpClientConfig;

pub struct OpenAiCompatClient {
    client: Client,
    config: HttpClientConfig,
    tokens_used: AtomicU64,
}

impl OpenAiCompatClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()?;

        Ok(Self {
            client,
            config,
            tokens_used: AtomicU64::new(0),
        })
    }

    /// Total tokens reported by the endpoint across all calls
    pub fn tokens_used(&self) -> u64 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

/// Build the request body for one call
fn build_body(request: &CallRequest) -> ChatRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &request.system {
        messages.push(ChatMessage {
            role: "system",
            content: vec![ContentPart::Text {
                text: system.clone(),
            }],
        });
    }

    let mut content = vec![ContentPart::Text {
        text: request.prompt.clone(),
    }];
    for image in &request.images {
        if let Some(label) = &image.label {
            content.push(ContentPart::Text {
                text: label.clone(),
            });
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image.data);
        content.push(ContentPart::ImageUrl {
            image_url: ImageUrlContent {
                url: format!("data:{};base64,{}", detect_image_mime(&image.data), encoded),
                detail: "high",
            },
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content,
    });

    ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: 0.0,
        response_format: request.json_mode.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

/// Classify a non-success HTTP status
fn classify_failure(status: StatusCode, body: &str) -> CallResponse {
    let message = format!("API error ({}): {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        return CallResponse::rate_limited(message);
    }
    let lowered = body.to_lowercase();
    let mentions_context = lowered.contains("context length")
        || lowered.contains("context_length")
        || lowered.contains("maximum context")
        || lowered.contains("too many tokens");
    if (status == StatusCode::BAD_REQUEST || status == StatusCode::PAYLOAD_TOO_LARGE)
        && mentions_context
    {
        return CallResponse::token_limit(message);
    }
    CallResponse::error(message)
}

/// Transport deadlines are retryable; anything else is a plain error
fn transport_failure(context: &str, error: &reqwest::Error) -> CallResponse {
    let message = format!("{}: {}", context, error);
    if error.is_timeout() {
        CallResponse::timed_out(message)
    } else {
        CallResponse::error(message)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn call(&self, request: CallRequest) -> CallResponse {
        let body = build_body(&request);

        let response = match self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(model = %request.model, error = %e, "Request failed");
                return transport_failure("request failed", &e);
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return classify_failure(status, &text);
        }

        let parsed: ChatResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => return transport_failure("failed to read response", &e),
        };

        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);
        self.tokens_used.fetch_add(u64::from(tokens), Ordering::Relaxed);

        let choice = parsed.choices.into_iter().next();
        if choice.as_ref().and_then(|c| c.finish_reason.as_deref()) == Some("length") {
            return CallResponse::token_limit("completion truncated at max_tokens");
        }

        match choice.and_then(|c| c.message.content) {
            Some(text) if !text.trim().is_empty() => CallResponse::success(text, tokens),
            _ => CallResponse::error("empty completion"),
        }
    }
}

/// Detect image MIME type from magic bytes
fn detect_image_mime(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        "image/png"
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"RIFF") && data.get(8..12) == Some(&b"WEBP"[..]) {
        "image/webp"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else {
        "image/png"
    }
}

// API request/response types

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrlContent },
}

#[derive(Serialize)]
struct ImageUrlContent {
    url: String,
    detail: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}
