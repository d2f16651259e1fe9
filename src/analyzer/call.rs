//! External call surface
//!
//! The only boundary the engine needs to make progress. Implementations are
//! passed in explicitly, so tests swap in scripted fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Status reported by one raw call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    RateLimited,
    TokenLimit,
    /// The transport gave up before the endpoint answered
    TimedOut,
    Error,
}

/// Raw image attached to a multimodal call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInput {
    /// Short caption shown to the model next to the image
    #[serde(default)]
    pub label: Option<String>,
    pub data: Vec<u8>,
}

impl ImageInput {
    pub fn new(data: Vec<u8>) -> Self {
        Self { label: None, data }
    }

    pub fn labelled(label: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            label: Some(label.into()),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub images: Vec<ImageInput>,
    /// Ask the endpoint for a JSON object response
    pub json_mode: bool,
    pub max_tokens: u32,
}

impl CallRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub status: CallStatus,
    pub text: Option<String>,
    pub error: Option<String>,
    pub tokens_used: u32,
}

impl CallResponse {
    pub fn success(text: impl Into<String>, tokens_used: u32) -> Self {
        Self {
            status: CallStatus::Success,
            text: Some(text.into()),
            error: None,
            tokens_used,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::failure(CallStatus::RateLimited, message)
    }

    pub fn token_limit(message: impl Into<String>) -> Self {
        Self::failure(CallStatus::TokenLimit, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::failure(CallStatus::TimedOut, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::failure(CallStatus::Error, message)
    }

    fn failure(status: CallStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            text: None,
            error: Some(message.into()),
            tokens_used: 0,
        }
    }

    /// Convert into the text payload or a classified error
    pub fn into_result(self) -> Result<(String, u32), CallError> {
        let message = self.error.unwrap_or_default();
        match self.status {
            CallStatus::Success => Ok((self.text.unwrap_or_default(), self.tokens_used)),
            CallStatus::RateLimited => Err(CallError::RateLimited(message)),
            CallStatus::TokenLimit => Err(CallError::TokenLimit(message)),
            CallStatus::TimedOut => Err(CallError::TransportTimeout(message)),
            CallStatus::Error => Err(CallError::Failed(message)),
        }
    }
}

/// Anything that can answer a prompt
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(&self, request: CallRequest) -> CallResponse;
}
