//! Pipeline configuration
//!
//! Defaults are tuned for a hosted OpenAI-compatible endpoint. Every value can
//! be overridden from the environment (`DOCPIPE_*`), and `.env` files are
//! honoured through `dotenvy`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Batch size and worker-pool bound for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLimits {
    /// Items per external call
    pub batch_size: usize,
    /// Concurrent external calls
    pub max_concurrency: usize,
}

impl PhaseLimits {
    pub fn new(batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }
}

/// Backoff and retry settings for one logical external call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries per model after the first attempt
    pub max_retries: u32,
    /// Base for `base * 2^attempt` backoff
    pub base_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each backoff
    pub max_jitter_ms: u64,
    /// Per-attempt timeout; an elapsed timeout counts as a retryable error
    pub call_timeout_secs: u64,
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_jitter_ms: 250,
            call_timeout_secs: 90,
        }
    }
}

/// Top-level configuration shared by every phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Text analysis phase limits
    pub text: PhaseLimits,
    /// Multimodal analysis phase limits
    pub visual: PhaseLimits,
    /// Worker pool bound for generic fan-out steps
    pub fanout_concurrency: usize,
    /// Save a checkpoint every K completed items
    pub checkpoint_every: usize,
    /// Where the file-backed checkpoint store lives
    pub checkpoint_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
    /// Ordered model fallback list for the text phase
    pub text_models: Vec<String>,
    /// Ordered model fallback list for the visual phase
    pub visual_models: Vec<String>,
    /// Completion budget per call
    pub max_tokens: u32,
    /// Characters of shared context (e.g. document text) kept per batch
    pub shared_context_chars: usize,
    /// Characters kept from each item's own description
    pub item_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            text: PhaseLimits::new(15, 4),
            visual: PhaseLimits::new(1, 2),
            fanout_concurrency: num_cpus::get().max(1),
            checkpoint_every: 3,
            checkpoint_dir: None,
            retry: RetryPolicy::default(),
            text_models: vec!["gpt-4o-mini".to_string(), "gpt-4.1-mini".to_string()],
            visual_models: vec!["gpt-4o".to_string(), "gpt-4.1".to_string()],
            max_tokens: 4096,
            shared_context_chars: 12_000,
            item_chars: 1_000,
        }
    }
}

impl PipelineConfig {
    /// Load defaults, then apply `.env` and `DOCPIPE_*` overrides.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from any key lookup (the environment in production,
    /// a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var::<usize>(&lookup, "DOCPIPE_BATCH_SIZE") {
            self.text.batch_size = v.max(1);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "DOCPIPE_TEXT_CONCURRENCY") {
            self.text.max_concurrency = v.max(1);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "DOCPIPE_VISUAL_CONCURRENCY") {
            self.visual.max_concurrency = v.max(1);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "DOCPIPE_FANOUT_CONCURRENCY") {
            self.fanout_concurrency = v.max(1);
        }
        if let Some(v) = parse_var::<usize>(&lookup, "DOCPIPE_CHECKPOINT_EVERY") {
            self.checkpoint_every = v.max(1);
        }
        if let Some(dir) = lookup("DOCPIPE_CHECKPOINT_DIR").filter(|d| !d.trim().is_empty()) {
            self.checkpoint_dir = Some(PathBuf::from(dir));
        }
        if let Some(v) = parse_var::<u32>(&lookup, "DOCPIPE_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "DOCPIPE_BASE_DELAY_MS") {
            self.retry.base_delay_ms = v;
        }
        if let Some(models) = parse_list(&lookup, "DOCPIPE_TEXT_MODELS") {
            self.text_models = models;
        }
        if let Some(models) = parse_list(&lookup, "DOCPIPE_VISUAL_MODELS") {
            self.visual_models = models;
        }
    }

    /// Checkpoint directory, falling back to the platform data dir
    pub fn resolved_checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docpipe")
                .join("checkpoints")
        })
    }
}

/// Connection settings for the HTTP model client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL without the `/v1/...` suffix
    pub base_url: String,
    pub api_key: String,
    /// Transport-level timeout (the retry layer has its own)
    pub request_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            request_timeout_secs: 120,
            pool_max_idle_per_host: 32,
        }
    }
}

impl HttpClientConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(base) = std::env::var("DOCPIPE_API_BASE") {
            config.base_url = base.trim_end_matches('/').to_string();
        }
        config.api_key = std::env::var("DOCPIPE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .unwrap_or_default();
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring malformed configuration value");
            None
        }
    }
}

fn parse_list(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Vec<String>> {
    let raw = lookup(key)?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}
