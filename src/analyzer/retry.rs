//! Retry and model-fallback state machine
//!
//! One logical call walks an ordered model list. Rate limits and timeouts
//! retry the same model with exponential backoff plus jitter. When a model
//! runs out of retries the next model starts with a fresh attempt counter.
//! Any other error ends the call immediately.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;

use super::call::{CallRequest, ModelClient};
use crate::config::RetryPolicy;
use crate::error::CallError;

/// Where the machine is for one logical call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Attempting { model: String, attempt: u32 },
    Succeeded { model: String, attempt: u32 },
    Exhausted,
}

/// One raw attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub model: String,
    /// Retry counter on this model when the attempt was made (0 = first try)
    pub attempt: u32,
    /// `None` on success
    pub error: Option<String>,
}

/// Every attempt made for one logical call, in order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallTrace {
    pub attempts: Vec<AttemptRecord>,
}

impl CallTrace {
    /// Distinct models in the order they were tried
    pub fn models_tried(&self) -> Vec<&str> {
        let mut models: Vec<&str> = Vec::new();
        for record in &self.attempts {
            if models.last() != Some(&record.model.as_str()) {
                models.push(&record.model);
            }
        }
        models
    }

    pub fn attempts_on(&self, model: &str) -> usize {
        self.attempts.iter().filter(|a| a.model == model).count()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub text: String,
    pub model: String,
    /// Retries spent on the model that succeeded
    pub attempt: u32,
    pub tokens_used: u32,
    pub trace: CallTrace,
}

impl CallSuccess {
    pub fn state(&self) -> CallState {
        CallState::Succeeded {
            model: self.model.clone(),
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallFailure {
    pub error: CallError,
    pub trace: CallTrace,
}

/// Backoff before retry number `attempt`: `base * 2^attempt + jitter`
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    let base = policy.base_delay_ms.saturating_mul(factor);
    let jitter = if policy.max_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.max_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(base.saturating_add(jitter))
}

/// Run one logical call through the retry/fallback machine.
///
/// `request.model` is ignored; each attempt targets the current fallback
/// model.
pub async fn call_with_fallback(
    client: &dyn ModelClient,
    models: &[String],
    policy: &RetryPolicy,
    request: &CallRequest,
) -> Result<CallSuccess, CallFailure> {
    let mut trace = CallTrace::default();
    let Some(first) = models.first() else {
        return Err(CallFailure {
            error: CallError::NoModels,
            trace,
        });
    };

    let mut model_index = 0;
    let mut state = CallState::Attempting {
        model: first.clone(),
        attempt: 0,
    };
    let mut last_error = CallError::NoModels;

    while let CallState::Attempting { model, attempt } = &state {
        let (model, attempt) = (model.clone(), *attempt);

        let outcome = match tokio::time::timeout(
            policy.call_timeout(),
            client.call(request.for_model(&model)),
        )
        .await
        {
            Ok(response) => response.into_result(),
            Err(_) => Err(CallError::Timeout(policy.call_timeout())),
        };

        match outcome {
            Ok((text, tokens_used)) => {
                trace.attempts.push(AttemptRecord {
                    model: model.clone(),
                    attempt,
                    error: None,
                });
                if model_index > 0 || attempt > 0 {
                    tracing::info!(model = %model, attempt, "Call succeeded after retries");
                }
                return Ok(CallSuccess {
                    text,
                    model,
                    attempt,
                    tokens_used,
                    trace,
                });
            }
            Err(error) => {
                trace.attempts.push(AttemptRecord {
                    model: model.clone(),
                    attempt,
                    error: Some(error.to_string()),
                });

                if !error.is_retryable() {
                    tracing::warn!(
                        model = %model,
                        attempt,
                        error = %error,
                        "Call failed, not retryable"
                    );
                    return Err(CallFailure { error, trace });
                }

                let next_attempt = attempt + 1;
                if next_attempt <= policy.max_retries {
                    let delay = backoff_delay(policy, next_attempt);
                    tracing::warn!(
                        model = %model,
                        attempt = next_attempt,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    state = CallState::Attempting {
                        model,
                        attempt: next_attempt,
                    };
                } else {
                    model_index += 1;
                    last_error = error;
                    state = match models.get(model_index) {
                        Some(next) => {
                            tracing::warn!(
                                from = %model,
                                to = %next,
                                "Retries exhausted, falling back to next model"
                            );
                            CallState::Attempting {
                                model: next.clone(),
                                attempt: 0,
                            }
                        }
                        None => CallState::Exhausted,
                    };
                }
            }
        }
    }

    tracing::warn!(models = %models.join(","), error = %last_error, "All models exhausted");
    Err(CallFailure {
        error: CallError::Exhausted {
            models: models.join(","),
            last: Box::new(last_error),
        },
        trace,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedClient;
    use super::*;
    use crate::analyzer::call::CallResponse;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 100,
            max_jitter_ms: 10,
            call_timeout_secs: 5,
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn run(client: &dyn ModelClient, names: &[&str]) -> Result<CallSuccess, CallFailure> {
        call_with_fallback(client, &models(names), &policy(), &CallRequest::new("p")).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_timeout_retries_same_model() {
        let client = ScriptedClient::new(|_| CallResponse::success("ok", 2));
        client.push("a", CallResponse::timed_out("operation timed out"));

        let result = run(&client, &["a", "b"]).await.unwrap();

        assert_eq!((result.model.as_str(), result.attempt), ("a", 1));
        assert_eq!(client.models_called(), vec!["a", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_max_retries_then_success_same_model() {
        let client = ScriptedClient::new(|_| CallResponse::success("ok", 5));
        for _ in 0..3 {
            client.push("model-a", CallResponse::rate_limited("429"));
        }

        let result = run(&client, &["model-a", "model-b"]).await.unwrap();

        assert_eq!(
            result.state(),
            CallState::Succeeded {
                model: "model-a".to_string(),
                attempt: 3
            }
        );
        assert_eq!(result.text, "ok");
        assert_eq!(result.trace.models_tried(), vec!["model-a"]);
        assert_eq!(client.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_resets_attempts() {
        let client = ScriptedClient::new(|req| {
            if req.model == "model-a" {
                CallResponse::rate_limited("429")
            } else {
                CallResponse::success("from b", 7)
            }
        });

        let result = run(&client, &["model-a", "model-b"]).await.unwrap();

        assert_eq!(result.model, "model-b");
        assert_eq!(result.attempt, 0);
        assert_eq!(result.trace.attempts_on("model-a"), 4);
        assert_eq!(result.trace.models_tried(), vec!["model-a", "model-b"]);
        let last = result.trace.attempts.last().unwrap();
        assert_eq!((last.model.as_str(), last.attempt), ("model-b", 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_terminal() {
        let client = ScriptedClient::new(|_| CallResponse::rate_limited("429"));

        let failure = run(&client, &["a", "b"]).await.unwrap_err();

        assert!(matches!(failure.error, CallError::Exhausted { .. }));
        assert_eq!(client.call_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let client = ScriptedClient::new(|_| CallResponse::success("unused", 0));
        client.push("a", CallResponse::error("500 internal"));

        let failure = run(&client, &["a", "b"]).await.unwrap_err();

        assert_eq!(failure.error, CallError::Failed("500 internal".into()));
        assert_eq!(client.models_called(), vec!["a"]);

        let client = ScriptedClient::new(|_| CallResponse::token_limit("context length exceeded"));
        let failure = run(&client, &["a", "b"]).await.unwrap_err();
        assert!(matches!(failure.error, CallError::TokenLimit(_)));
        assert_eq!(client.call_count(), 1);
    }

    struct SlowThenFast {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ModelClient for SlowThenFast {
        async fn call(&self, _request: CallRequest) -> CallResponse {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            CallResponse::success("late", 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_same_model() {
        let client = SlowThenFast {
            calls: std::sync::atomic::AtomicUsize::new(0),
        };

        let result = run(&client, &["a", "b"]).await.unwrap();

        assert_eq!(result.model, "a");
        assert_eq!(result.attempt, 1);
        assert!(result.trace.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_no_models() {
        let client = ScriptedClient::new(|_| CallResponse::success("x", 0));
        let failure = call_with_fallback(&client, &[], &policy(), &CallRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(failure.error, CallError::NoModels);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_jitter_ms: 0,
            ..policy()
        };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(800));
    }
}
