//! End-to-end scenarios across pipeline, analyzer, checkpoint and
//! orchestrator.

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::analyzer::batch::testing::prompt_indices;
use crate::analyzer::retry::testing::ScriptedClient;
use crate::analyzer::{
    call_with_fallback, BatchAnalyzer, CallRequest, CallResponse, CallState, FallbackReason,
    ModelClient,
};
use crate::checkpoint::{FileBlobStore, MemoryBlobStore};
use crate::config::{PhaseLimits, PipelineConfig, RetryPolicy};
use crate::error::{ItemError, PipelineError};
use crate::orchestrator::{
    AssessmentInput, AssessmentOrchestrator, FindingTask, ItemState, MemorySink, WorkItem,
};
use crate::pipeline::{
    Context, FanOutStep, ItemOutcome, ItemProcessor, ItemResult, ParallelMember,
    ParallelStepGroup, StepOutput,
};

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_jitter_ms = 5;
    config.text_models = vec!["text-a".into(), "text-b".into()];
    config.visual_models = vec!["vision-a".into()];
    config
}

/// Answers every enumerated item; the rationale echoes the item line
fn answer_every_item(req: &CallRequest) -> CallResponse {
    let results: Vec<Value> = prompt_indices(&req.prompt)
        .into_iter()
        .map(|i| {
            let marker = format!("[{}] ", i);
            let line = req
                .prompt
                .lines()
                .find_map(|l| l.strip_prefix(&marker))
                .unwrap_or_default();
            json!({"index": i, "status": "compliant", "rationale": line, "confidence": 0.9})
        })
        .collect();
    CallResponse::success(json!({ "results": results }).to_string(), 11)
}

fn numbered_items(n: usize) -> Vec<WorkItem> {
    (1..=n)
        .map(|i| WorkItem::new(format!("item-{:02}", i), format!("check {}", i)))
        .collect()
}

struct JitteryMember {
    name: String,
    offset: i64,
}

#[async_trait]
impl ParallelMember for JitteryMember {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(&self, ctx: &Context) -> Result<StepOutput, PipelineError> {
        let delay = rand::thread_rng().gen_range(0..25u64);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let base = ctx.data.get("base").and_then(Value::as_i64).unwrap_or(0);
        Ok(StepOutput::new()
            .with("value", json!(base + self.offset))
            .with("delay_independent", json!(true)))
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_group_output_ignores_completion_order() {
    let group = || {
        let members = (0..6)
            .map(|i| {
                Box::new(JitteryMember {
                    name: format!("member-{}", i),
                    offset: i,
                }) as Box<dyn ParallelMember>
            })
            .collect();
        ParallelStepGroup::new("enrich", members).unwrap()
    };
    let base = Context::new("run-parallel").with_data("base", json!(100));

    let first = group().run(base.clone()).await.unwrap();
    for _ in 0..10 {
        assert_eq!(group().run(base.clone()).await.unwrap(), first);
    }
    assert_eq!(first.output_value("member-5", "value"), Some(&json!(105)));
}

struct Labeller;

#[async_trait]
impl ItemProcessor for Labeller {
    type Item = u64;
    type Output = String;

    fn name(&self) -> &str {
        "labeller"
    }

    fn get_items(&self, ctx: &Context) -> Result<Vec<u64>, PipelineError> {
        ctx.require_as(self.name(), "page_numbers")
    }

    fn item_id(&self, item: &u64) -> String {
        format!("page-{}", item)
    }

    async fn process_item(&self, item: &u64, _ctx: &Context) -> Result<Option<String>, ItemError> {
        let delay = rand::thread_rng().gen_range(0..10u64);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        match item % 7 {
            0 => Err(ItemError::from("unreadable page")),
            3 => Ok(None),
            _ => Ok(Some(format!("label {}", item))),
        }
    }

    fn merge_results(
        &self,
        outcomes: Vec<ItemOutcome<String>>,
        ctx: &mut Context,
    ) -> Result<(), PipelineError> {
        let ids: Vec<&str> = outcomes.iter().map(|o| o.item_id.as_str()).collect();
        ctx.record(self.name(), "ids", json!(ids));
        let labels: Vec<Option<&String>> = outcomes.iter().map(|o| o.result.output()).collect();
        ctx.record(self.name(), "labels", json!(labels));
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o.result, ItemResult::Failed(_)))
            .count();
        ctx.record(self.name(), "failed", json!(failed));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn fan_out_merges_every_item_exactly_once() {
    let pages: Vec<u64> = (1..=40).collect();
    let mut ctx = Context::new("run-fanout").with_data("page_numbers", json!(pages));

    let report = FanOutStep::new(Labeller, 6).execute(&mut ctx).await.unwrap();

    assert_eq!(report.total, 40);
    assert_eq!(report.processed(), 40);
    assert_eq!(report.failed, 5);
    assert_eq!(report.skipped, 6);

    let ids = ctx.output_value("labeller", "ids").unwrap().as_array().unwrap();
    let expected: Vec<Value> = pages.iter().map(|p| json!(format!("page-{}", p))).collect();
    assert_eq!(ids, &expected);
    assert_eq!(ctx.output_value("labeller", "failed"), Some(&json!(5)));
}

#[tokio::test(start_paused = true)]
async fn missing_indices_across_batches_get_conservative_default() {
    // Every response drops its last item
    let client = Arc::new(ScriptedClient::new(|req: &CallRequest| {
        let mut indices = prompt_indices(&req.prompt);
        indices.pop();
        let results: Vec<Value> = indices
            .into_iter()
            .map(|i| json!({"index": i, "status": "non_compliant"}))
            .collect();
        CallResponse::success(json!(results).to_string(), 4)
    }));
    let analyzer = BatchAnalyzer::new(
        FindingTask::text(),
        client,
        vec!["text-a".into()],
        PhaseLimits::new(4, 2),
        &fast_config(),
    );

    let run = analyzer.analyze_all(&numbered_items(10), "").await;

    assert_eq!(run.outcomes.len(), 10);
    assert_eq!(run.summary.missing, 3);
    for i in [3, 7, 9] {
        assert_eq!(
            run.outcomes[i].fallback_reason(),
            Some(&FallbackReason::MissingIndex)
        );
    }
    assert!(run.outcomes[0].is_resolved());
}

#[tokio::test(start_paused = true)]
async fn retries_then_falls_back_with_fresh_counter() {
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay_ms: 50,
        max_jitter_ms: 10,
        call_timeout_secs: 30,
    };
    let models = vec!["text-a".to_string(), "text-b".to_string()];

    // max_retries rate limits on the first model, then success on it
    let client = ScriptedClient::new(|_| CallResponse::success("{}", 1));
    for _ in 0..3 {
        client.push("text-a", CallResponse::rate_limited("429"));
    }
    let ok = call_with_fallback(&client, &models, &policy, &CallRequest::new("p"))
        .await
        .unwrap();
    assert_eq!(
        ok.state(),
        CallState::Succeeded {
            model: "text-a".into(),
            attempt: 3
        }
    );

    // One more rate limit than allowed moves to the next model at attempt 0
    let client = ScriptedClient::new(|_| CallResponse::success("{}", 1));
    for _ in 0..4 {
        client.push("text-a", CallResponse::rate_limited("429"));
    }
    let ok = call_with_fallback(&client, &models, &policy, &CallRequest::new("p"))
        .await
        .unwrap();
    assert_eq!(
        ok.state(),
        CallState::Succeeded {
            model: "text-b".into(),
            attempt: 0
        }
    );
    assert_eq!(ok.trace.attempts_on("text-a"), 4);
    assert_eq!(ok.trace.models_tried(), vec!["text-a", "text-b"]);
}

/// Answers `limit` calls, then never returns (simulates the process dying)
struct DiesAfter {
    limit: usize,
    served: AtomicUsize,
}

#[async_trait]
impl ModelClient for DiesAfter {
    async fn call(&self, request: CallRequest) -> CallResponse {
        if self.served.fetch_add(1, Ordering::SeqCst) >= self.limit {
            std::future::pending::<()>().await;
        }
        answer_every_item(&request)
    }
}

#[tokio::test(start_paused = true)]
async fn killed_run_resumes_from_last_checkpoint() {
    let mut config = fast_config();
    config.text = PhaseLimits::new(1, 1);
    config.checkpoint_every = 3;
    let input = AssessmentInput {
        assessment_id: None,
        document_text: "policy document".into(),
        items: numbered_items(10),
    };

    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(FileBlobStore::with_dir(dir.path()));

    // First attempt dies while item 8 is in flight
    let dying = AssessmentOrchestrator::new(
        config.clone(),
        Arc::new(DiesAfter {
            limit: 7,
            served: AtomicUsize::new(0),
        }),
        blobs.clone(),
        Arc::new(MemorySink::new()),
    );
    let killed = tokio::time::timeout(
        Duration::from_secs(30),
        dying.run("run-resume", &input, None),
    )
    .await;
    assert!(killed.is_err());
    drop(dying);

    let recovery = AssessmentOrchestrator::new(
        config.clone(),
        Arc::new(ScriptedClient::new(answer_every_item)),
        blobs.clone(),
        Arc::new(MemorySink::new()),
    );
    let info = recovery.recovery_info("run-resume").unwrap().unwrap();
    assert_eq!(info.durably_processed, 7);
    let on_record = recovery
        .checkpoints()
        .processed_ids("run-resume", "text")
        .unwrap();
    assert_eq!(
        on_record.into_iter().collect::<Vec<_>>(),
        (1..=7).map(|i| format!("item-{:02}", i)).collect::<Vec<_>>()
    );

    // Restart: only items 8, 9 and 10 are sent
    let client = Arc::new(ScriptedClient::new(answer_every_item));
    let restarted = AssessmentOrchestrator::new(
        config.clone(),
        client.clone(),
        blobs.clone(),
        Arc::new(MemorySink::new()),
    );
    let resumed = restarted.run("run-resume", &input, None).await.unwrap();

    let sent: Vec<String> = client
        .calls
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.prompt.lines().find(|l| l.starts_with("[1] ")).unwrap_or_default().to_string())
        .collect();
    assert_eq!(sent, vec!["[1] check 8", "[1] check 9", "[1] check 10"]);
    assert_eq!(resumed.summary.resumed, 7);
    assert!(restarted.recovery_info("run-resume").unwrap().is_none());

    // Same records as a run that was never interrupted
    let fresh_dir = tempfile::tempdir().unwrap();
    let uninterrupted = AssessmentOrchestrator::new(
        config,
        Arc::new(ScriptedClient::new(answer_every_item)),
        Arc::new(FileBlobStore::with_dir(fresh_dir.path())),
        Arc::new(MemorySink::new()),
    )
    .run("run-fresh", &input, None)
    .await
    .unwrap();
    assert_eq!(resumed.records, uninterrupted.records);
}

#[tokio::test(start_paused = true)]
async fn exhausted_second_batch_defaults_only_its_items() {
    // The 15-item batch succeeds; the 8-item batch is rate limited on every model
    let client = Arc::new(ScriptedClient::new(|req: &CallRequest| {
        if prompt_indices(&req.prompt).len() == 15 {
            answer_every_item(req)
        } else {
            CallResponse::rate_limited("429 Too Many Requests")
        }
    }));
    let sink = Arc::new(MemorySink::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let orchestrator =
        AssessmentOrchestrator::new(fast_config(), client.clone(), blobs.clone(), sink.clone());
    let input = AssessmentInput {
        assessment_id: Some("asmt-23".into()),
        document_text: "twenty three checks".into(),
        items: numbered_items(23),
    };

    let report = orchestrator.run("run-e2e", &input, None).await.unwrap();

    assert_eq!(report.summary.total, 23);
    assert_eq!(report.summary.resolved, 15);
    assert_eq!(report.summary.fallback, 8);
    assert_eq!(report.summary.batch_errors, 8);
    assert_eq!(report.text.batches, 2);
    assert_eq!(report.text.failed_batches, 1);

    // Second batch: 4 attempts on each of the two text models
    assert_eq!(client.call_count(), 1 + 8);

    for record in &report.records[..15] {
        assert!(record.fallback.is_none());
    }
    for record in &report.records[15..] {
        assert_eq!(record.state, ItemState::ConclusiveFromText);
        assert!(matches!(
            record.fallback,
            Some(FallbackReason::BatchError { .. })
        ));
    }
    assert_eq!(sink.records("run-e2e").await.unwrap().len(), 23);
    assert!(blobs.is_empty());
}
