//! Phase Orchestrator
//!
//! triage -> text analysis -> visual analysis -> persist
//!
//! Both analysis phases checkpoint as batches finish. A restarted run with
//! the same run id skips every item a checkpoint already holds. Checkpoints
//! are cleared only once the sink has accepted the terminal records.

use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::collaborators::{AcceptAll, ResultSink, Triage, TriageDecision};
use super::state::{ItemLedger, ItemState};
use super::task::FindingTask;
use super::types::{
    AssessmentFailure, AssessmentInput, AssessmentPhase, AssessmentProgress,
    AssessmentProgressFn, AssessmentReport, AssessmentSummary, FinalRecord, Finding, WorkItem,
};
use crate::analyzer::{BatchAnalyzer, BatchSummary, ModelClient, Outcome};
use crate::checkpoint::{BlobStore, CheckpointStore, CheckpointWriter, FileBlobStore, RecoveryInfo};
use crate::config::PipelineConfig;
use crate::error::{CheckpointError, PipelineError};
use crate::pipeline::CancelFlag;

/// What each analysis phase checkpoints per item
pub type PhaseRecord = Outcome<Finding>;

/// Fresh run identifier
pub fn new_run_id() -> String {
    format!("run-{}", Uuid::new_v4())
}

struct PhaseOutcome {
    results: BTreeMap<String, PhaseRecord>,
    summary: BatchSummary,
    /// Items taken from an existing checkpoint
    resumed: usize,
}

pub struct AssessmentOrchestrator {
    config: PipelineConfig,
    client: Arc<dyn ModelClient>,
    checkpoints: CheckpointStore<PhaseRecord>,
    triage: Arc<dyn Triage>,
    sink: Arc<dyn ResultSink>,
    text_task: FindingTask,
    visual_task: FindingTask,
    cancel: Option<CancelFlag>,
}

impl AssessmentOrchestrator {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn ModelClient>,
        blobs: Arc<dyn BlobStore>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            client,
            checkpoints: CheckpointStore::new(blobs),
            triage: Arc::new(AcceptAll),
            sink,
            text_task: FindingTask::text(),
            visual_task: FindingTask::visual(),
            cancel: None,
        }
    }

    /// Checkpoints go to the configured directory on disk
    pub fn from_config(
        config: PipelineConfig,
        client: Arc<dyn ModelClient>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let blobs = Arc::new(FileBlobStore::with_dir(config.resolved_checkpoint_dir()));
        Self::new(config, client, blobs, sink)
    }

    pub fn with_triage(mut self, triage: impl Triage + 'static) -> Self {
        self.triage = Arc::new(triage);
        self
    }

    pub fn with_text_task(mut self, task: FindingTask) -> Self {
        self.text_task = task;
        self
    }

    pub fn with_visual_task(mut self, task: FindingTask) -> Self {
        self.visual_task = task;
        self
    }

    /// Stop submitting work once `flag` is set
    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore<PhaseRecord> {
        &self.checkpoints
    }

    /// What an interrupted run already has on record
    pub fn recovery_info(&self, run_id: &str) -> Result<Option<RecoveryInfo>, CheckpointError> {
        self.checkpoints.recovery_info(run_id)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Run (or resume) one assessment end to end
    pub async fn run(
        &self,
        run_id: &str,
        input: &AssessmentInput,
        progress: Option<&AssessmentProgressFn<'_>>,
    ) -> Result<AssessmentReport, AssessmentFailure> {
        let mut last_completed = None;

        match self.run_phases(run_id, input, progress, &mut last_completed).await {
            Ok(report) => Ok(report),
            Err(error) => {
                let durably_processed = match self.checkpoints.recovery_info(run_id) {
                    Ok(info) => info.map(|i| i.durably_processed).unwrap_or(0),
                    Err(e) => {
                        tracing::warn!(run_id, error = %e, "Could not read recovery info");
                        0
                    }
                };
                tracing::error!(
                    run_id,
                    last_completed_phase = ?last_completed,
                    durably_processed,
                    error = %error,
                    "Assessment failed"
                );
                Err(AssessmentFailure {
                    run_id: run_id.to_string(),
                    last_completed_phase: last_completed,
                    durably_processed,
                    error,
                })
            }
        }
    }

    async fn run_phases(
        &self,
        run_id: &str,
        input: &AssessmentInput,
        progress: Option<&AssessmentProgressFn<'_>>,
        last_completed: &mut Option<AssessmentPhase>,
    ) -> Result<AssessmentReport, PipelineError> {
        let total = input.items.len();
        let mut ledger = ItemLedger::new(input.items.iter().map(|i| i.id.as_str()))?;
        let mut terminal: BTreeMap<String, FinalRecord> = BTreeMap::new();

        tracing::info!(run_id, items = total, "Starting assessment");

        // Phase 1: triage
        self.check_cancelled()?;
        let mut relevant = Vec::new();
        for item in &input.items {
            match self.triage.triage(item, &input.document_text) {
                TriageDecision::Relevant => {
                    ledger.advance(&item.id, ItemState::NeedsText)?;
                    relevant.push(item.clone());
                }
                TriageDecision::NotApplicable { reason } => {
                    ledger.advance(&item.id, ItemState::TriagedOut)?;
                    terminal.insert(
                        item.id.clone(),
                        FinalRecord {
                            item_id: item.id.clone(),
                            state: ItemState::TriagedOut,
                            finding: Finding::not_applicable(reason),
                            fallback: None,
                        },
                    );
                }
            }
        }
        emit(
            progress,
            AssessmentPhase::Triage,
            total,
            total,
            format!("{} of {} items need analysis", relevant.len(), total),
        );
        *last_completed = Some(AssessmentPhase::Triage);

        // Phase 2: text analysis
        let text_analyzer = BatchAnalyzer::new(
            self.text_task.clone(),
            self.client.clone(),
            self.config.text_models.clone(),
            self.config.text,
            &self.config,
        );
        let mut text = self
            .run_phase(
                run_id,
                AssessmentPhase::TextAnalysis,
                &text_analyzer,
                &relevant,
                &input.document_text,
                progress,
            )
            .await?;

        let mut visual_items = Vec::new();
        for item in &relevant {
            let record = take_record(&mut text.results, AssessmentPhase::TextAnalysis, &item.id)?;
            let unsettled = match &record {
                Outcome::Resolved { output } => output.needs_visual,
                Outcome::ConservativeDefault { .. } => true,
            };
            if unsettled && !item.images.is_empty() {
                ledger.advance(&item.id, ItemState::NeedsVisual)?;
                visual_items.push(item.clone());
            } else {
                ledger.advance(&item.id, ItemState::ConclusiveFromText)?;
                terminal.insert(
                    item.id.clone(),
                    final_record(&item.id, ItemState::ConclusiveFromText, record),
                );
            }
        }
        *last_completed = Some(AssessmentPhase::TextAnalysis);

        // Phase 3: visual analysis
        let visual_analyzer = BatchAnalyzer::new(
            self.visual_task.clone(),
            self.client.clone(),
            self.config.visual_models.clone(),
            self.config.visual,
            &self.config,
        );
        let mut visual = self
            .run_phase(
                run_id,
                AssessmentPhase::VisualAnalysis,
                &visual_analyzer,
                &visual_items,
                &input.document_text,
                progress,
            )
            .await?;

        for item in &visual_items {
            let record =
                take_record(&mut visual.results, AssessmentPhase::VisualAnalysis, &item.id)?;
            ledger.advance(&item.id, ItemState::ConclusiveFromVisual)?;
            terminal.insert(
                item.id.clone(),
                final_record(&item.id, ItemState::ConclusiveFromVisual, record),
            );
        }
        *last_completed = Some(AssessmentPhase::VisualAnalysis);

        if !ledger.all_terminal() {
            return Err(PipelineError::step(
                "orchestrator",
                "items left without a terminal classification",
            ));
        }

        // Phase 4: persist, then drop checkpoints
        let records: Vec<FinalRecord> = input
            .items
            .iter()
            .filter_map(|item| terminal.remove(&item.id))
            .collect();

        emit(
            progress,
            AssessmentPhase::Persist,
            0,
            records.len(),
            "Persisting results",
        );
        self.sink.persist(run_id, &records).await?;
        for record in &records {
            ledger.advance(&record.item_id, ItemState::Persisted)?;
        }
        *last_completed = Some(AssessmentPhase::Persist);

        for phase in [AssessmentPhase::TextAnalysis, AssessmentPhase::VisualAnalysis] {
            if let Some(name) = phase.checkpoint_name() {
                if let Err(e) = self.checkpoints.clear(run_id, name) {
                    tracing::warn!(run_id, phase = name, error = %e, "Failed to clear checkpoint");
                }
            }
        }

        let mut summary = AssessmentSummary::default();
        for record in &records {
            summary.count_record(record);
        }
        summary.resumed = text.resumed + visual.resumed;
        summary.tokens_used = text.summary.tokens_used + visual.summary.tokens_used;

        tracing::info!(
            run_id,
            total = summary.total,
            triaged_out = summary.triaged_out,
            from_text = summary.conclusive_from_text,
            from_visual = summary.conclusive_from_visual,
            resolved = summary.resolved,
            fallback = summary.fallback,
            resumed = summary.resumed,
            tokens = summary.tokens_used,
            "Assessment complete"
        );
        emit(
            progress,
            AssessmentPhase::Complete,
            total,
            total,
            format!("{} items assessed", total),
        );

        Ok(AssessmentReport {
            run_id: run_id.to_string(),
            assessment_id: input.assessment_id.clone(),
            records,
            summary,
            text: text.summary,
            visual: visual.summary,
        })
    }

    /// Analyze `items`, skipping whatever the phase checkpoint already holds.
    ///
    /// Batch results are drained by this one loop, which is also the only
    /// checkpoint writer for the phase.
    async fn run_phase(
        &self,
        run_id: &str,
        phase: AssessmentPhase,
        analyzer: &BatchAnalyzer<FindingTask>,
        items: &[WorkItem],
        shared: &str,
        progress: Option<&AssessmentProgressFn<'_>>,
    ) -> Result<PhaseOutcome, PipelineError> {
        let Some(name) = phase.checkpoint_name() else {
            return Err(PipelineError::step(
                "orchestrator",
                format!("{:?} is not an analysis phase", phase),
            ));
        };
        self.check_cancelled()?;

        let mut writer = CheckpointWriter::resume(
            self.checkpoints.clone(),
            run_id,
            name,
            self.config.checkpoint_every,
        )?;
        let pending: Vec<WorkItem> = items
            .iter()
            .filter(|item| !writer.is_processed(&item.id))
            .cloned()
            .collect();
        let total = items.len();
        let resumed = total - pending.len();
        let mut summary = BatchSummary::default();

        tracing::info!(run_id, phase = name, total, resumed, "Starting phase");
        emit(
            progress,
            phase,
            resumed,
            total,
            format!("{} items to analyze", pending.len()),
        );

        let mut done = resumed;
        let mut results = Box::pin(analyzer.run_batches(&pending, shared, self.cancel.as_ref()));
        while let Some(result) = results.next().await {
            summary.absorb(&result);
            let batch = result.batch;
            done += result.outcomes.len();

            let finished = pending
                .iter()
                .skip(result.offset)
                .map(|item| item.id.clone())
                .zip(result.outcomes);
            writer.record_batch(finished).await?;

            emit(
                progress,
                phase,
                done,
                total,
                format!("Batch {} complete", batch + 1),
            );
        }
        drop(results);

        let complete = items.iter().all(|item| writer.is_processed(&item.id));
        writer.flush().await?;

        if !complete {
            if self.is_cancelled() {
                tracing::info!(
                    run_id,
                    phase = name,
                    processed = done,
                    total,
                    "Phase cancelled, progress checkpointed"
                );
                return Err(PipelineError::Cancelled);
            }
            return Err(PipelineError::step(
                name,
                format!("{} of {} items finished", done, total),
            ));
        }

        tracing::info!(
            run_id,
            phase = name,
            analyzed = summary.total,
            resolved = summary.resolved,
            fallback = summary.fallback,
            failed_batches = summary.failed_batches,
            "Phase complete"
        );

        Ok(PhaseOutcome {
            results: writer.into_results(),
            summary,
            resumed,
        })
    }
}

fn emit(
    progress: Option<&AssessmentProgressFn<'_>>,
    phase: AssessmentPhase,
    current: usize,
    total: usize,
    message: impl Into<String>,
) {
    if let Some(callback) = progress {
        callback(AssessmentProgress {
            phase,
            current,
            total,
            message: message.into(),
        });
    }
}

fn take_record(
    results: &mut BTreeMap<String, PhaseRecord>,
    phase: AssessmentPhase,
    item_id: &str,
) -> Result<PhaseRecord, PipelineError> {
    results.remove(item_id).ok_or_else(|| {
        PipelineError::step(
            phase.checkpoint_name().unwrap_or("analysis"),
            format!("no result for item '{}'", item_id),
        )
    })
}

fn final_record(item_id: &str, state: ItemState, record: PhaseRecord) -> FinalRecord {
    let (finding, fallback) = match record {
        Outcome::Resolved { output } => (output, None),
        Outcome::ConservativeDefault { output, reason } => (output, Some(reason)),
    };
    FinalRecord {
        item_id: item_id.to_string(),
        state,
        finding,
        fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::batch::testing::prompt_indices;
    use crate::analyzer::call::{CallRequest, CallResponse, ImageInput};
    use crate::analyzer::retry::testing::ScriptedClient;
    use crate::analyzer::FallbackReason;
    use crate::checkpoint::MemoryBlobStore;
    use crate::orchestrator::collaborators::MemorySink;
    use crate::orchestrator::types::FindingStatus;
    use serde_json::json;
    use std::sync::Mutex;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry.base_delay_ms = 10;
        config.retry.max_jitter_ms = 0;
        config.text_models = vec!["text-a".into(), "text-b".into()];
        config.visual_models = vec!["vision-a".into()];
        config
    }

    /// Text calls: items whose description contains "photo" ask for visual
    /// review. Visual calls: everything is compliant.
    fn respond(req: &CallRequest) -> CallResponse {
        let visual = req.model.starts_with("vision");
        let results: Vec<_> = prompt_indices(&req.prompt)
            .into_iter()
            .map(|i| {
                let line = req
                    .prompt
                    .lines()
                    .find(|l| l.starts_with(&format!("[{}]", i)))
                    .unwrap_or_default();
                let needs_visual = !visual && line.contains("photo");
                let status = if needs_visual { "needs_follow_up" } else { "compliant" };
                json!({"index": i, "status": status, "needs_visual": needs_visual})
            })
            .collect();
        CallResponse::success(json!({ "results": results }).to_string(), 7)
    }

    fn input() -> AssessmentInput {
        AssessmentInput {
            assessment_id: Some("asmt-1".into()),
            document_text: "The applicant signed on page 2.".into(),
            items: vec![
                WorkItem::new("c1", "document is signed"),
                WorkItem::new("c2", "photo matches applicant")
                    .with_image(ImageInput::labelled("page 1", vec![0xFF, 0xD8, 0xFF])),
                WorkItem::new("c3", "fee schedule attached"),
                WorkItem::new("c4", "photo is in colour"),
            ],
        }
    }

    fn orchestrator(
        client: Arc<ScriptedClient>,
        blobs: Arc<MemoryBlobStore>,
        sink: Arc<MemorySink>,
    ) -> AssessmentOrchestrator {
        AssessmentOrchestrator::new(config(), client, blobs, sink).with_triage(
            |item: &WorkItem, _doc: &str| {
                if item.id == "c3" {
                    TriageDecision::NotApplicable {
                        reason: "no fees for this application type".into(),
                    }
                } else {
                    TriageDecision::Relevant
                }
            },
        )
    }

    #[test]
    fn test_run_id_format() {
        let id = new_run_id();
        assert!(id.starts_with("run-"));
        assert_ne!(id, new_run_id());
    }

    #[tokio::test]
    async fn test_routes_items_through_phases() {
        let client = Arc::new(ScriptedClient::new(respond));
        let blobs = Arc::new(MemoryBlobStore::new());
        let sink = Arc::new(MemorySink::new());
        let orchestrator = orchestrator(client.clone(), blobs.clone(), sink.clone());

        let report = orchestrator.run("run-route", &input(), None).await.unwrap();

        let states: Vec<_> = report.records.iter().map(|r| (r.item_id.as_str(), r.state)).collect();
        assert_eq!(
            states,
            vec![
                ("c1", ItemState::ConclusiveFromText),
                ("c2", ItemState::ConclusiveFromVisual),
                ("c3", ItemState::TriagedOut),
                // Asked for visual review but has no images
                ("c4", ItemState::ConclusiveFromText),
            ]
        );
        assert_eq!(report.records[1].finding.status, FindingStatus::Compliant);
        assert_eq!(report.records[2].finding.status, FindingStatus::NotApplicable);
        assert_eq!(report.summary.total, 4);
        assert_eq!(report.summary.triaged_out, 1);
        assert_eq!(report.summary.resolved, 3);
        assert_eq!(report.summary.tokens_used, 14);
        assert_eq!(report.assessment_id.as_deref(), Some("asmt-1"));

        // One text batch, one visual call; the visual call carries the image
        assert_eq!(client.call_count(), 2);
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls[1].images.len(), 1);
        assert_eq!(calls[1].images[0].label.as_deref(), Some("Item 1: page 1"));
        drop(calls);

        assert_eq!(sink.records("run-route").await.unwrap(), report.records);
        assert!(blobs.is_empty(), "checkpoints cleared after persist");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_text_batch_sends_items_with_images_to_visual() {
        let client = Arc::new(ScriptedClient::new(|req: &CallRequest| {
            if req.model.starts_with("text") {
                CallResponse::error("upstream 500")
            } else {
                respond(req)
            }
        }));
        let orchestrator = orchestrator(
            client,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemorySink::new()),
        );

        let report = orchestrator.run("run-fallback", &input(), None).await.unwrap();

        let c1 = &report.records[0];
        assert_eq!(c1.state, ItemState::ConclusiveFromText);
        assert_eq!(c1.finding.status, FindingStatus::NeedsFollowUp);
        assert!(matches!(c1.fallback, Some(FallbackReason::BatchError { .. })));

        let c2 = &report.records[1];
        assert_eq!(c2.state, ItemState::ConclusiveFromVisual);
        assert!(c2.fallback.is_none());

        assert_eq!(report.summary.fallback, 2);
        assert_eq!(report.summary.batch_errors, 2);
        assert_eq!(report.text.failed_batches, 1);
    }

    #[tokio::test]
    async fn test_progress_reports_every_phase() {
        let client = Arc::new(ScriptedClient::new(respond));
        let orchestrator = orchestrator(
            client,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemorySink::new()),
        );
        let seen = Mutex::new(Vec::new());
        let hook = |p: AssessmentProgress| seen.lock().unwrap().push(p.phase);

        orchestrator
            .run("run-progress", &input(), Some(&hook as &AssessmentProgressFn<'_>))
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        for phase in [
            AssessmentPhase::Triage,
            AssessmentPhase::TextAnalysis,
            AssessmentPhase::VisualAnalysis,
            AssessmentPhase::Persist,
            AssessmentPhase::Complete,
        ] {
            assert!(seen.contains(&phase), "missing {:?}", phase);
        }
        assert_eq!(seen.last(), Some(&AssessmentPhase::Complete));
    }

    #[tokio::test]
    async fn test_cancel_before_start_reports_nothing_durable() {
        let flag = CancelFlag::new();
        flag.cancel();
        let client = Arc::new(ScriptedClient::new(respond));
        let orchestrator = orchestrator(
            client.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemorySink::new()),
        )
        .with_cancel(flag);

        let failure = orchestrator.run("run-cancel", &input(), None).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Cancelled));
        assert_eq!(failure.last_completed_phase, None);
        assert_eq!(failure.durably_processed, 0);
        assert_eq!(client.call_count(), 0);
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl ResultSink for FailingSink {
        async fn persist(
            &self,
            _run_id: &str,
            _records: &[FinalRecord],
        ) -> Result<(), PipelineError> {
            Err(PipelineError::Persist("disk full".into()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_checkpoints() {
        let client = Arc::new(ScriptedClient::new(respond));
        let blobs = Arc::new(MemoryBlobStore::new());
        let failing_sink = Arc::new(FailingSink);
        let orchestrator =
            AssessmentOrchestrator::new(config(), client.clone(), blobs.clone(), failing_sink);

        let failure = orchestrator.run("run-sink", &input(), None).await.unwrap_err();

        assert!(matches!(failure.error, PipelineError::Persist(_)));
        assert_eq!(failure.last_completed_phase, Some(AssessmentPhase::VisualAnalysis));
        // Four text items plus one visual item are on record
        assert_eq!(failure.durably_processed, 5);

        // Retrying with a working sink makes no new calls
        let calls_before = client.call_count();
        let sink = Arc::new(MemorySink::new());
        let retry =
            AssessmentOrchestrator::new(config(), client.clone(), blobs.clone(), sink.clone());
        let report = retry.run("run-sink", &input(), None).await.unwrap();

        assert_eq!(client.call_count(), calls_before);
        assert_eq!(report.summary.resumed, 5);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_item_ids_fail_fast() {
        let client = Arc::new(ScriptedClient::new(respond));
        let orchestrator = AssessmentOrchestrator::new(
            config(),
            client,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemorySink::new()),
        );
        let mut input = input();
        input.items.push(WorkItem::new("c1", "again"));

        let failure = orchestrator.run("run-dup", &input, None).await.unwrap_err();
        assert!(matches!(failure.error, PipelineError::InvalidContextValue { .. }));
    }
}
