use std::collections::HashSet;

use chrono::Utc;
use log::{error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::config::OrchestratorSettings;
use crate::delay_manager::{CancelToken, Pause, ThreadPause};
use crate::error::{Error, Result};
use crate::model::{
    best_match, BatchRun, KeywordJob, OutcomeRecord, RunSummary, SubmittedTask, TaskOutcome,
    CANCELLED, NOT_FOUND_TIMED_OUT, SUBMISSION_FAILED,
};
use crate::ranking_client::{FetchResult, FetchStatus, RankingApi};
use crate::result_sink::{LedgerStatus, ResultSink, TaskLedger};

/// Result of an incremental submit phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub summary: RunSummary,
    pub submitted: usize,
    pub next_cursor: usize,
    /// False once the job list is drained; the caller's scheduler can stop.
    pub has_more: bool,
}

/// Result of an incremental fetch phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub summary: RunSummary,
    pub still_pending: usize,
}

impl FetchReport {
    pub fn has_more(&self) -> bool {
        self.still_pending > 0
    }
}

enum Poll {
    Terminal(TaskOutcome, Option<Value>),
    Pending(Option<Value>),
}

fn classify(result: FetchResult) -> Poll {
    match result.status {
        FetchStatus::Completed => match best_match(&result.matches) {
            Some(best) => Poll::Terminal(TaskOutcome::Completed(best.clone()), result.raw),
            None => Poll::Pending(result.raw),
        },
        FetchStatus::NotReady => Poll::Pending(result.raw),
        FetchStatus::Error => {
            let reason = result.error.unwrap_or_else(|| "fetch failed".to_string());
            Poll::Terminal(TaskOutcome::Failed(reason), result.raw)
        }
    }
}

/// Drives keyword jobs through submit, dwell, fetch and retry until every
/// job has a terminal outcome in the sink.
pub struct BatchOrchestrator<A, P = ThreadPause> {
    api: A,
    settings: OrchestratorSettings,
    pause: P,
    cancel: CancelToken,
}

impl<A: RankingApi> BatchOrchestrator<A, ThreadPause> {
    pub fn new(api: A, settings: OrchestratorSettings) -> Self {
        BatchOrchestrator::with_pause(api, settings, ThreadPause)
    }
}

impl<A: RankingApi, P: Pause> BatchOrchestrator<A, P> {
    pub fn with_pause(api: A, settings: OrchestratorSettings, pause: P) -> Self {
        BatchOrchestrator { api, settings, pause, cancel: CancelToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn check_settings(&self) -> Result<()> {
        if self.settings.batch_size == 0 {
            return Err(Error::configuration("batch_size must be positive"));
        }
        Ok(())
    }

    /// One-shot mode: every job not already terminal in `sink` is submitted,
    /// polled and finalized, one batch at a time.
    pub fn run<S: ResultSink>(&self, jobs: &[KeywordJob], sink: &mut S) -> Result<RunSummary> {
        self.check_settings()?;
        sink.setup()?;

        let run_id = Uuid::new_v4();
        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        let mut todo = Vec::new();
        for job in jobs {
            if !seen.insert(job.source_row_id) {
                warn!("Duplicate row {} in job list, ignoring", job.source_row_id);
                continue;
            }
            if sink.is_terminal(job.source_row_id) {
                summary.skipped += 1;
            } else {
                todo.push(job.clone());
            }
        }
        if let Some(limit) = self.settings.limit {
            if todo.len() > limit {
                info!("Limiting this run to {} of {} jobs", limit, todo.len());
                todo.truncate(limit);
            }
        }

        let batch_size = self.settings.batch_size;
        let total_batches = todo.len().div_ceil(batch_size);
        info!(
            "Run {}: {} jobs to process, {} already done, {} batches of up to {}",
            run_id,
            todo.len(),
            summary.skipped,
            total_batches,
            batch_size
        );

        for (i, batch) in todo.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                warn!(
                    "Cancelled before batch {}/{}, remaining jobs are left for a later run",
                    i + 1,
                    total_batches
                );
                break;
            }
            info!("Processing batch {}/{} ({} keywords)", i + 1, total_batches, batch.len());
            self.run_batch(batch, sink, &mut summary)?;
            sink.flush()?;
            info!("Completed batch {}/{}: {}", i + 1, total_batches, summary);
        }

        info!("Run {} complete. {}", run_id, summary);
        Ok(summary)
    }

    fn run_batch<S: ResultSink>(
        &self,
        batch: &[KeywordJob],
        sink: &mut S,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mut run = BatchRun::new(batch.to_vec());
        summary.processed += batch.len();

        let task_ids = match self.submit(batch) {
            Ok(ids) => ids,
            Err(e) => {
                error!("Batch submission failed: {}", e);
                for job in batch {
                    let outcome = TaskOutcome::Failed(SUBMISSION_FAILED.to_string());
                    self.finish(&mut run, job, outcome, None, sink, summary)?;
                }
                return Ok(());
            }
        };

        let submitted_at = Utc::now();
        let tasks: Vec<SubmittedTask> = batch
            .iter()
            .cloned()
            .zip(task_ids)
            .map(|(job, task_id)| SubmittedTask { job, task_id, submitted_at })
            .collect();

        info!("Waiting for the provider to process {} tasks", tasks.len());
        let mut cancelled = !self.pause.pause(self.settings.dwell(), &self.cancel);

        // First pass: one fetch per task, even when cancelled during the dwell,
        // so already-paid results are not thrown away.
        let mut pending: Vec<(SubmittedTask, Option<Value>)> = Vec::new();
        for task in tasks {
            match classify(self.api.fetch_result(&task.task_id)) {
                Poll::Terminal(outcome, raw) => {
                    self.finish(&mut run, &task.job, outcome, raw, sink, summary)?
                }
                Poll::Pending(raw) => {
                    info!("Result not ready yet for {:?}, will retry", task.job.keyword);
                    pending.push((task, raw));
                }
            }
        }

        let rounds = self.settings.retry_rounds;
        for round in 1..=rounds {
            if pending.is_empty() || cancelled {
                break;
            }
            if !self.pause.pause(self.settings.retry_interval(), &self.cancel) {
                cancelled = true;
                break;
            }
            info!("Retry round {}/{} for {} pending tasks", round, rounds, pending.len());

            let mut still_pending = Vec::new();
            for (task, last_raw) in pending {
                match classify(self.api.fetch_result(&task.task_id)) {
                    Poll::Terminal(outcome, raw) => {
                        self.finish(&mut run, &task.job, outcome, raw.or(last_raw), sink, summary)?
                    }
                    Poll::Pending(raw) => still_pending.push((task, raw.or(last_raw))),
                }
            }
            pending = still_pending;
        }

        if !pending.is_empty() {
            let reason = if cancelled { CANCELLED } else { NOT_FOUND_TIMED_OUT };
            warn!("{} tasks still pending, marking as {:?}", pending.len(), reason);
            for (task, last_raw) in pending {
                let outcome = TaskOutcome::Failed(reason.to_string());
                self.finish(&mut run, &task.job, outcome, last_raw, sink, summary)?;
            }
        }

        debug_assert!(run.pending_rows().is_empty());
        Ok(())
    }

    /// Submits a batch and checks that every job got exactly one task id, so
    /// ids can be paired with jobs by position.
    fn submit(&self, batch: &[KeywordJob]) -> Result<Vec<String>> {
        let ids = self.api.submit_batch(batch)?;
        if ids.len() != batch.len() {
            return Err(Error::Submission(format!(
                "provider returned {} task ids for {} keywords",
                ids.len(),
                batch.len()
            )));
        }
        Ok(ids)
    }

    fn finish<S: ResultSink>(
        &self,
        run: &mut BatchRun,
        job: &KeywordJob,
        outcome: TaskOutcome,
        raw: Option<Value>,
        sink: &mut S,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if !run.transition(job.source_row_id, outcome.clone()) {
            return Ok(());
        }
        log_outcome(job, &outcome);
        summary.record(&outcome);
        sink.write_outcome(OutcomeRecord::new(job, outcome, raw))?;
        Ok(())
    }

    /// Incremental mode, submit half: submits the next batch of unfinished
    /// jobs after the persisted cursor and advances the cursor.
    pub fn submit_phase<S>(&self, jobs: &[KeywordJob], sink: &mut S) -> Result<SubmitReport>
    where
        S: ResultSink + TaskLedger,
    {
        self.check_settings()?;
        sink.setup()?;

        let mut summary = RunSummary::default();
        let cap = match self.settings.limit {
            Some(limit) => limit.min(self.settings.batch_size),
            None => self.settings.batch_size,
        };

        let start = sink.cursor().min(jobs.len());
        let mut idx = start;
        let mut selected = Vec::new();
        while idx < jobs.len() && selected.len() < cap {
            let job = &jobs[idx];
            idx += 1;
            let row = job.source_row_id;
            if sink.is_terminal(row) || sink.has_open_task(row) {
                summary.skipped += 1;
                continue;
            }
            selected.push(job.clone());
        }

        if selected.is_empty() {
            info!("Nothing to submit from position {}; resetting cursor", start);
            sink.set_cursor(0)?;
            return Ok(SubmitReport { summary, submitted: 0, next_cursor: 0, has_more: false });
        }

        if self.cancel.is_cancelled() {
            warn!("Cancelled before submitting, cursor stays at {}", start);
            return Ok(SubmitReport { summary, submitted: 0, next_cursor: start, has_more: true });
        }

        let batch_id = Uuid::new_v4();
        info!("Submit phase {}: {} keywords from position {}", batch_id, selected.len(), start);
        summary.processed = selected.len();

        let submitted = match self.submit(&selected) {
            Ok(ids) => {
                let submitted_at = Utc::now();
                let tasks: Vec<SubmittedTask> = selected
                    .into_iter()
                    .zip(ids)
                    .map(|(job, task_id)| SubmittedTask { job, task_id, submitted_at })
                    .collect();
                sink.record_submitted(batch_id, &tasks)?;
                tasks.len()
            }
            Err(e) => {
                error!("Batch submission failed: {}", e);
                for job in &selected {
                    let outcome = TaskOutcome::Failed(SUBMISSION_FAILED.to_string());
                    log_outcome(job, &outcome);
                    summary.record(&outcome);
                    sink.write_outcome(OutcomeRecord::new(job, outcome, None))?;
                }
                0
            }
        };

        sink.set_cursor(idx)?;
        sink.flush()?;
        let has_more = idx < jobs.len();
        info!("Submit phase done: {} submitted, next position {}, more: {}", submitted, idx, has_more);
        Ok(SubmitReport { summary, submitted, next_cursor: idx, has_more })
    }

    /// Incremental mode, fetch half: polls every open task once. A task that
    /// has been polled `retry_rounds + 1` times without a match is finalized.
    pub fn fetch_phase<S>(&self, sink: &mut S) -> Result<FetchReport>
    where
        S: ResultSink + TaskLedger,
    {
        sink.setup()?;
        let mut summary = RunSummary::default();
        let mut still_pending = 0;
        let max_polls = self.settings.retry_rounds + 1;

        let open = sink.open_tasks();
        info!("Fetch phase: {} open tasks", open.len());

        for (i, entry) in open.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Cancelled, {} tasks left open for the next fetch", open.len() - i);
                still_pending += open.len() - i;
                break;
            }
            let task = &entry.task;
            let row = task.job.source_row_id;
            if sink.is_terminal(row) {
                sink.update_task(&task.task_id, LedgerStatus::Failed, entry.attempts)?;
                summary.skipped += 1;
                continue;
            }

            summary.processed += 1;
            let attempts = entry.attempts + 1;
            let (outcome, raw) = match classify(self.api.fetch_result(&task.task_id)) {
                Poll::Terminal(outcome, raw) => (outcome, raw),
                Poll::Pending(raw) if attempts >= max_polls => {
                    (TaskOutcome::Failed(NOT_FOUND_TIMED_OUT.to_string()), raw)
                }
                Poll::Pending(_) => {
                    sink.update_task(&task.task_id, LedgerStatus::Pending, attempts)?;
                    still_pending += 1;
                    continue;
                }
            };

            let status = match outcome {
                TaskOutcome::Completed(_) => LedgerStatus::Fetched,
                _ => LedgerStatus::Failed,
            };
            log_outcome(&task.job, &outcome);
            summary.record(&outcome);
            sink.write_outcome(OutcomeRecord::new(&task.job, outcome, raw))?;
            sink.update_task(&task.task_id, status, attempts)?;
        }

        sink.flush()?;
        info!("Fetch phase done. {}, still pending: {}", summary, still_pending);
        Ok(FetchReport { summary, still_pending })
    }
}

fn log_outcome(job: &KeywordJob, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Completed(m) => info!(
            "Row {} {:?}: position {} - {}",
            job.source_row_id, job.keyword, m.rank, m.url
        ),
        TaskOutcome::Failed(reason) => {
            warn!("Row {} {:?}: {}", job.source_row_id, job.keyword, reason)
        }
        TaskOutcome::Pending => {}
    }
}
