use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SUBMISSION_FAILED: &str = "submission failed";
pub const NOT_FOUND_TIMED_OUT: &str = "not found / timed out";
pub const CANCELLED: &str = "cancelled";

/// Ties a job back to the row (or record) it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordJob {
    pub keyword: String,
    pub latitude: f64,
    pub longitude: f64,
    pub source_row_id: RowId,
}

impl KeywordJob {
    pub fn new(keyword: impl Into<String>, latitude: f64, longitude: f64, row: u64) -> Self {
        KeywordJob {
            keyword: keyword.into(),
            latitude,
            longitude,
            source_row_id: RowId(row),
        }
    }

    /// `"lat,lng"` as the provider expects it.
    pub fn location_coordinate(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedTask {
    pub job: KeywordJob,
    pub task_id: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingMatch {
    pub rank: u32,
    pub url: String,
}

/// Lowest rank wins; on a tie the first one seen is kept.
pub fn best_match(matches: &[RankingMatch]) -> Option<&RankingMatch> {
    matches.iter().fold(None, |best: Option<&RankingMatch>, current| match best {
        Some(b) if b.rank <= current.rank => Some(b),
        _ => Some(current),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Pending,
    Completed(RankingMatch),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Pending)
    }

    /// Short machine-readable label used in exports and logs.
    pub fn status_label(&self) -> &'static str {
        match self {
            TaskOutcome::Pending => "pending",
            TaskOutcome::Completed(_) => "success",
            TaskOutcome::Failed(reason) if reason == NOT_FOUND_TIMED_OUT => "not_found",
            TaskOutcome::Failed(reason) if reason == SUBMISSION_FAILED => "submission_failed",
            TaskOutcome::Failed(reason) if reason == CANCELLED => "cancelled",
            TaskOutcome::Failed(_) => "error",
        }
    }
}

/// What the sink stores for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub row_id: RowId,
    pub keyword: String,
    pub outcome: TaskOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn new(job: &KeywordJob, outcome: TaskOutcome, raw_payload: Option<serde_json::Value>) -> Self {
        OutcomeRecord {
            row_id: job.source_row_id,
            keyword: job.keyword.clone(),
            outcome,
            raw_payload,
            recorded_at: Utc::now(),
        }
    }
}

/// Jobs of one orchestrator run and the outcome each one reached.
#[derive(Debug, Default)]
pub struct BatchRun {
    pub jobs: Vec<KeywordJob>,
    pub outcomes: BTreeMap<RowId, TaskOutcome>,
}

impl BatchRun {
    pub fn new(jobs: Vec<KeywordJob>) -> Self {
        let outcomes = jobs
            .iter()
            .map(|j| (j.source_row_id, TaskOutcome::Pending))
            .collect();
        BatchRun { jobs, outcomes }
    }

    pub fn outcome(&self, row: RowId) -> Option<&TaskOutcome> {
        self.outcomes.get(&row)
    }

    /// Moves a job to `next`. Returns false (and leaves the job alone) when the
    /// job is unknown or already terminal.
    pub fn transition(&mut self, row: RowId, next: TaskOutcome) -> bool {
        match self.outcomes.get_mut(&row) {
            Some(current) if !current.is_terminal() => {
                *current = next;
                true
            }
            _ => false,
        }
    }

    pub fn pending_rows(&self) -> Vec<RowId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_terminal())
            .map(|(r, _)| *r)
            .collect()
    }
}

/// Aggregate counts reported at the end of a run or phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(_) => self.successful += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Pending => {}
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed: {}, Successful: {}, Failed: {}, Skipped: {}",
            self.processed, self.successful, self.failed, self.skipped
        )
    }
}
