use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{OutcomeRecord, RowId, SubmittedTask};

/// Where job outcomes land. Writes are per job so a crash mid-batch keeps
/// everything already recorded.
pub trait ResultSink {
    /// Prepares the sink. Safe to call any number of times.
    fn setup(&mut self) -> Result<()>;

    /// The stored record for `row` if it is terminal.
    fn terminal_outcome(&self, row: RowId) -> Option<&OutcomeRecord>;

    /// Stores a record. A row that already holds a terminal record is left
    /// untouched and `Ok(false)` is returned.
    fn write_outcome(&mut self, record: OutcomeRecord) -> Result<bool>;

    fn flush(&mut self) -> Result<()>;

    fn is_terminal(&self, row: RowId) -> bool {
        self.terminal_outcome(row).is_some()
    }
}

/// Persistent state for the incremental submit/fetch phases: the resume
/// cursor into the job list and the ledger of submitted tasks.
pub trait TaskLedger {
    fn cursor(&self) -> usize;
    fn set_cursor(&mut self, cursor: usize) -> Result<()>;
    fn record_submitted(&mut self, batch_id: Uuid, tasks: &[SubmittedTask]) -> Result<()>;
    /// Tasks that still need fetching, in submission order.
    fn open_tasks(&self) -> Vec<LedgerEntry>;
    fn update_task(&mut self, task_id: &str, status: LedgerStatus, attempts: u32) -> Result<()>;
    /// True when `row` has a task in the ledger that is still open.
    fn has_open_task(&self, row: RowId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Submitted,
    Pending,
    Fetched,
    Failed,
}

impl LedgerStatus {
    pub fn is_open(self) -> bool {
        matches!(self, LedgerStatus::Submitted | LedgerStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub batch_id: Uuid,
    pub task: SubmittedTask,
    pub status: LedgerStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything a sink keeps, serialized as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub cursor: usize,
    #[serde(default)]
    pub outcomes: BTreeMap<RowId, OutcomeRecord>,
    #[serde(default)]
    pub tasks: Vec<LedgerEntry>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn terminal(&self, row: RowId) -> Option<&OutcomeRecord> {
        self.outcomes.get(&row).filter(|r| r.outcome.is_terminal())
    }

    fn put(&mut self, record: OutcomeRecord) -> bool {
        if self.terminal(record.row_id).is_some() {
            warn!("Row {} already has a terminal outcome, not overwriting", record.row_id);
            return false;
        }
        self.outcomes.insert(record.row_id, record);
        self.updated_at = Some(Utc::now());
        true
    }

    fn push_tasks(&mut self, batch_id: Uuid, tasks: &[SubmittedTask]) {
        let known: HashSet<String> = self.tasks.iter().map(|t| t.task.task_id.clone()).collect();
        let fresh: Vec<SubmittedTask> =
            tasks.iter().filter(|t| !known.contains(&t.task_id)).cloned().collect();
        self.tasks.extend(fresh.into_iter().map(|task| LedgerEntry {
            batch_id,
            task,
            status: LedgerStatus::Submitted,
            attempts: 0,
            completed_at: None,
        }));
        self.updated_at = Some(Utc::now());
    }

    fn open(&self) -> Vec<LedgerEntry> {
        self.tasks.iter().filter(|t| t.status.is_open()).cloned().collect()
    }

    fn update(&mut self, task_id: &str, status: LedgerStatus, attempts: u32) {
        match self.tasks.iter_mut().find(|t| t.task.task_id == task_id) {
            Some(entry) => {
                entry.status = status;
                entry.attempts = attempts;
                if !status.is_open() {
                    entry.completed_at = Some(Utc::now());
                }
                self.updated_at = Some(Utc::now());
            }
            None => warn!("Task {} is not in the ledger", task_id),
        }
    }

    fn open_for(&self, row: RowId) -> bool {
        self.tasks
            .iter()
            .any(|t| t.task.job.source_row_id == row && t.status.is_open())
    }
}

/// One state change, appended to the journal as a JSON line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry {
    Outcome { record: OutcomeRecord },
    Submitted { batch_id: Uuid, tasks: Vec<SubmittedTask> },
    Task { task_id: String, status: LedgerStatus, attempts: u32 },
    Cursor { cursor: usize },
}

impl RunState {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Outcome { record } => {
                self.put(record);
            }
            JournalEntry::Submitted { batch_id, tasks } => self.push_tasks(batch_id, &tasks),
            JournalEntry::Task { task_id, status, attempts } => {
                self.update(&task_id, status, attempts)
            }
            JournalEntry::Cursor { cursor } => self.cursor = cursor,
        }
    }
}

/// JSON state file plus an append-only journal next to it (`<name>.journal`).
///
/// Every write appends one line to the journal before returning. `flush`
/// folds the journal into the snapshot and empties it, so per-job writes
/// cost one line instead of a rewrite of the whole document.
pub struct StateFileSink {
    path: PathBuf,
    journal_path: PathBuf,
    journal: Option<File>,
    state: RunState,
}

impl StateFileSink {
    /// Opens (or starts) the state file at `path` and replays its journal. A
    /// snapshot that exists but cannot be parsed is an error rather than
    /// silently discarded.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let journal_path = journal_path(&path);
        let mut state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            info!("No state file at {:?}. Starting fresh.", path);
            RunState::default()
        };
        let replayed = replay(&journal_path, &mut state)?;
        if path.exists() || replayed > 0 {
            info!(
                "Resumed state from {:?}: {} outcomes, {} tasks, cursor {} ({} journal entries)",
                path,
                state.outcomes.len(),
                state.tasks.len(),
                state.cursor,
                replayed
            );
        }
        Ok(StateFileSink { path, journal_path, journal: None, state })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        if self.journal.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.journal_path)?;
            self.journal = Some(file);
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        if let Some(file) = self.journal.as_mut() {
            file.write_all(&line)?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!("State saved to {:?}", self.path);
        Ok(())
    }

    /// Writes the snapshot, then empties the journal. A crash in between
    /// only means entries get replayed onto a state that already has them.
    fn compact(&mut self) -> Result<()> {
        self.save()?;
        self.journal = None;
        if self.journal_path.exists() {
            File::create(&self.journal_path)?;
        }
        Ok(())
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".journal");
    path.with_file_name(name)
}

/// Applies every journal line to `state`. A torn last line (the process died
/// mid-append) is dropped with a warning.
fn replay(journal_path: &Path, state: &mut RunState) -> Result<usize> {
    if !journal_path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(journal_path)?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut applied = 0;
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => {
                state.apply(entry);
                applied += 1;
            }
            Err(e) if i + 1 == lines.len() => {
                warn!("Dropping incomplete last journal entry in {:?}: {}", journal_path, e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(applied)
}

impl ResultSink for StateFileSink {
    fn setup(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if !self.path.exists() {
            self.compact()?;
        }
        Ok(())
    }

    fn terminal_outcome(&self, row: RowId) -> Option<&OutcomeRecord> {
        self.state.terminal(row)
    }

    fn write_outcome(&mut self, record: OutcomeRecord) -> Result<bool> {
        if self.state.terminal(record.row_id).is_some() {
            warn!("Row {} already has a terminal outcome, not overwriting", record.row_id);
            return Ok(false);
        }
        let entry = JournalEntry::Outcome { record };
        self.append(&entry)?;
        self.state.apply(entry);
        Ok(true)
    }

    fn flush(&mut self) -> Result<()> {
        self.compact()
    }
}

impl TaskLedger for StateFileSink {
    fn cursor(&self) -> usize {
        self.state.cursor
    }

    fn set_cursor(&mut self, cursor: usize) -> Result<()> {
        let entry = JournalEntry::Cursor { cursor };
        self.append(&entry)?;
        self.state.apply(entry);
        Ok(())
    }

    fn record_submitted(&mut self, batch_id: Uuid, tasks: &[SubmittedTask]) -> Result<()> {
        let entry = JournalEntry::Submitted { batch_id, tasks: tasks.to_vec() };
        self.append(&entry)?;
        self.state.apply(entry);
        Ok(())
    }

    fn open_tasks(&self) -> Vec<LedgerEntry> {
        self.state.open()
    }

    fn update_task(&mut self, task_id: &str, status: LedgerStatus, attempts: u32) -> Result<()> {
        let entry = JournalEntry::Task { task_id: task_id.to_string(), status, attempts };
        self.append(&entry)?;
        self.state.apply(entry);
        Ok(())
    }

    fn has_open_task(&self, row: RowId) -> bool {
        self.state.open_for(row)
    }
}

/// In-memory sink, for library callers that persist elsewhere and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub state: RunState,
    /// Number of accepted outcome writes.
    pub writes: usize,
    pub flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn outcome(&self, row: RowId) -> Option<&OutcomeRecord> {
        self.state.outcomes.get(&row)
    }
}

impl ResultSink for MemorySink {
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn terminal_outcome(&self, row: RowId) -> Option<&OutcomeRecord> {
        self.state.terminal(row)
    }

    fn write_outcome(&mut self, record: OutcomeRecord) -> Result<bool> {
        let accepted = self.state.put(record);
        if accepted {
            self.writes += 1;
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

impl TaskLedger for MemorySink {
    fn cursor(&self) -> usize {
        self.state.cursor
    }

    fn set_cursor(&mut self, cursor: usize) -> Result<()> {
        self.state.cursor = cursor;
        Ok(())
    }

    fn record_submitted(&mut self, batch_id: Uuid, tasks: &[SubmittedTask]) -> Result<()> {
        self.state.push_tasks(batch_id, tasks);
        Ok(())
    }

    fn open_tasks(&self) -> Vec<LedgerEntry> {
        self.state.open()
    }

    fn update_task(&mut self, task_id: &str, status: LedgerStatus, attempts: u32) -> Result<()> {
        self.state.update(task_id, status, attempts);
        Ok(())
    }

    fn has_open_task(&self, row: RowId) -> bool {
        self.state.open_for(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KeywordJob, RankingMatch, TaskOutcome};

    fn job(row: u64) -> KeywordJob {
        KeywordJob::new(format!("kw {}", row), 32.7, -96.8, row)
    }

    fn completed(row: u64, rank: u32) -> OutcomeRecord {
        OutcomeRecord::new(
            &job(row),
            TaskOutcome::Completed(RankingMatch { rank, url: "https://example.com".into() }),
            None,
        )
    }

    #[test]
    fn terminal_records_are_written_once() {
        let mut sink = MemorySink::new();
        assert!(sink.write_outcome(completed(2, 3)).unwrap());
        assert!(!sink.write_outcome(completed(2, 1)).unwrap());
        assert_eq!(sink.writes, 1);
        match &sink.outcome(RowId(2)).unwrap().outcome {
            TaskOutcome::Completed(m) => assert_eq!(m.rank, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn pending_records_are_not_terminal() {
        let mut sink = MemorySink::new();
        sink.write_outcome(OutcomeRecord::new(&job(4), TaskOutcome::Pending, None)).unwrap();
        assert!(!sink.is_terminal(RowId(4)));
        assert!(sink.write_outcome(completed(4, 9)).unwrap());
        assert!(sink.is_terminal(RowId(4)));
    }

    #[test]
    fn state_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut sink = StateFileSink::open(&path).unwrap();
        sink.setup().unwrap();
        sink.setup().unwrap();
        assert!(path.exists());

        sink.write_outcome(completed(5, 2)).unwrap();
        let task = SubmittedTask { job: job(6), task_id: "t-6".into(), submitted_at: Utc::now() };
        sink.record_submitted(Uuid::new_v4(), &[task]).unwrap();
        sink.set_cursor(6).unwrap();

        let reopened = StateFileSink::open(&path).unwrap();
        assert!(reopened.is_terminal(RowId(5)));
        assert_eq!(reopened.cursor(), 6);
        assert!(reopened.has_open_task(RowId(6)));
        assert_eq!(reopened.open_tasks().len(), 1);
    }

    #[test]
    fn closing_a_task_removes_it_from_open_tasks() {
        let mut sink = MemorySink::new();
        let task = SubmittedTask { job: job(3), task_id: "t-3".into(), submitted_at: Utc::now() };
        sink.record_submitted(Uuid::new_v4(), &[task]).unwrap();
        sink.update_task("t-3", LedgerStatus::Pending, 1).unwrap();
        assert_eq!(sink.open_tasks()[0].attempts, 1);
        sink.update_task("t-3", LedgerStatus::Fetched, 2).unwrap();
        assert!(sink.open_tasks().is_empty());
        assert!(!sink.has_open_task(RowId(3)));
        assert!(sink.state.tasks[0].completed_at.is_some());
    }

    #[test]
    fn per_job_writes_only_append_to_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut sink = StateFileSink::open(&path).unwrap();
        sink.setup().unwrap();
        let snapshot_len = fs::metadata(&path).unwrap().len();

        let payload = serde_json::json!({ "items": "x".repeat(10_000) });
        for row in 1..=5 {
            let record = OutcomeRecord::new(
                &job(row),
                TaskOutcome::Failed("not found / timed out".into()),
                Some(payload.clone()),
            );
            assert!(sink.write_outcome(record).unwrap());
        }

        assert_eq!(fs::metadata(&path).unwrap().len(), snapshot_len);
        let journal = fs::read_to_string(sink.journal_path()).unwrap();
        assert_eq!(journal.lines().count(), 5);

        sink.flush().unwrap();
        assert_eq!(fs::metadata(sink.journal_path()).unwrap().len(), 0);
        let reopened = StateFileSink::open(&path).unwrap();
        assert_eq!(reopened.state().outcomes.len(), 5);
    }

    #[test]
    fn torn_last_journal_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut sink = StateFileSink::open(&path).unwrap();
        sink.setup().unwrap();
        sink.write_outcome(completed(2, 4)).unwrap();
        sink.set_cursor(3).unwrap();

        let mut journal = OpenOptions::new().append(true).open(sink.journal_path()).unwrap();
        journal.write_all(b"{\"kind\":\"outco").unwrap();

        let reopened = StateFileSink::open(&path).unwrap();
        assert!(reopened.is_terminal(RowId(2)));
        assert_eq!(reopened.cursor(), 3);
    }

    #[test]
    fn replaying_entries_already_in_the_snapshot_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut sink = StateFileSink::open(&path).unwrap();
        sink.setup().unwrap();
        let task = SubmittedTask { job: job(7), task_id: "t-7".into(), submitted_at: Utc::now() };
        sink.record_submitted(Uuid::new_v4(), &[task]).unwrap();
        sink.write_outcome(completed(8, 1)).unwrap();
        let journal = fs::read_to_string(sink.journal_path()).unwrap();

        // Snapshot written but the journal was never emptied.
        sink.flush().unwrap();
        fs::write(sink.journal_path(), journal).unwrap();

        let reopened = StateFileSink::open(&path).unwrap();
        assert_eq!(reopened.state().tasks.len(), 1);
        assert_eq!(reopened.state().outcomes.len(), 1);
    }

    #[test]
    fn corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(StateFileSink::open(&path).is_err());
    }
}
