//! Job execution records and their store.

mod listener;

pub use listener::{JobListener, LoggingListener};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{ExportError, Result};

/// Exit description given to records left running by a previous process.
pub const ABANDONED_DESCRIPTION: &str = "abandoned: process restarted";

/// Lifecycle status of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stopped
        )
    }

    /// Allowed moves: STARTING -> STARTED, and any running status to a
    /// terminal one. Nothing leaves a terminal status.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        match self {
            BatchStatus::Starting => matches!(
                next,
                BatchStatus::Started | BatchStatus::Failed | BatchStatus::Stopped
            ),
            BatchStatus::Started => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code and free-text description of an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    fn new(code: &str, description: impl Into<String>) -> Self {
        Self {
            exit_code: code.to_string(),
            exit_description: description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new("UNKNOWN", "")
    }

    pub fn executing() -> Self {
        Self::new("EXECUTING", "")
    }

    pub fn completed() -> Self {
        Self::new("COMPLETED", "")
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new("FAILED", description)
    }

    pub fn stopped() -> Self {
        Self::new("STOPPED", "")
    }

    /// Default exit status for a batch status.
    pub fn for_status(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Starting => Self::unknown(),
            BatchStatus::Started => Self::executing(),
            BatchStatus::Completed => Self::completed(),
            BatchStatus::Failed => Self::failed(""),
            BatchStatus::Stopped => Self::stopped(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == "COMPLETED"
    }
}

/// Parameters a job was launched with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameters {
    /// Makes every launch unique: launch time plus a random token.
    #[serde(rename = "run.id")]
    pub run_id: String,

    /// Caller-supplied filter, empty when absent.
    pub where_clause: String,

    /// Caller-supplied filename, empty when absent.
    pub filename: String,

    /// Filter actually applied.
    pub resolved_where_clause: String,

    /// File actually written.
    pub output_path: String,
}

/// One tracked run of the export pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub job_id: u64,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub exit_status: ExitStatus,
    pub parameters: JobParameters,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_causes: Vec<String>,
}

impl JobExecution {
    fn new(job_id: u64, parameters: JobParameters) -> Self {
        Self {
            job_id,
            status: BatchStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            exit_status: ExitStatus::unknown(),
            parameters,
            rows_written: 0,
            failure_causes: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Mapping of job id to execution record.
///
/// The only state shared between concurrent jobs. Each record is written by
/// the run that owns it and read by anyone. With a state file configured,
/// every change is saved as a JSON snapshot.
pub struct ExecutionStore {
    records: RwLock<BTreeMap<u64, JobExecution>>,
    next_id: AtomicU64,
    state_file: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore {
    /// In-memory store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            state_file: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Read the records saved at `path` without modifying the file.
    /// A missing file holds no records.
    pub async fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Vec<JobExecution>> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Store backed by `path`, loading records left by earlier processes.
    /// Records that never reached a terminal status are marked FAILED.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut records = BTreeMap::new();

        for mut record in Self::load_snapshot(&path).await? {
            if record.is_running() {
                warn!(
                    "Job {} was {} when the process stopped, marking FAILED",
                    record.job_id, record.status
                );
                record.status = BatchStatus::Failed;
                record.end_time = Some(Utc::now());
                record.exit_status = ExitStatus::failed(ABANDONED_DESCRIPTION);
                record.failure_causes.push(ABANDONED_DESCRIPTION.to_string());
            }
            records.insert(record.job_id, record);
        }
        info!("Loaded {} job executions from {}", records.len(), path.display());

        let snapshot: Vec<JobExecution> = records.values().cloned().collect();
        let save_path = path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&save_path, &snapshot))
            .await
            .map_err(std::io::Error::other)??;

        let next_id = records.keys().next_back().map_or(1, |id| id + 1);
        Ok(Self {
            records: RwLock::new(records),
            next_id: AtomicU64::new(next_id),
            state_file: Some(path),
            save_lock: Mutex::new(()),
        })
    }

    /// Create a STARTING record with a fresh id.
    pub async fn create(&self, parameters: JobParameters) -> JobExecution {
        let job_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = JobExecution::new(job_id, parameters);
        self.records.write().await.insert(job_id, record.clone());
        self.persist().await;
        record
    }

    /// Move a record to `status`, apply `update` to it, and save.
    ///
    /// The exit status is reset to the default for `status` before `update`
    /// runs; a terminal status also sets the end time. Returns `None` for an
    /// unknown id.
    pub async fn transition<F>(
        &self,
        job_id: u64,
        status: BatchStatus,
        update: F,
    ) -> Result<Option<JobExecution>>
    where
        F: FnOnce(&mut JobExecution),
    {
        let updated = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&job_id) else {
                return Ok(None);
            };
            if !record.status.can_transition_to(status) {
                return Err(ExportError::InvalidTransition {
                    job_id,
                    from: record.status,
                    to: status,
                });
            }

            record.status = status;
            record.exit_status = ExitStatus::for_status(status);
            if status.is_terminal() {
                record.end_time = Some(Utc::now());
            }
            update(record);
            record.clone()
        };

        self.persist().await;
        Ok(Some(updated))
    }

    pub async fn get(&self, job_id: u64) -> Option<JobExecution> {
        self.records.read().await.get(&job_id).cloned()
    }

    /// Every record, oldest first.
    pub async fn list(&self) -> Vec<JobExecution> {
        self.records.read().await.values().cloned().collect()
    }

    /// Save a snapshot if a state file is configured. Failures are logged;
    /// the in-memory records stay authoritative.
    async fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let _guard = self.save_lock.lock().await;
        let snapshot = self.list().await;
        let path = path.clone();
        let saved = tokio::task::spawn_blocking(move || write_snapshot(&path, &snapshot)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save job executions: {}", e),
            Err(e) => warn!("Job execution save task failed: {}", e),
        }
    }
}

fn write_snapshot(path: &Path, records: &[JobExecution]) -> Result<()> {
    let content = serde_json::to_string_pretty(records)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn params(where_clause: &str) -> JobParameters {
        JobParameters {
            run_id: "2024-01-01T00:00:00Z-test".into(),
            where_clause: where_clause.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_transition_rules() {
        use BatchStatus::*;
        assert!(Starting.can_transition_to(Started));
        assert!(Starting.can_transition_to(Failed));
        assert!(!Starting.can_transition_to(Completed));
        assert!(Started.can_transition_to(Completed));
        assert!(Started.can_transition_to(Failed));
        assert!(Started.can_transition_to(Stopped));
        assert!(!Started.can_transition_to(Starting));
        for terminal in [Completed, Failed, Stopped] {
            for next in [Starting, Started, Completed, Failed, Stopped] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&BatchStatus::Starting).unwrap(), "\"STARTING\"");
        assert_eq!(BatchStatus::Stopped.to_string(), "STOPPED");
    }

    #[test]
    fn test_execution_json_shape() {
        let mut record = JobExecution::new(7, params("age > 30"));
        record.exit_status = ExitStatus::failed("boom");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["jobId"], 7);
        assert_eq!(json["status"], "STARTING");
        assert_eq!(json["exitCode"], "FAILED");
        assert_eq!(json["exitDescription"], "boom");
        assert_eq!(json["parameters"]["run.id"], "2024-01-01T00:00:00Z-test");
        assert_eq!(json["parameters"]["whereClause"], "age > 30");
        assert!(json["endTime"].is_null());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = ExecutionStore::new();
        let created = store.create(params("")).await;
        assert_eq!(created.status, BatchStatus::Starting);
        assert_eq!(created.exit_status.exit_code, "UNKNOWN");

        let started = store
            .transition(created.job_id, BatchStatus::Started, |_| {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.exit_status.exit_code, "EXECUTING");
        assert!(started.end_time.is_none());

        let done = store
            .transition(created.job_id, BatchStatus::Completed, |r| r.rows_written = 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.exit_status, ExitStatus::completed());
        assert!(done.end_time.is_some());
        assert_eq!(done.rows_written, 3);

        let err = store
            .transition(created.job_id, BatchStatus::Failed, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::InvalidTransition { .. }));
        assert_eq!(store.get(created.job_id).await.unwrap(), done);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = ExecutionStore::new();
        assert!(store.get(42).await.is_none());
        assert!(store
            .transition(42, BatchStatus::Started, |_| {})
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = std::sync::Arc::new(ExecutionStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(params("same")).await.job_id })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
        assert_eq!(store.list().await.len(), 8);
    }

    #[tokio::test]
    async fn test_persist_and_reload_marks_abandoned() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/executions.json");

        {
            let store = ExecutionStore::open(&path).await.unwrap();
            let done = store.create(params("a")).await;
            store
                .transition(done.job_id, BatchStatus::Started, |_| {})
                .await
                .unwrap();
            store
                .transition(done.job_id, BatchStatus::Completed, |_| {})
                .await
                .unwrap();

            let running = store.create(params("b")).await;
            store
                .transition(running.job_id, BatchStatus::Started, |_| {})
                .await
                .unwrap();
        }

        let store = ExecutionStore::open(&path).await.unwrap();
        let records = store.list().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, BatchStatus::Completed);
        assert_eq!(records[1].status, BatchStatus::Failed);
        assert_eq!(records[1].exit_status.exit_description, ABANDONED_DESCRIPTION);
        assert!(records[1].end_time.is_some());

        let next = store.create(params("c")).await;
        assert_eq!(next.job_id, 3);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("executions.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ExecutionStore::open(&path).await,
            Err(ExportError::Json(_))
        ));
        assert!(matches!(
            ExecutionStore::load_snapshot(&path).await,
            Err(ExportError::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_load_snapshot_leaves_running_records_untouched() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("executions.json");
        assert!(ExecutionStore::load_snapshot(&path).await.unwrap().is_empty());
        assert!(!path.exists());

        let mut running = JobExecution::new(4, params("live"));
        running.status = BatchStatus::Started;
        running.exit_status = ExitStatus::executing();
        std::fs::write(&path, serde_json::to_string_pretty(&vec![running]).unwrap()).unwrap();
        let before = std::fs::read(&path).unwrap();

        let records = ExecutionStore::load_snapshot(&path).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BatchStatus::Started);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
