//! Per-chunk outcomes and the aggregated job result.

use std::time::Duration;

/// Outcome of one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Zero-based chunk index.
    pub index: usize,
    pub rows_read: usize,
    /// Rows committed; zero whenever `failure` is set.
    pub rows_written: usize,
    pub failure: Option<String>,
}

impl ChunkOutcome {
    pub fn committed(index: usize, rows: usize) -> Self {
        Self {
            index,
            rows_read: rows,
            rows_written: rows,
            failure: None,
        }
    }

    pub fn failed(index: usize, rows_read: usize, failure: impl Into<String>) -> Self {
        Self {
            index,
            rows_read,
            rows_written: 0,
            failure: Some(failure.into()),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct JobResult {
    /// Total rows pulled from the reader.
    pub rows_read: u64,

    /// Total rows durably written.
    pub rows_written: u64,

    /// Every chunk attempted, in order.
    pub chunks: Vec<ChunkOutcome>,

    /// Every failure cause, in the order they happened.
    pub failures: Vec<String>,

    /// Stopped on request at a chunk boundary.
    pub stopped: bool,

    /// Time spent reading from the source.
    pub read_time: Duration,

    /// Time spent writing output.
    pub write_time: Duration,

    /// Total elapsed time.
    pub total_time: Duration,
}

impl JobResult {
    /// No failure and not stopped.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.stopped
    }

    /// Chunks fully written.
    pub fn committed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_committed()).count()
    }

    /// All failure causes, one per line.
    pub fn failure_description(&self) -> String {
        self.failures.join("\n")
    }

    pub(crate) fn record(&mut self, outcome: ChunkOutcome) {
        self.rows_read += outcome.rows_read as u64;
        self.rows_written += outcome.rows_written as u64;
        if let Some(failure) = &outcome.failure {
            self.failures.push(failure.clone());
        }
        self.chunks.push(outcome);
    }

    /// Record a failure that belongs to no chunk (header, close).
    pub(crate) fn fail(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }
}
