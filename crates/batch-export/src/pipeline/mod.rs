//! Chunked read-write loop.
//!
//! The pipeline pulls up to `chunk_size` rows from the reader, hands them to
//! the writer as one committed unit, and repeats until the reader runs dry.
//! The first read or write failure ends the run; chunks committed before it
//! stay on disk. Cancellation is only observed between chunks.

mod job;

pub use job::{ChunkOutcome, JobResult};

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::query::QuerySpec;
use crate::reader::PaginatedReader;
use crate::source::PageSource;
use crate::writer::{ChunkWriter, FieldExtractor, OutputTarget, OutputWriter};

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rows per committed chunk.
    pub chunk_size: usize,
}

impl PipelineConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

/// Drives one export from reader to writer.
pub struct ChunkPipeline {
    config: PipelineConfig,
}

impl ChunkPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run to completion, failure or cancellation. Failures are captured in
    /// the result; the writer is closed on every path.
    pub async fn run<W: ChunkWriter>(
        &self,
        reader: &mut PaginatedReader,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> JobResult {
        let started = Instant::now();
        let mut result = JobResult::default();

        match writer.write_header().await {
            Ok(()) => self.run_chunks(reader, writer, cancel, &mut result).await,
            Err(e) => {
                warn!("Header write failed: {}", e);
                result.fail(e.to_string());
            }
        }

        if let Err(e) = writer.close().await {
            warn!("Closing output failed: {}", e);
            result.fail(e.to_string());
        }

        result.total_time = started.elapsed();
        result
    }

    async fn run_chunks<W: ChunkWriter>(
        &self,
        reader: &mut PaginatedReader,
        writer: &mut W,
        cancel: &CancellationToken,
        result: &mut JobResult,
    ) {
        let chunk_size = self.config.chunk_size;
        let mut index = 0;

        loop {
            if cancel.is_cancelled() {
                info!("Stop requested, ending before chunk {}", index);
                result.stopped = true;
                return;
            }

            let read_start = Instant::now();
            let rows = match reader.read_chunk(chunk_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Chunk {} read failed: {}", index, e);
                    result.record(ChunkOutcome::failed(index, 0, e.to_string()));
                    return;
                }
            };
            result.read_time += read_start.elapsed();

            if rows.is_empty() {
                return;
            }

            let write_start = Instant::now();
            match writer.write_chunk(&rows).await {
                Ok(written) => {
                    result.write_time += write_start.elapsed();
                    result.record(ChunkOutcome::committed(index, written));
                    info!(
                        "Committed chunk {} ({} rows, {} total)",
                        index, written, result.rows_written
                    );
                }
                Err(e) => {
                    warn!("Chunk {} write failed: {}", index, e);
                    result.record(ChunkOutcome::failed(index, rows.len(), e.to_string()));
                    return;
                }
            }

            index += 1;
        }
    }
}

/// Build a fresh reader and writer for one job and run the pipeline.
///
/// Fails only if the output cannot be opened; everything after that is
/// reported through the returned [`JobResult`].
pub async fn run_export(
    source: Arc<dyn PageSource>,
    query: QuerySpec,
    target: &OutputTarget,
    extractor: FieldExtractor,
    page_size: usize,
    config: PipelineConfig,
    cancel: &CancellationToken,
) -> Result<JobResult> {
    let mut writer = OutputWriter::open(target, extractor).await?;
    let mut reader = PaginatedReader::open(source, query, page_size);
    Ok(ChunkPipeline::new(config)
        .run(&mut reader, &mut writer, cancel)
        .await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExportError;
    use crate::source::{Row, SqlValue};
    use crate::testing::{query, MemorySource};
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Collects chunk ids; optionally fails the nth chunk (0-based).
    #[derive(Default)]
    struct RecordingWriter {
        header_calls: usize,
        chunks: Vec<Vec<i64>>,
        fail_on_chunk: Option<usize>,
        attempts: usize,
        closed: bool,
    }

    #[async_trait]
    impl ChunkWriter for RecordingWriter {
        async fn write_header(&mut self) -> Result<()> {
            self.header_calls += 1;
            Ok(())
        }

        async fn write_chunk(&mut self, rows: &[Row]) -> Result<usize> {
            let attempt = self.attempts;
            self.attempts += 1;
            if self.fail_on_chunk == Some(attempt) {
                return Err(ExportError::write("/dev/full", "No space left on device"));
            }
            self.chunks
                .push(rows.iter().map(|r| r.sort_key("id").unwrap()).collect());
            Ok(rows.len())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    fn reader(n: i64, page_size: usize) -> PaginatedReader {
        PaginatedReader::open(Arc::new(MemorySource::with_ids(1..=n)), query(), page_size)
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceiling() {
        for (n, c, expected) in [(0, 3, 0), (1, 3, 1), (3, 3, 1), (7, 3, 3), (30, 3, 10)] {
            let mut writer = RecordingWriter::default();
            let result = ChunkPipeline::new(PipelineConfig::new(c))
                .run(&mut reader(n, 2), &mut writer, &CancellationToken::new())
                .await;

            assert!(result.is_success());
            assert_eq!(result.committed_chunks(), expected, "n={} c={}", n, c);
            assert_eq!(result.rows_written, n as u64);
            assert_eq!(writer.header_calls, 1);
            assert!(writer.closed);
        }
    }

    #[tokio::test]
    async fn test_last_chunk_is_partial() {
        let mut writer = RecordingWriter::default();
        ChunkPipeline::new(PipelineConfig::new(2))
            .run(&mut reader(3, 2), &mut writer, &CancellationToken::new())
            .await;
        assert_eq!(writer.chunks, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test]
    async fn test_write_failure_aborts_and_keeps_prior_chunks() {
        let mut writer = RecordingWriter {
            fail_on_chunk: Some(2),
            ..Default::default()
        };
        let result = ChunkPipeline::new(PipelineConfig::new(3))
            .run(&mut reader(20, 5), &mut writer, &CancellationToken::new())
            .await;

        assert!(!result.is_success());
        assert_eq!(result.committed_chunks(), 2);
        assert_eq!(result.rows_written, 6);
        assert_eq!(result.chunks.len(), 3);
        assert_eq!(writer.attempts, 3);
        assert!(result.failures[0].contains("No space left on device"));
        assert!(writer.closed);
    }

    #[tokio::test]
    async fn test_read_failure_aborts() {
        let source = Arc::new(MemorySource::with_ids(1..=10).failing_on_call(2));
        let mut reader = PaginatedReader::open(source, query(), 2);
        let mut writer = RecordingWriter::default();
        let result = ChunkPipeline::new(PipelineConfig::new(2))
            .run(&mut reader, &mut writer, &CancellationToken::new())
            .await;

        assert_eq!(writer.chunks, vec![vec![1, 2]]);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut writer = RecordingWriter::default();
        let result = ChunkPipeline::new(PipelineConfig::new(2))
            .run(&mut reader(10, 2), &mut writer, &cancel)
            .await;

        assert!(result.stopped);
        assert!(result.failures.is_empty());
        assert!(writer.chunks.is_empty());
        assert!(writer.closed);
    }

    #[tokio::test]
    async fn test_run_export_writes_file() {
        let tmp = TempDir::new().unwrap();
        let target = OutputTarget {
            directory: tmp.path().join("out"),
            filename: "users.tsv".into(),
            include_header: true,
            delimiter: '\t',
        };
        let source = Arc::new(MemorySource::from_rows(vec![
            Row::from_pairs([("id", SqlValue::Int(1)), ("name", SqlValue::from("a"))]),
            Row::from_pairs([("id", SqlValue::Int(2)), ("name", SqlValue::from("b"))]),
            Row::from_pairs([("id", SqlValue::Int(3)), ("name", SqlValue::from("c"))]),
        ]));

        let result = run_export(
            source.clone(),
            query(),
            &target,
            FieldExtractor::new(vec!["id".into(), "name".into()]),
            2,
            PipelineConfig::new(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.is_success());
        assert_eq!(result.committed_chunks(), 2);
        assert_eq!(source.calls(), 2);
        let content = std::fs::read_to_string(target.path()).unwrap();
        assert_eq!(content, "id\tname\n1\ta\n2\tb\n3\tc\n");
    }
}
