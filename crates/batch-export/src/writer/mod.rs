//! Tab-delimited output with chunk-aligned commits.
//!
//! Each chunk is formatted completely in memory before any byte reaches the
//! file, then written and synced as one unit. If the write fails the file is
//! cut back to the end of the last committed chunk, so the file only ever
//! holds whole chunks.

mod extractor;

pub use extractor::{FieldExtractor, MissingField};

use std::io::SeekFrom;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::{OutputConfig, TIMESTAMP_TOKEN};
use crate::error::{ExportError, Result};
use crate::source::Row;

/// Launch timestamp format substituted for `{timestamp}`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Field delimiter. Values are written unescaped.
pub const DELIMITER: char = '\t';

/// Where and how one job writes its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub directory: PathBuf,
    pub filename: String,
    pub include_header: bool,
    pub delimiter: char,
}

impl OutputTarget {
    /// Resolve the target for a launch at `now`. An explicit, non-blank
    /// filename wins over the configured pattern.
    pub fn resolve(
        config: &OutputConfig,
        filename: Option<&str>,
        now: DateTime<Local>,
    ) -> Result<Self> {
        Ok(Self {
            directory: config.directory.clone(),
            filename: resolve_filename(filename, &config.filename_pattern, now)?,
            include_header: config.include_header,
            delimiter: DELIMITER,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

/// Pick the output filename, expanding `{timestamp}` in the pattern.
pub fn resolve_filename(
    filename: Option<&str>,
    pattern: &str,
    now: DateTime<Local>,
) -> Result<String> {
    let name = match filename.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => pattern
            .trim()
            .replace(TIMESTAMP_TOKEN, &now.format(TIMESTAMP_FORMAT).to_string()),
    };

    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ExportError::Config(format!(
            "invalid output filename '{}'",
            name
        )));
    }
    Ok(name)
}

/// Ensure the target directory and file exist and the file is writable.
///
/// Never truncates, so calling it again on a non-empty file is harmless.
pub async fn prepare_target(target: &OutputTarget) -> Result<PathBuf> {
    fs::create_dir_all(&target.directory).await.map_err(|e| {
        ExportError::Config(format!(
            "cannot create output directory {}: {}",
            target.directory.display(),
            e
        ))
    })?;

    let path = target.path();
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|e| {
            ExportError::Config(format!(
                "output file {} is not writable: {}",
                path.display(),
                e
            ))
        })?;

    Ok(path)
}

/// Destination for chunks produced by the pipeline.
#[async_trait]
pub trait ChunkWriter: Send {
    /// Emit the header line if enabled. Only the first call writes.
    async fn write_header(&mut self) -> Result<()>;

    /// Write and commit every row of a chunk, or none of them.
    async fn write_chunk(&mut self, rows: &[Row]) -> Result<usize>;

    /// Flush and release the output.
    async fn close(&mut self) -> Result<()>;
}

/// File writer for one output target.
pub struct OutputWriter {
    path: PathBuf,
    file: Option<File>,
    extractor: FieldExtractor,
    include_header: bool,
    delimiter: char,
    header_written: bool,
    started: bool,
    pending: String,
    pending_rows: usize,
    committed_len: u64,
    #[cfg(test)]
    fail_after_write: bool,
}

impl OutputWriter {
    /// Prepare the target and open it for writing. Existing content is kept
    /// until the first write.
    pub async fn open(target: &OutputTarget, extractor: FieldExtractor) -> Result<Self> {
        let path = prepare_target(target).await?;
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| ExportError::write(&path, e))?;

        Ok(Self {
            path,
            file: Some(file),
            extractor,
            include_header: target.include_header,
            delimiter: target.delimiter,
            header_written: false,
            started: false,
            pending: String::new(),
            pending_rows: 0,
            committed_len: 0,
            #[cfg(test)]
            fail_after_write: false,
        })
    }

    /// Buffer one row for the next commit.
    pub fn write_row(&mut self, row: &Row) -> Result<()> {
        let line = self
            .extractor
            .format_line(row, self.delimiter)
            .map_err(|e| ExportError::write(&self.path, e))?;
        self.pending.push_str(&line);
        self.pending_rows += 1;
        Ok(())
    }

    /// Write buffered rows and sync. On failure the file is cut back to the
    /// previous commit and the buffer is discarded.
    pub async fn commit(&mut self) -> Result<usize> {
        self.begin().await?;
        let rows = self.pending_rows;
        let buffer = std::mem::take(&mut self.pending);
        self.pending_rows = 0;

        if let Err(e) = self.append(buffer.as_bytes()).await {
            self.truncate_to_committed().await;
            return Err(e);
        }
        self.committed_len += buffer.len() as u64;
        debug!(
            "Committed {} rows to {} ({} bytes)",
            rows,
            self.path.display(),
            self.committed_len
        );
        Ok(rows)
    }

    /// Drop buffered rows without writing them.
    pub fn rollback(&mut self) {
        self.pending.clear();
        self.pending_rows = 0;
    }

    /// Truncate existing content the first time anything is written.
    async fn begin(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        let path = self.path.clone();
        let file = self.file_mut()?;
        file.set_len(0).await.map_err(|e| ExportError::write(&path, e))?;
        self.started = true;
        Ok(())
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let offset = self.committed_len;
        let path = self.path.clone();
        #[cfg(test)]
        let fail_after_write = self.fail_after_write;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| ExportError::write(&path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ExportError::write(&path, e))?;
        file.flush().await.map_err(|e| ExportError::write(&path, e))?;
        #[cfg(test)]
        if fail_after_write {
            return Err(ExportError::write(&path, "simulated sync failure"));
        }
        file.sync_data()
            .await
            .map_err(|e| ExportError::write(&path, e))?;
        Ok(())
    }

    async fn truncate_to_committed(&mut self) {
        let len = self.committed_len;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.set_len(len).await {
                warn!(
                    "Failed to cut {} back to {} bytes: {}",
                    self.path.display(),
                    len,
                    e
                );
            }
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| ExportError::write(&self.path, "writer is closed"))
    }
}

#[async_trait]
impl ChunkWriter for OutputWriter {
    async fn write_header(&mut self) -> Result<()> {
        if !self.include_header || self.header_written {
            return Ok(());
        }
        self.rollback();
        self.pending = self.extractor.header_line(self.delimiter);
        self.commit().await?;
        self.header_written = true;
        Ok(())
    }

    async fn write_chunk(&mut self, rows: &[Row]) -> Result<usize> {
        for row in rows {
            if let Err(e) = self.write_row(row) {
                self.rollback();
                return Err(e);
            }
        }
        self.commit().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        self.rollback();
        // A job that wrote nothing still leaves an empty file behind
        self.begin().await?;
        let path = self.path.clone();
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| ExportError::write(&path, e))?;
            file.sync_all()
                .await
                .map_err(|e| ExportError::write(&path, e))?;
        }
        Ok(())
    }
}
