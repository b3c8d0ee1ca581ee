//! Keyset-paginated, forward-only row reader.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ExportError, Result};
use crate::query::QuerySpec;
use crate::source::{PageSource, Row};

/// Lazily pages through a query in ascending sort-key order.
///
/// Only the last seen key and the current page are held in memory. A page
/// shorter than the page size ends the stream; after that every read returns
/// nothing without touching the source.
pub struct PaginatedReader {
    source: Arc<dyn PageSource>,
    query: QuerySpec,
    page_size: usize,
    last_key: Option<i64>,
    buffer: VecDeque<Row>,
    exhausted: bool,
    pages_read: usize,
    queries_issued: usize,
    rows_read: u64,
}

impl PaginatedReader {
    /// Start a fresh traversal. No query runs until the first read.
    pub fn open(source: Arc<dyn PageSource>, query: QuerySpec, page_size: usize) -> Self {
        Self {
            source,
            query,
            page_size: page_size.max(1),
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_read: 0,
            queries_issued: 0,
            rows_read: 0,
        }
    }

    /// Next row, or `None` once the source is exhausted.
    pub async fn read(&mut self) -> Result<Option<Row>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_next_page().await?;
        }
        let row = self.buffer.pop_front();
        if row.is_some() {
            self.rows_read += 1;
        }
        Ok(row)
    }

    /// Up to `max` rows. An empty result means the stream has ended.
    pub async fn read_chunk(&mut self, max: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(max.min(self.page_size));
        while rows.len() < max {
            match self.read().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.buffer.is_empty()
    }

    /// Non-empty pages fetched so far.
    pub fn pages_read(&self) -> usize {
        self.pages_read
    }

    /// Page queries issued, including the final empty one if any.
    pub fn queries_issued(&self) -> usize {
        self.queries_issued
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub fn last_key(&self) -> Option<i64> {
        self.last_key
    }

    async fn fetch_next_page(&mut self) -> Result<()> {
        let rows = self
            .source
            .fetch_page(&self.query, self.last_key, self.page_size)
            .await?;
        self.queries_issued += 1;

        debug!(
            "Fetched {} rows after key {:?} from {}",
            rows.len(),
            self.last_key,
            self.source.db_type()
        );

        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if rows.is_empty() {
            return Ok(());
        }

        let column = self.query.sort_key.result_column();
        let mut last = self.last_key;
        for row in &rows {
            let key = row.sort_key(column)?;
            if last.is_some_and(|prev| key <= prev) {
                return Err(ExportError::data_access(
                    format!("sort key {} is not greater than {:?}", key, last),
                    "paging by sort key",
                ));
            }
            last = Some(key);
        }

        self.last_key = last;
        self.pages_read += 1;
        self.buffer.extend(rows);
        Ok(())
    }
}
