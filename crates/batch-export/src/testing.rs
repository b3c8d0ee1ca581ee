//! Shared test doubles.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ExportError, Result};
use crate::query::{QueryBuilder, QuerySpec};
use crate::source::{PageSource, Row, SqlValue};

/// `SELECT id, name, email FROM users`, unfiltered, keyed on `id`.
pub(crate) fn query() -> QuerySpec {
    QueryBuilder::new("SELECT id, name, email FROM users", "", "id")
        .expect("valid base query")
        .resolve(None)
}

pub(crate) fn user_row(id: i64) -> Row {
    Row::from_pairs([
        ("id", SqlValue::Int(id)),
        ("name", SqlValue::Text(format!("user{}", id))),
        ("email", SqlValue::Text(format!("user{}@example.com", id))),
    ])
}

/// In-memory page source honoring `after_key` and `limit`.
pub(crate) struct MemorySource {
    rows: Vec<Row>,
    ordered: bool,
    fail_on_call: Option<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MemorySource {
    pub(crate) fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::from_rows(ids.into_iter().map(user_row).collect())
    }

    pub(crate) fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ordered: true,
            fail_on_call: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns rows as given, ignoring keys, on the first call only.
    pub(crate) fn unordered(rows: Vec<Row>) -> Self {
        Self {
            ordered: false,
            ..Self::from_rows(rows)
        }
    }

    /// Fail the `n`th fetch (1-based) with a data access error.
    pub(crate) fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for MemorySource {
    async fn fetch_page(
        &self,
        query: &QuerySpec,
        after_key: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_call == Some(call) {
            return Err(ExportError::data_access(
                "connection reset by peer",
                format!("fetching page {}", call),
            ));
        }

        if !self.ordered {
            return Ok(match after_key {
                None => self.rows.iter().take(limit).cloned().collect(),
                Some(_) => Vec::new(),
            });
        }

        let column = query.sort_key.result_column();
        let mut page = Vec::new();
        for row in &self.rows {
            let key = row.sort_key(column)?;
            if after_key.map_or(true, |after| key > after) {
                page.push(row.clone());
            }
            if page.len() == limit {
                break;
            }
        }
        Ok(page)
    }

    fn db_type(&self) -> &str {
        "memory"
    }
}
