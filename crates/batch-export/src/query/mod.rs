//! Query resolution: splitting a base query and applying a filter.
//!
//! The base query is only ever used for its projection and its FROM clause.
//! Its own filter, grouping and ordering are discarded; the resolved where
//! clause and the sort key are applied when the page queries are built.

use serde::Serialize;

use crate::error::{ExportError, Result};

/// Keywords that end a FROM clause, in no particular order.
const FROM_TERMINATORS: &[&str] = &["WHERE", "GROUP BY", "HAVING", "ORDER BY", "LIMIT"];

/// Direction of the sort key. Pagination only supports ascending keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    Ascending,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "ASC",
        }
    }
}

/// Column ordering paginated reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub column: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            order: SortOrder::Ascending,
        }
    }

    /// Name the column carries in a result row (`u.id` is returned as `id`).
    pub fn result_column(&self) -> &str {
        self.column
            .rsplit('.')
            .next()
            .unwrap_or(self.column.as_str())
    }
}

/// A resolved query for one export job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    /// Projection, e.g. `SELECT id, name`.
    pub select_clause: String,
    /// Source relation, e.g. `FROM users`.
    pub from_clause: String,
    /// Filter fragment without the `WHERE` keyword. Empty means all rows.
    pub where_clause: String,
    pub sort_key: SortKey,
}

impl QuerySpec {
    /// True when a filter is applied.
    pub fn has_filter(&self) -> bool {
        !self.where_clause.trim().is_empty()
    }

    /// SQL for one page: rows after `after` (exclusive) in key order.
    pub fn page_sql(&self, after: Option<i64>, limit: usize) -> String {
        let sort = &self.sort_key.column;
        let mut sql = format!("{} {}", self.select_clause, self.from_clause);

        match (self.has_filter(), after) {
            (true, Some(key)) => {
                sql.push_str(&format!(" WHERE ({}) AND {} > {}", self.where_clause, sort, key))
            }
            (true, None) => sql.push_str(&format!(" WHERE ({})", self.where_clause)),
            (false, Some(key)) => sql.push_str(&format!(" WHERE {} > {}", sort, key)),
            (false, None) => {}
        }

        sql.push_str(&format!(
            " ORDER BY {} {} LIMIT {}",
            sort,
            self.sort_key.order.as_sql(),
            limit
        ));
        sql
    }

    /// The whole export as one statement, without paging.
    pub fn full_sql(&self) -> String {
        let mut sql = format!("{} {}", self.select_clause, self.from_clause);
        if self.has_filter() {
            sql.push_str(" WHERE ");
            sql.push_str(self.where_clause.trim());
        }
        sql.push_str(&format!(
            " ORDER BY {} {}",
            self.sort_key.column,
            self.sort_key.order.as_sql()
        ));
        sql
    }
}

/// Resolves the query for each launch from an immutable base query.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    select_clause: String,
    from_clause: String,
    default_where_clause: String,
    sort_key: SortKey,
}

impl QueryBuilder {
    /// Split the base query once; fails if it is empty or has no FROM.
    pub fn new(
        base_query: &str,
        default_where_clause: impl Into<String>,
        sort_key: impl Into<String>,
    ) -> Result<Self> {
        let sort_key = sort_key.into();
        if !is_identifier(&sort_key) {
            return Err(ExportError::Config(format!(
                "sort key must be a column name, got '{}'",
                sort_key
            )));
        }
        Ok(Self {
            select_clause: extract_select_clause(base_query)?,
            from_clause: extract_from_clause(base_query)?,
            default_where_clause: default_where_clause.into(),
            sort_key: SortKey::ascending(sort_key),
        })
    }

    /// Resolve the query for a launch. A non-blank override wins over the
    /// configured default.
    pub fn resolve(&self, where_override: Option<&str>) -> QuerySpec {
        QuerySpec {
            select_clause: self.select_clause.clone(),
            from_clause: self.from_clause.clone(),
            where_clause: resolve_where(where_override, &self.default_where_clause),
            sort_key: self.sort_key.clone(),
        }
    }

    /// Full SQL for a launch, as logged at job start.
    pub fn build_full_query(&self, where_override: Option<&str>) -> String {
        self.resolve(where_override).full_sql()
    }
}

/// One-shot resolution without keeping a builder around.
pub fn resolve(
    base_query: &str,
    where_override: Option<&str>,
    default_where_clause: &str,
    sort_key: &str,
) -> Result<QuerySpec> {
    Ok(QueryBuilder::new(base_query, default_where_clause, sort_key)?.resolve(where_override))
}

/// Pick the effective filter: the override when non-blank, else the default.
pub fn resolve_where(where_override: Option<&str>, default_where_clause: &str) -> String {
    match where_override.map(str::trim) {
        Some(clause) if !clause.is_empty() => clause.to_string(),
        _ => default_where_clause.trim().to_string(),
    }
}

/// Everything before the first `FROM`, trimmed.
pub fn extract_select_clause(base_query: &str) -> Result<String> {
    let from = locate_from(base_query)?;
    let select = base_query[..from].trim();
    if select.is_empty() {
        return Err(ExportError::Config(format!(
            "base query has no projection before FROM: '{}'",
            base_query.trim()
        )));
    }
    Ok(select.to_string())
}

/// The relation between `FROM` and the first clause keyword that follows it,
/// trimmed and prefixed with `FROM `.
pub fn extract_from_clause(base_query: &str) -> Result<String> {
    let from = locate_from(base_query)?;
    let body_start = from + "FROM".len();
    let rest = &base_query[body_start..];

    let end = FROM_TERMINATORS
        .iter()
        .filter_map(|kw| find_keyword(rest, kw))
        .min()
        .unwrap_or(rest.len());

    let body = rest[..end].trim();
    if body.is_empty() {
        return Err(ExportError::Config(format!(
            "base query has an empty FROM clause: '{}'",
            base_query.trim()
        )));
    }
    Ok(format!("FROM {}", body))
}

/// True for plain or dotted column names (`id`, `u.customer_id`).
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

fn locate_from(base_query: &str) -> Result<usize> {
    if base_query.trim().is_empty() {
        return Err(ExportError::Config("base query is empty".into()));
    }
    find_keyword(base_query, "FROM").ok_or_else(|| {
        ExportError::Config(format!(
            "base query has no FROM clause: '{}'",
            base_query.trim()
        ))
    })
}

/// Byte offset of the first whole-word, case-insensitive occurrence of
/// `keyword`. Multi-word keywords match any whitespace between words.
fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = keyword.split_whitespace().collect();
    let first = *words.first()?;

    let mut search_from = 0;
    while let Some(pos) = upper[search_from..].find(first) {
        let start = search_from + pos;
        search_from = start + first.len();

        if !is_boundary(&upper, start, start + first.len()) {
            continue;
        }

        let mut cursor = start + first.len();
        let mut matched = true;
        for word in &words[1..] {
            let skipped = upper[cursor..]
                .find(|c: char| !c.is_whitespace())
                .unwrap_or(upper.len() - cursor);
            if skipped == 0 || !upper[cursor + skipped..].starts_with(word) {
                matched = false;
                break;
            }
            let word_start = cursor + skipped;
            cursor = word_start + word.len();
            if !is_boundary(&upper, word_start, cursor) {
                matched = false;
                break;
            }
        }

        if matched {
            return Some(start);
        }
    }
    None
}

fn is_boundary(sql: &str, start: usize, end: usize) -> bool {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let before = sql[..start].chars().next_back().map_or(true, |c| !is_word(c));
    let after = sql[end..].chars().next().map_or(true, |c| !is_word(c));
    before && after
}
