//! Data source access for paginated reads.
//!
//! [`PageSource`] is the seam between the reader and the database. The
//! production implementation, [`SqlSource`], runs keyset page queries through
//! sqlx's `Any` driver so SQLite, PostgreSQL and MySQL URLs all work.

mod types;

pub use types::{Row, SqlValue};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row as _, ValueRef};
use tracing::{debug, info};

use crate::config::{redact_url, SourceConfig};
use crate::error::{ExportError, Result};
use crate::query::QuerySpec;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of ordered pages of rows.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch up to `limit` rows whose sort key is greater than `after_key`
    /// (or from the start when `None`), in ascending key order.
    async fn fetch_page(
        &self,
        query: &QuerySpec,
        after_key: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Short name of the backing database, for logs.
    fn db_type(&self) -> &str;
}

/// sqlx-backed page source.
pub struct SqlSource {
    pool: AnyPool,
    db_type: String,
}

impl SqlSource {
    /// Connect using the configured URL (or `BATCH_EXPORT_DATABASE_URL`).
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let url = config.resolved_url()?;
        Self::connect_url(&url, config.max_connections).await
    }

    /// Connect to a sqlx URL and verify the connection.
    pub async fn connect_url(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| ExportError::data_access(e, "creating source pool"))?;

        let source = Self::from_pool(pool, db_type_of(url));
        source.health_check().await?;

        info!(
            "Connected to {} source: {}",
            source.db_type,
            redact_url(url)
        );
        Ok(source)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: AnyPool, db_type: impl Into<String>) -> Self {
        Self {
            pool,
            db_type: db_type.into(),
        }
    }

    /// Run `SELECT 1` against the pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ExportError::data_access(e, "testing source connection"))?;
        Ok(())
    }
}

#[async_trait]
impl PageSource for SqlSource {
    async fn fetch_page(
        &self,
        query: &QuerySpec,
        after_key: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let sql = query.page_sql(after_key, limit);
        debug!("Fetching page: {}", sql);

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ExportError::data_access(e, format!("fetching page: {}", sql)))?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        rows.iter()
            .map(|row| {
                let values = (0..columns.len())
                    .map(|i| decode_value(row, i, &columns[i]))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Row::new(Arc::clone(&columns), values))
            })
            .collect()
    }

    fn db_type(&self) -> &str {
        &self.db_type
    }
}

/// Decode one column by trying the supported types in turn.
fn decode_value(row: &AnyRow, idx: usize, name: &str) -> Result<SqlValue> {
    let is_null = row.try_get_raw(idx).map(|r| r.is_null()).unwrap_or(true);
    if is_null {
        return Ok(SqlValue::Null);
    }

    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return Ok(SqlValue::Int(v));
    }
    if let Ok(v) = row.try_get::<f64, _>(idx) {
        return Ok(SqlValue::Float(v));
    }
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return Ok(SqlValue::Text(v));
    }
    if let Ok(v) = row.try_get::<bool, _>(idx) {
        return Ok(SqlValue::Bool(v));
    }

    Err(ExportError::data_access(
        format!("unsupported type for column '{}'", name),
        "decoding row",
    ))
}

fn db_type_of(url: &str) -> &'static str {
    match url.split(':').next().unwrap_or_default() {
        "postgres" | "postgresql" => "postgres",
        "mysql" | "mariadb" => "mysql",
        "sqlite" => "sqlite",
        _ => "unknown",
    }
}
