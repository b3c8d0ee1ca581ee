//! Configuration type definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable consulted when `source.url` is not set.
pub const DATABASE_URL_ENV: &str = "BATCH_EXPORT_DATABASE_URL";

/// Token replaced by the launch timestamp in `output.filename_pattern`.
pub const TIMESTAMP_TOKEN: &str = "{timestamp}";

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data source connection.
    #[serde(default)]
    pub source: SourceConfig,

    /// Export job behavior.
    pub batch: BatchConfig,

    /// HTTP control surface.
    #[serde(default)]
    pub server: ServerConfig,

    /// Execution record store.
    #[serde(default)]
    pub tracker: TrackerConfig,
}

/// Data source configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// sqlx connection URL (`sqlite:`, `postgres://`, `mysql://`).
    /// Falls back to `BATCH_EXPORT_DATABASE_URL` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("url", &self.url.as_deref().map(redact_url))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Replace the password portion of a connection URL with `[REDACTED]`.
pub fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let authority_start = scheme_end + 3;
    let rest = &url[authority_start..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..authority_end];

    match (authority.rfind('@'), authority.find(':')) {
        (Some(at), Some(colon)) if colon < at => format!(
            "{}{}:[REDACTED]{}",
            &url[..authority_start],
            &authority[..colon],
            &rest[at..]
        ),
        _ => url.to_string(),
    }
}

/// Export job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Rows per committed chunk.
    pub chunk_size: usize,

    /// Rows per page fetched from the data source (default: 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Base SELECT statement; its projection and FROM clause are reused,
    /// its own filter is replaced by the resolved where clause.
    pub base_query: String,

    /// Filter used when a launch supplies none. Empty means all rows.
    #[serde(default)]
    pub default_where_clause: String,

    /// Column ordering the paginated reads (default: "id").
    #[serde(default = "default_sort_key")]
    pub sort_key: String,

    /// Ordered field list for the header and every data line.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,

    /// Output file settings.
    #[serde(default)]
    pub output: OutputConfig,
}

/// Output file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for exported files, created if missing (default: "target").
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,

    /// Filename used when a launch supplies none. `{timestamp}` is replaced
    /// by the launch time formatted as `yyyyMMddHHmmss`.
    #[serde(default = "default_filename_pattern")]
    pub filename_pattern: String,

    /// Emit a header line of field names (default: true).
    #[serde(default = "default_true")]
    pub include_header: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            filename_pattern: default_filename_pattern(),
            include_header: true,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address as host:port; host names are resolved at bind time
    /// (default: "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Execution record store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// JSON snapshot of execution records, rewritten on every transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

// Default value functions for serde
fn default_max_connections() -> u32 {
    4
}

fn default_page_size() -> usize {
    100
}

fn default_sort_key() -> String {
    "id".to_string()
}

fn default_fields() -> Vec<String> {
    vec!["id".to_string(), "name".to_string(), "email".to_string()]
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("target")
}

fn default_filename_pattern() -> String {
    format!("export_{}.tsv", TIMESTAMP_TOKEN)
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}
