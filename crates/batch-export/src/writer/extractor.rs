//! Field extraction shared by the header and data lines.

use thiserror::Error;

use crate::source::Row;

/// A configured field absent from a result row.
#[derive(Debug, Error)]
#[error("row has no field '{0}'")]
pub struct MissingField(pub String);

/// Maps rows to an ordered list of field values.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    fields: Vec<String>,
}

impl FieldExtractor {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Field names joined by `delimiter`, with a trailing newline.
    pub fn header_line(&self, delimiter: char) -> String {
        let mut line = self.fields.join(&delimiter.to_string());
        line.push('\n');
        line
    }

    /// Values of every configured field, in field order. NULL is empty.
    pub fn extract(&self, row: &Row) -> Result<Vec<String>, MissingField> {
        self.fields
            .iter()
            .map(|field| {
                row.get(field)
                    .map(ToString::to_string)
                    .ok_or_else(|| MissingField(field.clone()))
            })
            .collect()
    }

    /// One data line for `row`, with a trailing newline.
    pub fn format_line(&self, row: &Row, delimiter: char) -> Result<String, MissingField> {
        let mut line = self.extract(row)?.join(&delimiter.to_string());
        line.push('\n');
        Ok(line)
    }
}
