use anyhow::Result;
use arrow::record_batch::RecordBatch;
use std::collections::HashSet;

use crate::error::SchemaError;
use crate::table;

pub const ID_COLUMN: &str = "id";

/// Lowercase + trim a column name.
pub fn canonical_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Index of the identifier column among already-canonical names.
///
/// Priority: exact `id`, then the first `id_*`, then the first `*_id`.
pub fn detect_id_column(columns: &[String]) -> Option<usize> {
    columns
        .iter()
        .position(|c| c == ID_COLUMN)
        .or_else(|| columns.iter().position(|c| c.starts_with("id_")))
        .or_else(|| columns.iter().position(|c| c.ends_with("_id")))
}

/// Canonicalise every column name and rename the detected identifier to `id`.
pub fn normalize_schema(batch: &RecordBatch) -> Result<RecordBatch> {
    let mut names: Vec<String> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| canonical_name(f.name()))
        .collect();

    let mut seen = HashSet::with_capacity(names.len());
    if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
        return Err(SchemaError::DuplicateColumn {
            column: dup.clone(),
        }
        .into());
    }

    let id_idx = detect_id_column(&names).ok_or_else(|| SchemaError::NoIdColumn {
        columns: names.clone(),
    })?;
    names[id_idx] = ID_COLUMN.to_string();

    let mut names = names.into_iter();
    table::rename_columns(batch, |_| names.next().unwrap_or_default())
}
