//! Silver layer: bronze tables with canonical names, a single `id` column,
//! declared types and imputed gaps.

pub mod cast;
pub mod clean;
pub mod normalize;

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use tracing::info;

pub use cast::{CastOutcome, CastReport, ColumnType, TypeMap};
pub use clean::{clean_table, Cleaned};
pub use normalize::{normalize_schema, ID_COLUMN};

/// Normalise then clean one bronze table.
///
/// Type-map keys are matched after normalisation, so they use the canonical
/// (lowercased) names and `id` for whichever column was detected as the
/// identifier.
pub fn transform(batch: &RecordBatch, types: &TypeMap) -> Result<Cleaned> {
    let normalized = normalize_schema(batch)?;
    let cleaned = clean_table(&normalized, types)?;
    info!(
        rows_in = batch.num_rows(),
        rows_out = cleaned.table.num_rows(),
        casts = %cleaned.report,
        "silver transform complete"
    );
    Ok(cleaned)
}
