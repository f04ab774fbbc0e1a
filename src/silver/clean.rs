use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::cast::{cast_column, CastOutcome, CastReport, TypeMap};
use super::normalize::ID_COLUMN;
use crate::error::SchemaError;
use crate::table::{self, median};
use crate::UNKNOWN;

/// A cleaned table plus the casts that were attempted on it.
#[derive(Debug, Clone)]
pub struct Cleaned {
    pub table: RecordBatch,
    pub report: CastReport,
}

/// Clean an already-normalised table (one column named `id`).
///
/// Steps run in order over the whole table: drop fully-empty rows, dedupe by
/// `id` keeping the first row, cast declared columns, null negative values in
/// numeric declared columns, then impute. Cast failures are logged and recorded
/// in the report, never returned.
pub fn clean_table(batch: &RecordBatch, types: &TypeMap) -> Result<Cleaned> {
    if batch.column_by_name(ID_COLUMN).is_none() {
        return Err(SchemaError::NoIdColumn {
            columns: batch
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect(),
        }
        .into());
    }

    // 1) fully-empty rows
    let before = batch.num_rows();
    let table = drop_empty_rows(batch)?;
    debug!(dropped = before - table.num_rows(), "dropped empty rows");

    // 2) duplicate ids, first occurrence wins
    let before = table.num_rows();
    let table = table::dedupe_first_by(&table, ID_COLUMN)?;
    debug!(dropped = before - table.num_rows(), "dropped duplicate ids");

    // 3) declared casts, isolated per column
    let (table, report) = apply_casts(&table, types)?;

    // 4) + 5)
    let table = null_negatives(&table, types)?;
    let table = impute_missing(&table)?;

    Ok(Cleaned { table, report })
}

fn is_blank(arr: &ArrayRef, row: usize) -> bool {
    if arr.is_null(row) {
        return true;
    }
    arr.as_any()
        .downcast_ref::<StringArray>()
        .is_some_and(|s| s.value(row).trim().is_empty())
}

/// Drop rows in which every field is null or blank text.
pub fn drop_empty_rows(batch: &RecordBatch) -> Result<RecordBatch> {
    if batch.num_columns() == 0 {
        return Ok(batch.clone());
    }
    let mask = (0..batch.num_rows())
        .map(|row| !batch.columns().iter().all(|col| is_blank(col, row)))
        .collect();
    table::filter_rows(batch, mask)
}

/// Cast each declared column; a failing column is left untouched.
pub fn apply_casts(batch: &RecordBatch, types: &TypeMap) -> Result<(RecordBatch, CastReport)> {
    let mut report = CastReport::default();
    let mut columns = batch.columns().to_vec();
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();

    for (name, target) in types {
        let Some(idx) = fields.iter().position(|f| f.name() == name) else {
            report.record(name, *target, CastOutcome::Missing);
            continue;
        };
        let original = &columns[idx];
        if original.data_type() == &target.data_type() {
            report.record(name, *target, CastOutcome::AlreadyTyped);
            continue;
        }
        match cast_column(original, *target) {
            Ok(cast) => {
                fields[idx] = Field::new(name, cast.data_type().clone(), true);
                columns[idx] = cast;
                report.record(name, *target, CastOutcome::Cast);
            }
            Err(e) => {
                warn!(column = %name, ty = ?target, "failed to cast column: {}", e);
                report.record(
                    name,
                    *target,
                    CastOutcome::Failed {
                        reason: e.to_string(),
                    },
                );
            }
        }
    }

    let table = table::build_batch(Arc::new(Schema::new(fields)), columns, batch.num_rows())
        .context("rebuilding table after casts")?;
    Ok((table, report))
}

/// Rewrite negative values to null in declared numeric columns (except `id`).
pub fn null_negatives(batch: &RecordBatch, types: &TypeMap) -> Result<RecordBatch> {
    let mut table = batch.clone();
    for name in types.keys().filter(|n| n.as_str() != ID_COLUMN) {
        let Some(arr) = table.column_by_name(name).cloned() else {
            continue;
        };
        let replaced: Option<ArrayRef> = match arr.data_type() {
            DataType::Int64 => arr.as_any().downcast_ref::<Int64Array>().map(|a| {
                Arc::new(a.iter().map(|v| v.filter(|x| *x >= 0)).collect::<Int64Array>())
                    as ArrayRef
            }),
            DataType::Float64 => arr.as_any().downcast_ref::<Float64Array>().map(|a| {
                Arc::new(
                    a.iter()
                        .map(|v| v.filter(|x| *x >= 0.0))
                        .collect::<Float64Array>(),
                ) as ArrayRef
            }),
            _ => None,
        };
        if let Some(replaced) = replaced {
            let nulled = replaced.null_count() - arr.null_count();
            if nulled > 0 {
                debug!(column = %name, nulled, "nulled negative values");
            }
            table = table::with_column(&table, name, replaced)?;
        }
    }
    Ok(table)
}

/// Fill nulls: numeric columns with their median, text columns with [`UNKNOWN`].
///
/// A numeric column with no remaining values has no median and stays null.
/// Int64 medians are rounded half away from zero.
pub fn impute_missing(batch: &RecordBatch) -> Result<RecordBatch> {
    let mut table = batch.clone();
    let schema = batch.schema();
    for field in schema.fields().iter().filter(|f| f.name() != ID_COLUMN) {
        let name = field.name();
        let Some(arr) = table.column_by_name(name).cloned() else {
            continue;
        };
        if arr.null_count() == 0 {
            continue;
        }

        let filled: Option<ArrayRef> = match arr.data_type() {
            DataType::Int64 => arr.as_any().downcast_ref::<Int64Array>().and_then(|a| {
                let present: Vec<f64> = a.iter().flatten().map(|v| v as f64).collect();
                let fill = median(&present)?.round() as i64;
                Some(Arc::new(a.iter().map(|v| Some(v.unwrap_or(fill))).collect::<Int64Array>())
                    as ArrayRef)
            }),
            DataType::Float64 => arr.as_any().downcast_ref::<Float64Array>().and_then(|a| {
                let present: Vec<f64> = a.iter().flatten().collect();
                let fill = median(&present)?;
                Some(
                    Arc::new(a.iter().map(|v| Some(v.unwrap_or(fill))).collect::<Float64Array>())
                        as ArrayRef,
                )
            }),
            DataType::Utf8 => arr.as_any().downcast_ref::<StringArray>().map(|a| {
                Arc::new(
                    a.iter()
                        .map(|v| Some(v.unwrap_or(UNKNOWN)))
                        .collect::<StringArray>(),
                ) as ArrayRef
            }),
            _ => continue,
        };

        match filled {
            Some(filled) => table = table::with_column(&table, name, filled)?,
            None => warn!(column = %name, "column entirely null, no median to impute"),
        }
    }
    Ok(table)
}
