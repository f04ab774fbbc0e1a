// src/table/mod.rs
pub mod date_parser;
pub mod infer;
pub mod parquet_io;

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{new_null_array, Array, ArrayRef, BooleanArray, Float64Array, StringArray},
    compute::{cast, filter_record_batch},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::{RecordBatch, RecordBatchOptions},
    util::display::array_value_to_string,
};
use csv::ReaderBuilder;
use std::{collections::HashSet, io::Cursor, sync::Arc};
use tracing::debug;

pub use parquet_io::{read_parquet_from_memory, write_parquet_to_memory};

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Column names as the export spells them.
    pub headers: Vec<String>,
    /// Each data row, one string per header. Short rows are padded with "".
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Parse a headed CSV object.
    pub fn from_csv(data: &[u8]) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(data));

        let headers: Vec<String> = rdr
            .headers()
            .context("reading CSV header row")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for (idx, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("CSV parse error at record {}", idx))?;
            let mut row: Vec<String> = record
                .iter()
                .take(headers.len())
                .map(str::to_string)
                .collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    /// Convert into a typed table, inferring each column's type from its cleaned values.
    pub fn into_batch(self) -> Result<RecordBatch> {
        let num_rows = self.rows.len();
        let mut fields = Vec::with_capacity(self.headers.len());
        let mut columns = Vec::with_capacity(self.headers.len());

        for (i, name) in self.headers.iter().enumerate() {
            let values: Vec<Option<String>> = self
                .rows
                .iter()
                .map(|row| row.get(i).and_then(|raw| infer::clean_cell(raw)))
                .collect();
            let dtype = infer::infer_column_type(&values);
            debug!(column = %name, ?dtype, "inferred column type");
            columns.push(infer::build_array(&values, &dtype));
            fields.push(Field::new(name, dtype, true));
        }

        build_batch(Arc::new(Schema::new(fields)), columns, num_rows)
    }
}

/// `RecordBatch::try_new` that also accepts zero-column tables.
pub fn build_batch(schema: SchemaRef, columns: Vec<ArrayRef>, num_rows: usize) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    RecordBatch::try_new_with_options(schema, columns, &options).context("assembling record batch")
}

/// Replace the column called `name` or append it when absent.
pub fn with_column(batch: &RecordBatch, name: &str, array: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns = batch.columns().to_vec();
    let field = Field::new(name, array.data_type().clone(), true);

    match schema.index_of(name) {
        Ok(idx) => {
            fields[idx] = field;
            columns[idx] = array;
        }
        Err(_) => {
            fields.push(field);
            columns.push(array);
        }
    }
    build_batch(Arc::new(Schema::new(fields)), columns, batch.num_rows())
        .with_context(|| format!("setting column `{}`", name))
}

/// Rename columns through `rename`, keeping data and order.
pub fn rename_columns(
    batch: &RecordBatch,
    mut rename: impl FnMut(&str) -> String,
) -> Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_name(rename(f.name())))
        .collect();
    build_batch(
        Arc::new(Schema::new(fields)),
        batch.columns().to_vec(),
        batch.num_rows(),
    )
}

/// Project the named columns, in the given order.
pub fn select_columns(batch: &RecordBatch, names: &[&str]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let indices = names
        .iter()
        .map(|n| {
            schema
                .index_of(n)
                .map_err(|_| anyhow!("column `{}` not present", n))
        })
        .collect::<Result<Vec<_>>>()?;
    batch.project(&indices).context("projecting columns")
}

/// Keep the rows where `mask` is true.
pub fn filter_rows(batch: &RecordBatch, mask: Vec<bool>) -> Result<RecordBatch> {
    filter_record_batch(batch, &BooleanArray::from(mask)).context("filtering rows")
}

/// Keep the first row for every distinct value of `column`, preserving input order.
/// Null keys are treated as one value.
pub fn dedupe_first_by(batch: &RecordBatch, column: &str) -> Result<RecordBatch> {
    let keys = batch
        .column_by_name(column)
        .ok_or_else(|| anyhow!("column `{}` not present", column))?;
    let mut seen: HashSet<Option<String>> = HashSet::with_capacity(batch.num_rows());
    let mask = (0..batch.num_rows())
        .map(|row| seen.insert(value_key(keys, row)))
        .collect();
    filter_rows(batch, mask)
}

/// Rendered value of a cell, `None` for null. Used for grouping and joins
/// across differently-typed key columns.
pub fn value_key(arr: &ArrayRef, row: usize) -> Option<String> {
    if arr.is_null(row) {
        return None;
    }
    array_value_to_string(arr.as_ref(), row).ok()
}

/// Column values as f64, lenient: non-numeric and non-finite values become null.
pub fn f64_values(arr: &ArrayRef) -> Vec<Option<f64>> {
    let Ok(as_f64) = cast(arr.as_ref(), &DataType::Float64) else {
        return vec![None; arr.len()];
    };
    match as_f64.as_any().downcast_ref::<Float64Array>() {
        Some(floats) => floats.iter().map(|v| v.filter(|x| x.is_finite())).collect(),
        None => vec![None; arr.len()],
    }
}

/// A column of `len` nulls of type `dtype`.
pub fn null_column(dtype: &DataType, len: usize) -> ArrayRef {
    new_null_array(dtype, len)
}

/// A text column repeating `value`.
pub fn text_column(value: &str, len: usize) -> ArrayRef {
    Arc::new(StringArray::from(vec![value; len]))
}

/// Median of `values`; `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
