use anyhow::Result;
use arrow::{
    array::{Array, ArrayRef, Date32Array, Int32Array, StringArray, TimestampMillisecondArray},
    datatypes::{DataType, Field, Schema, SchemaRef},
    record_batch::RecordBatch,
};
use chrono::{Datelike, NaiveDate};
use std::{collections::BTreeSet, sync::Arc};
use tracing::debug;

use crate::silver::ID_COLUMN;
use crate::table::{self, date_parser};

/// Columns of `dim_client` and the type used when the source lacks one.
pub const DIM_CLIENT_COLUMNS: [(&str, DataType); 4] = [
    (ID_COLUMN, DataType::Utf8),
    ("name", DataType::Utf8),
    ("country", DataType::Utf8),
    ("age", DataType::Int64),
];

/// One row per client id with {id, name, country, age}.
///
/// Absent attributes become null columns; duplicate ids keep their first row.
pub fn build_dim_client(clients: &RecordBatch) -> Result<RecordBatch> {
    let n = clients.num_rows();
    let mut fields = Vec::with_capacity(DIM_CLIENT_COLUMNS.len());
    let mut columns = Vec::with_capacity(DIM_CLIENT_COLUMNS.len());
    for (name, fallback) in DIM_CLIENT_COLUMNS.iter() {
        let column = match clients.column_by_name(name) {
            Some(col) => col.clone(),
            None => {
                debug!(column = name, "client attribute missing, null-filled");
                table::null_column(fallback, n)
            }
        };
        fields.push(Field::new(*name, column.data_type().clone(), true));
        columns.push(column);
    }
    let dim = table::build_batch(Arc::new(Schema::new(fields)), columns, n)?;
    table::dedupe_first_by(&dim, ID_COLUMN)
}

pub fn dim_date_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("date", DataType::Date32, true),
        Field::new("day", DataType::Int32, true),
        Field::new("week", DataType::Int32, true),
        Field::new("month", DataType::Int32, true),
        Field::new("year", DataType::Int32, true),
        Field::new("month_name", DataType::Utf8, true),
    ]))
}

/// One row per distinct calendar date found in `date_col`, ascending.
///
/// A missing column or a column with no parseable value yields an empty
/// table that still carries the full schema.
pub fn build_dim_date(fact: &RecordBatch, date_col: &str) -> Result<RecordBatch> {
    let schema = dim_date_schema();
    let Some(raw) = fact.column_by_name(date_col) else {
        debug!(column = date_col, "date column missing, empty dim_date");
        return Ok(RecordBatch::new_empty(schema));
    };

    let stamps = date_parser::to_timestamp_array(raw);
    let dates: BTreeSet<NaiveDate> = match stamps
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
    {
        Some(ts) => ts
            .iter()
            .flatten()
            .filter_map(date_parser::millis_to_date)
            .collect(),
        None => BTreeSet::new(),
    };

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Date32Array::from_iter_values(
            dates.iter().map(|d| date_parser::date_to_days(*d)),
        )),
        Arc::new(Int32Array::from_iter_values(dates.iter().map(|d| d.day() as i32))),
        Arc::new(Int32Array::from_iter_values(
            dates.iter().map(|d| d.iso_week().week() as i32),
        )),
        Arc::new(Int32Array::from_iter_values(dates.iter().map(|d| d.month() as i32))),
        Arc::new(Int32Array::from_iter_values(dates.iter().map(|d| d.year()))),
        Arc::new(StringArray::from_iter_values(
            dates.iter().map(|d| d.format("%B").to_string()),
        )),
    ];
    table::build_batch(schema, columns, dates.len())
}
