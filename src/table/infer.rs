use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMillisecondArray},
    datatypes::DataType,
};
use std::sync::Arc;

use super::date_parser::{self, TIMESTAMP_TYPE};

/// Trim whitespace + strip outer quotes if present.
pub fn clean_str(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Cleaned cell value, with blank cells mapped to null.
pub fn clean_cell(raw: &str) -> Option<String> {
    let cleaned = clean_str(raw);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn parse_f64(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Infer an Arrow dtype for a column from every non-null value:
/// Int64 if all parse as integers, else Float64 if all parse as finite floats,
/// else Timestamp if all parse as dates, else Utf8. Empty columns are Utf8.
pub fn infer_column_type(values: &[Option<String>]) -> DataType {
    let mut present = values.iter().flatten().peekable();
    if present.peek().is_none() {
        return DataType::Utf8;
    }
    let present: Vec<&String> = present.collect();

    if present.iter().all(|s| s.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if present.iter().all(|s| parse_f64(s).is_some()) {
        DataType::Float64
    } else if present
        .iter()
        .all(|s| date_parser::parse_timestamp_millis(s).is_some())
    {
        TIMESTAMP_TYPE
    } else {
        DataType::Utf8
    }
}

/// Build an array of `dtype` from cleaned cells. Cells that do not parse
/// become null; inference guarantees that does not happen for inferred types.
pub fn build_array(values: &[Option<String>], dtype: &DataType) -> ArrayRef {
    match dtype {
        DataType::Int64 => Arc::new(
            values
                .iter()
                .map(|v| v.as_deref().and_then(|s| s.parse::<i64>().ok()))
                .collect::<Int64Array>(),
        ),
        DataType::Float64 => Arc::new(
            values
                .iter()
                .map(|v| v.as_deref().and_then(parse_f64))
                .collect::<Float64Array>(),
        ),
        DataType::Timestamp(_, _) => Arc::new(
            values
                .iter()
                .map(|v| v.as_deref().and_then(date_parser::parse_timestamp_millis))
                .collect::<TimestampMillisecondArray>(),
        ),
        _ => Arc::new(values.iter().map(|v| v.as_deref()).collect::<StringArray>()),
    }
}
