use arrow::{
    array::{Array, ArrayRef, StringArray, TimestampMillisecondArray},
    compute::cast,
    datatypes::{DataType, TimeUnit},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::sync::Arc;

/// Canonical timestamp type for parsed date columns (UTC, no zone attached).
pub const TIMESTAMP_TYPE: DataType = DataType::Timestamp(TimeUnit::Millisecond, None);

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"];

/// Lenient parse of a date or datetime string → millis since epoch (UTC).
/// Returns `None` for anything unrecognised.
pub fn parse_timestamp_millis(s: &str) -> Option<i64> {
    let s = s.trim();
    // shortest accepted form is "YYYY-MM-DD" / "DD/MM/YYYY"
    if s.len() < 10 {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc().timestamp_millis());
        }
    }
    None
}

/// Coerce any column into [`TIMESTAMP_TYPE`], turning unparseable values into nulls.
pub fn to_timestamp_array(arr: &ArrayRef) -> ArrayRef {
    match arr.data_type() {
        DataType::Timestamp(TimeUnit::Millisecond, None) => arr.clone(),
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => {
            cast(arr.as_ref(), &TIMESTAMP_TYPE).unwrap_or_else(|_| all_null(arr.len()))
        }
        DataType::Utf8 => {
            let Some(sarr) = arr.as_any().downcast_ref::<StringArray>() else {
                return all_null(arr.len());
            };
            let parsed: TimestampMillisecondArray = sarr
                .iter()
                .map(|opt| opt.and_then(parse_timestamp_millis))
                .collect();
            Arc::new(parsed)
        }
        DataType::LargeUtf8 => match cast(arr.as_ref(), &DataType::Utf8) {
            Ok(utf8) => to_timestamp_array(&utf8),
            Err(_) => all_null(arr.len()),
        },
        _ => all_null(arr.len()),
    }
}

/// Calendar date of a millisecond timestamp.
pub fn millis_to_date(ms: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

/// Days since 1970-01-01, the Arrow `Date32` representation.
pub fn date_to_days(date: NaiveDate) -> i32 {
    (date - DateTime::UNIX_EPOCH.date_naive()).num_days() as i32
}

fn all_null(len: usize) -> ArrayRef {
    Arc::new(TimestampMillisecondArray::from(vec![None; len]))
}
