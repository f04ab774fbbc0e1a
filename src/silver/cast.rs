use arrow::{
    array::{Array, ArrayRef},
    compute::{cast_with_options, CastOptions},
    datatypes::DataType,
    error::ArrowError,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::table::date_parser::{self, TIMESTAMP_TYPE};

/// Declared target type for a silver column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Boolean,
    /// Parsed leniently: unparseable values become null instead of failing.
    Timestamp,
}

impl ColumnType {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Timestamp => TIMESTAMP_TYPE,
        }
    }
}

/// Column name → declared type.
pub type TypeMap = BTreeMap<String, ColumnType>;

#[derive(Debug, Clone, PartialEq)]
pub enum CastOutcome {
    /// Column already had the target type.
    AlreadyTyped,
    Cast,
    /// Cast failed; the column was left as it was.
    Failed { reason: String },
    /// Declared in the type map but absent from the table.
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCast {
    pub column: String,
    pub target: ColumnType,
    pub outcome: CastOutcome,
}

/// Per-table record of every attempted cast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CastReport {
    pub columns: Vec<ColumnCast>,
}

impl CastReport {
    pub fn record(&mut self, column: &str, target: ColumnType, outcome: CastOutcome) {
        self.columns.push(ColumnCast {
            column: column.to_string(),
            target,
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &ColumnCast> {
        self.columns
            .iter()
            .filter(|c| matches!(c.outcome, CastOutcome::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    pub fn outcome(&self, column: &str) -> Option<&CastOutcome> {
        self.columns
            .iter()
            .find(|c| c.column == column)
            .map(|c| &c.outcome)
    }
}

impl fmt::Display for CastReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        write!(
            f,
            "{} casts attempted, {} failed",
            self.columns.len(),
            failed
        )
    }
}

/// Strict cast of one column. Timestamps never fail: bad values turn null.
pub fn cast_column(arr: &ArrayRef, target: ColumnType) -> Result<ArrayRef, ArrowError> {
    if target == ColumnType::Timestamp {
        return Ok(date_parser::to_timestamp_array(arr));
    }
    let dtype = target.data_type();
    if arr.data_type() == &dtype {
        return Ok(arr.clone());
    }
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    cast_with_options(arr.as_ref(), &dtype, &options)
}
