use anyhow::Result;
use arrow::{
    array::{Array, ArrayRef, Date32Array, Float64Array, StringArray, TimestampMillisecondArray},
    datatypes::DataType,
    record_batch::RecordBatch,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

use crate::silver::ID_COLUMN;
use crate::table::{self, date_parser};
use crate::UNKNOWN;

pub const DAY_COLUMN: &str = "day";
pub const MONTH_COLUMN: &str = "month";

/// Value given to an expected column the source does not have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    NullTimestamp,
    /// Null Float64. A present column with this default is coerced to Float64.
    NullFloat,
    NullText,
    Text(String),
}

impl DefaultValue {
    fn column(&self, len: usize) -> ArrayRef {
        match self {
            DefaultValue::NullTimestamp => table::null_column(&date_parser::TIMESTAMP_TYPE, len),
            DefaultValue::NullFloat => table::null_column(&DataType::Float64, len),
            DefaultValue::NullText => table::null_column(&DataType::Utf8, len),
            DefaultValue::Text(value) => table::text_column(value, len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedColumn {
    pub name: String,
    pub default: DefaultValue,
}

/// Columns the fact table must carry, with their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactSchema {
    pub date: String,
    pub measure: String,
    pub foreign_key: String,
    /// Attribute pulled from the client dimension by the join.
    pub attribute: String,
}

impl FactSchema {
    pub fn expected_columns(&self) -> Vec<ExpectedColumn> {
        vec![
            ExpectedColumn {
                name: self.date.clone(),
                default: DefaultValue::NullTimestamp,
            },
            ExpectedColumn {
                name: self.measure.clone(),
                default: DefaultValue::NullFloat,
            },
            ExpectedColumn {
                name: self.foreign_key.clone(),
                default: DefaultValue::NullText,
            },
            ExpectedColumn {
                name: self.attribute.clone(),
                default: DefaultValue::Text(UNKNOWN.to_string()),
            },
        ]
    }
}

/// A table that went through [`ensure_columns`]: every expected column exists
/// and the measure is Float64. Only `ensure_columns` can build one.
#[derive(Debug, Clone)]
pub struct EnsuredTable(RecordBatch);

impl EnsuredTable {
    pub fn batch(&self) -> &RecordBatch {
        &self.0
    }

    pub fn into_batch(self) -> RecordBatch {
        self.0
    }
}

/// Add every missing expected column with its default and coerce a present
/// measure column to Float64 (non-numeric values become null).
pub fn ensure_columns(batch: &RecordBatch, schema: &FactSchema) -> Result<EnsuredTable> {
    let mut out = batch.clone();
    for expected in schema.expected_columns() {
        match out.column_by_name(&expected.name).cloned() {
            None => {
                debug!(column = %expected.name, default = ?expected.default, "adding defaulted column");
                let column = expected.default.column(out.num_rows());
                out = table::with_column(&out, &expected.name, column)?;
            }
            Some(present)
                if expected.default == DefaultValue::NullFloat
                    && present.data_type() != &DataType::Float64 =>
            {
                let floats: Float64Array = table::f64_values(&present).into_iter().collect();
                out = table::with_column(&out, &expected.name, Arc::new(floats))?;
            }
            Some(_) => {}
        }
    }
    Ok(EnsuredTable(out))
}

/// Left join `attribute` from `dim` onto the fact through `schema.foreign_key`.
///
/// Keys are compared by their rendered value so an Int64 foreign key matches
/// a Utf8 dimension id. Unmatched rows, null keys and null attribute values
/// all become [`UNKNOWN`]. A dimension without `id` leaves the fact as it is.
pub fn join_attribute(
    fact: EnsuredTable,
    dim: &RecordBatch,
    schema: &FactSchema,
) -> Result<EnsuredTable> {
    let Some(ids) = dim.column_by_name(ID_COLUMN) else {
        warn!("dimension has no id column, join skipped");
        return Ok(fact);
    };
    let values = dim.column_by_name(&schema.attribute);

    let mut lookup: HashMap<String, Option<String>> = HashMap::with_capacity(dim.num_rows());
    for row in 0..dim.num_rows() {
        if let Some(key) = table::value_key(ids, row) {
            let value = values.and_then(|v| table::value_key(v, row));
            lookup.entry(key).or_insert(value);
        }
    }

    let batch = fact.into_batch();
    let keys = batch
        .column_by_name(&schema.foreign_key)
        .cloned()
        .unwrap_or_else(|| table::null_column(&DataType::Utf8, batch.num_rows()));

    let mut unmatched = 0usize;
    let joined: StringArray = (0..batch.num_rows())
        .map(|row| {
            let hit = table::value_key(&keys, row)
                .and_then(|k| lookup.get(&k).cloned())
                .flatten();
            if hit.is_none() {
                unmatched += 1;
            }
            Some(hit.unwrap_or_else(|| UNKNOWN.to_string()))
        })
        .collect();
    debug!(unmatched, attribute = %schema.attribute, "joined dimension attribute");

    let batch = table::with_column(&batch, &schema.attribute, Arc::new(joined))?;
    Ok(EnsuredTable(batch))
}

/// Parse the date column leniently and derive `day` (Date32) and `month`
/// (`YYYY-MM`). Rows with an unparseable date keep null in all three.
pub fn derive_periods(fact: EnsuredTable, schema: &FactSchema) -> Result<RecordBatch> {
    let batch = fact.into_batch();
    let raw = batch
        .column_by_name(&schema.date)
        .cloned()
        .unwrap_or_else(|| table::null_column(&date_parser::TIMESTAMP_TYPE, batch.num_rows()));
    let parsed = date_parser::to_timestamp_array(&raw);

    let dates: Vec<_> = match parsed.as_any().downcast_ref::<TimestampMillisecondArray>() {
        Some(ts) => ts
            .iter()
            .map(|v| v.and_then(date_parser::millis_to_date))
            .collect(),
        None => vec![None; batch.num_rows()],
    };
    let day: Date32Array = dates
        .iter()
        .map(|d| d.map(date_parser::date_to_days))
        .collect();
    let month: StringArray = dates
        .iter()
        .map(|d| d.map(|d| d.format("%Y-%m").to_string()))
        .collect();

    let batch = table::with_column(&batch, &schema.date, parsed)?;
    let batch = table::with_column(&batch, DAY_COLUMN, Arc::new(day))?;
    table::with_column(&batch, MONTH_COLUMN, Arc::new(month))
}

/// Ensure, join, then derive periods.
pub fn build_fact(
    transactions: &RecordBatch,
    dim_client: &RecordBatch,
    schema: &FactSchema,
) -> Result<RecordBatch> {
    let ensured = ensure_columns(transactions, schema)?;
    let joined = join_attribute(ensured, dim_client, schema)?;
    derive_periods(joined, schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;

    fn schema() -> FactSchema {
        FactSchema {
            date: "purchase_date".into(),
            measure: "amount".into(),
            foreign_key: "client_id".into(),
            attribute: "country".into(),
        }
    }

    fn strings(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        let col = batch.column_by_name(name).unwrap();
        (0..batch.num_rows()).map(|r| table::value_key(col, r)).collect()
    }

    #[test]
    fn missing_columns_are_defaulted() -> Result<()> {
        let bare = RecordBatch::try_from_iter(vec![(
            "id",
            Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef,
        )])?;
        let ensured = ensure_columns(&bare, &schema())?;
        let batch = ensured.batch();
        assert_eq!(batch.num_columns(), 5);
        assert_eq!(
            batch.column_by_name("amount").unwrap().data_type(),
            &DataType::Float64
        );
        assert_eq!(
            batch.column_by_name("purchase_date").unwrap().data_type(),
            &date_parser::TIMESTAMP_TYPE
        );
        assert_eq!(strings(batch, "country"), vec![Some(UNKNOWN.into()); 2]);
        Ok(())
    }

    #[test]
    fn join_defaults_unmatched_and_null_keys() -> Result<()> {
        let purchases = RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(vec![1, 2, 3, 4])) as ArrayRef),
            (
                "client_id",
                Arc::new(Int64Array::from(vec![Some(10), Some(11), Some(99), None])) as ArrayRef,
            ),
            (
                "amount",
                Arc::new(StringArray::from(vec!["5", "x", "7.5", "1"])) as ArrayRef,
            ),
            (
                "purchase_date",
                Arc::new(StringArray::from(vec![
                    "2024-03-05",
                    "2024-03-06 12:00:00",
                    "bad",
                    "2024-04-01",
                ])) as ArrayRef,
            ),
        ])?;
        let dim = RecordBatch::try_from_iter(vec![
            (
                "id",
                Arc::new(StringArray::from(vec!["10", "11"])) as ArrayRef,
            ),
            (
                "country",
                Arc::new(StringArray::from(vec![Some("France"), None])) as ArrayRef,
            ),
        ])?;

        let fact = build_fact(&purchases, &dim, &schema())?;
        assert_eq!(
            strings(&fact, "country"),
            vec![
                Some("France".into()),
                Some(UNKNOWN.into()),
                Some(UNKNOWN.into()),
                Some(UNKNOWN.into())
            ]
        );
        assert_eq!(fact.column_by_name("country").unwrap().null_count(), 0);
        let amount = fact
            .column_by_name("amount")
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(
            amount.iter().collect::<Vec<_>>(),
            vec![Some(5.0), None, Some(7.5), Some(1.0)]
        );
        assert_eq!(
            strings(&fact, MONTH_COLUMN),
            vec![
                Some("2024-03".into()),
                Some("2024-03".into()),
                None,
                Some("2024-04".into())
            ]
        );
        assert_eq!(
            strings(&fact, DAY_COLUMN)[1].as_deref(),
            Some("2024-03-06")
        );
        Ok(())
    }

    #[test]
    fn dimension_without_id_skips_join() -> Result<()> {
        let purchases = RecordBatch::try_from_iter(vec![(
            "client_id",
            Arc::new(Int64Array::from(vec![1])) as ArrayRef,
        )])?;
        let dim = RecordBatch::try_from_iter(vec![(
            "country",
            Arc::new(StringArray::from(vec!["France"])) as ArrayRef,
        )])?;
        let fact = build_fact(&purchases, &dim, &schema())?;
        assert_eq!(strings(&fact, "country"), vec![Some(UNKNOWN.into())]);
        Ok(())
    }
}
