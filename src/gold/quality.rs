use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use crate::table;

/// Data-quality figures over the unfiltered fact table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub row_count: u64,
    /// Fraction of rows whose measure is null or absent.
    pub null_amount_pct: f64,
    /// Fraction of rows whose measure is negative.
    pub negative_amount_pct: f64,
}

impl QualityReport {
    /// Both fractions are 0.0 for an empty table. A missing measure column
    /// counts every row as null.
    pub fn compute(fact: &RecordBatch, measure: &str) -> Self {
        let rows = fact.num_rows();
        if rows == 0 {
            return Self {
                row_count: 0,
                null_amount_pct: 0.0,
                negative_amount_pct: 0.0,
            };
        }
        let values = fact
            .column_by_name(measure)
            .map(table::f64_values)
            .unwrap_or_else(|| vec![None; rows]);

        let nulls = values.iter().filter(|v| v.is_none()).count();
        let negatives = values.iter().flatten().filter(|v| **v < 0.0).count();
        Self {
            row_count: rows as u64,
            null_amount_pct: nulls as f64 / rows as f64,
            negative_amount_pct: negatives as f64 / rows as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Float64Array};
    use std::sync::Arc;

    fn fact(amounts: Vec<Option<f64>>) -> RecordBatch {
        RecordBatch::try_from_iter(vec![(
            "amount",
            Arc::new(Float64Array::from(amounts)) as ArrayRef,
        )])
        .unwrap()
    }

    #[test]
    fn fractions_over_all_rows() {
        let q = QualityReport::compute(
            &fact(vec![Some(1.0), None, Some(-2.0), Some(3.0)]),
            "amount",
        );
        assert_eq!(q.row_count, 4);
        assert_eq!(q.null_amount_pct, 0.25);
        assert_eq!(q.negative_amount_pct, 0.25);
    }

    #[test]
    fn empty_table_is_all_zero() {
        let q = QualityReport::compute(&fact(vec![]), "amount");
        assert_eq!(
            q,
            QualityReport {
                row_count: 0,
                null_amount_pct: 0.0,
                negative_amount_pct: 0.0
            }
        );
    }

    #[test]
    fn missing_measure_is_all_null() {
        let q = QualityReport::compute(&fact(vec![Some(1.0), Some(2.0)]), "price");
        assert_eq!(q.null_amount_pct, 1.0);
    }
}
