use anyhow::Result;
use arrow::{
    array::{ArrayRef, Float64Array, Int64Array},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

use crate::table::{self, median};

/// Metrics tracked across runs, in output order.
pub const TRACKED_METRICS: [&str; 6] = [
    "total_ca",
    "total_transactions",
    "avg_panier",
    "median_panier",
    "max_panier",
    "ca_per_transaction",
];

/// Headline revenue KPIs of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSnapshot {
    pub total_ca: f64,
    pub total_transactions: i64,
    pub avg_panier: Option<f64>,
    pub median_panier: Option<f64>,
    pub max_panier: Option<f64>,
    pub ca_per_transaction: f64,
}

impl KpiSnapshot {
    /// KPIs over the non-null values of `measure`. A missing column counts
    /// as no transactions.
    pub fn compute(fact: &RecordBatch, measure: &str) -> Self {
        let values: Vec<f64> = fact
            .column_by_name(measure)
            .map(table::f64_values)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .collect();

        let total_ca: f64 = values.iter().sum();
        let count = values.len();
        let (avg, max) = if values.is_empty() {
            (None, None)
        } else {
            (
                Some(total_ca / count as f64),
                values.iter().copied().reduce(f64::max),
            )
        };

        Self {
            total_ca,
            total_transactions: count as i64,
            avg_panier: avg,
            median_panier: median(&values),
            max_panier: max,
            ca_per_transaction: total_ca / count.max(1) as f64,
        }
    }

    /// Single-row `kpi_global` table.
    pub fn to_batch(&self) -> Result<RecordBatch> {
        let schema = Schema::new(vec![
            Field::new("total_ca", DataType::Float64, true),
            Field::new("total_transactions", DataType::Int64, true),
            Field::new("avg_panier", DataType::Float64, true),
            Field::new("median_panier", DataType::Float64, true),
            Field::new("max_panier", DataType::Float64, true),
            Field::new("ca_per_transaction", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Float64Array::from(vec![self.total_ca])),
            Arc::new(Int64Array::from(vec![self.total_transactions])),
            Arc::new(Float64Array::from(vec![self.avg_panier])),
            Arc::new(Float64Array::from(vec![self.median_panier])),
            Arc::new(Float64Array::from(vec![self.max_panier])),
            Arc::new(Float64Array::from(vec![self.ca_per_transaction])),
        ];
        table::build_batch(Arc::new(schema), columns, 1)
    }

    /// Metric name to value, as the comparator consumes it.
    pub fn metrics(&self) -> MetricRow {
        BTreeMap::from([
            ("total_ca".to_string(), Some(self.total_ca)),
            (
                "total_transactions".to_string(),
                Some(self.total_transactions as f64),
            ),
            ("avg_panier".to_string(), self.avg_panier),
            ("median_panier".to_string(), self.median_panier),
            ("max_panier".to_string(), self.max_panier),
            ("ca_per_transaction".to_string(), Some(self.ca_per_transaction)),
        ])
    }
}

/// One KPI row keyed by metric name. Absent or null metrics map to `None`.
pub type MetricRow = BTreeMap<String, Option<f64>>;

/// Read the first row of a stored `kpi_global` table.
///
/// Tolerant of older or partial tables: a missing or non-numeric column
/// simply yields `None` for that metric.
pub fn metrics_from_batch(batch: &RecordBatch) -> MetricRow {
    TRACKED_METRICS
        .iter()
        .map(|name| {
            let value = batch
                .column_by_name(name)
                .filter(|_| batch.num_rows() > 0)
                .and_then(|col| table::f64_values(col).first().copied().flatten());
            (name.to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, StringArray};

    fn fact(amounts: Vec<Option<f64>>) -> RecordBatch {
        RecordBatch::try_from_iter(vec![(
            "amount",
            Arc::new(Float64Array::from(amounts)) as ArrayRef,
        )])
        .unwrap()
    }

    #[test]
    fn kpis_ignore_null_measures() {
        let kpi = KpiSnapshot::compute(&fact(vec![Some(10.0), None, Some(30.0), Some(20.0)]), "amount");
        assert_eq!(kpi.total_ca, 60.0);
        assert_eq!(kpi.total_transactions, 3);
        assert_eq!(kpi.avg_panier, Some(20.0));
        assert_eq!(kpi.median_panier, Some(20.0));
        assert_eq!(kpi.max_panier, Some(30.0));
        assert_eq!(kpi.ca_per_transaction, 20.0);
    }

    #[test]
    fn empty_input_gives_zero_totals_and_null_stats() -> Result<()> {
        let kpi = KpiSnapshot::compute(&fact(vec![]), "amount");
        assert_eq!(kpi.total_ca, 0.0);
        assert_eq!(kpi.total_transactions, 0);
        assert_eq!(kpi.avg_panier, None);
        assert_eq!(kpi.median_panier, None);
        assert_eq!(kpi.max_panier, None);
        assert_eq!(kpi.ca_per_transaction, 0.0);

        let batch = kpi.to_batch()?;
        assert_eq!(batch.num_rows(), 1);
        assert!(batch.column_by_name("avg_panier").unwrap().is_null(0));
        Ok(())
    }

    #[test]
    fn all_null_measure_has_no_stats() {
        let kpi = KpiSnapshot::compute(&fact(vec![None, None]), "amount");
        assert_eq!(kpi.total_ca, 0.0);
        assert_eq!(kpi.total_transactions, 0);
        assert_eq!(kpi.ca_per_transaction, 0.0);
        assert_eq!(kpi.avg_panier, None);
        assert_eq!(kpi.median_panier, None);
        assert_eq!(kpi.max_panier, None);
    }

    #[test]
    fn infinite_measures_are_ignored() -> Result<()> {
        let kpi = KpiSnapshot::compute(&fact(vec![Some(f64::INFINITY), Some(5.0)]), "amount");
        assert_eq!(kpi.total_ca, 5.0);
        assert_eq!(kpi.total_transactions, 1);
        let json = serde_json::to_vec(&kpi)?;
        assert_eq!(serde_json::from_slice::<KpiSnapshot>(&json)?, kpi);
        Ok(())
    }

    #[test]
    fn missing_measure_is_empty() {
        let kpi = KpiSnapshot::compute(&fact(vec![Some(1.0)]), "price");
        assert_eq!(kpi.total_transactions, 0);
    }

    #[test]
    fn stored_table_reads_back_as_metrics() -> Result<()> {
        let kpi = KpiSnapshot::compute(&fact(vec![Some(4.0), Some(6.0)]), "amount");
        let row = metrics_from_batch(&kpi.to_batch()?);
        assert_eq!(row, kpi.metrics());

        let partial = RecordBatch::try_from_iter(vec![(
            "total_ca",
            Arc::new(StringArray::from(vec!["oops"])) as ArrayRef,
        )])?;
        let row = metrics_from_batch(&partial);
        assert_eq!(row.len(), TRACKED_METRICS.len());
        assert!(row.values().all(Option::is_none));
        Ok(())
    }
}
