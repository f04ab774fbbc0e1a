use anyhow::Result;
use arrow::{
    array::{ArrayRef, Float64Array, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

use super::kpi::{MetricRow, TRACKED_METRICS};
use crate::table;

/// Change of every tracked metric against the previously promoted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiComparison {
    pub has_previous: bool,
    pub delta: BTreeMap<String, Option<f64>>,
    pub pct_change: BTreeMap<String, Option<f64>>,
}

/// `delta = cur - prev` and `pct = (cur - prev) / max(prev, 1)` per metric.
///
/// Both are `None` when either side lacks the metric, and for every metric
/// when there is no previous snapshot.
pub fn compare_kpis(current: &MetricRow, previous: Option<&MetricRow>) -> KpiComparison {
    let mut delta = BTreeMap::new();
    let mut pct_change = BTreeMap::new();
    for metric in TRACKED_METRICS {
        let cur = current.get(metric).copied().flatten();
        let prev = previous.and_then(|p| p.get(metric).copied().flatten());
        let (d, pct) = match (cur, prev) {
            (Some(c), Some(p)) => (Some(c - p), Some((c - p) / p.max(1.0))),
            _ => (None, None),
        };
        delta.insert(metric.to_string(), d);
        pct_change.insert(metric.to_string(), pct);
    }
    KpiComparison {
        has_previous: previous.is_some(),
        delta,
        pct_change,
    }
}

impl KpiComparison {
    /// `kpi_comparison` table: one row per tracked metric.
    pub fn to_batch(&self) -> Result<RecordBatch> {
        let lookup = |m: &BTreeMap<String, Option<f64>>, k: &str| m.get(k).copied().flatten();
        let schema = Schema::new(vec![
            Field::new("metric", DataType::Utf8, true),
            Field::new("delta", DataType::Float64, true),
            Field::new("pct_change", DataType::Float64, true),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(TRACKED_METRICS)),
            Arc::new(
                TRACKED_METRICS
                    .iter()
                    .map(|m| lookup(&self.delta, *m))
                    .collect::<Float64Array>(),
            ),
            Arc::new(
                TRACKED_METRICS
                    .iter()
                    .map(|m| lookup(&self.pct_change, *m))
                    .collect::<Float64Array>(),
            ),
        ];
        table::build_batch(Arc::new(schema), columns, TRACKED_METRICS.len())
    }
}
