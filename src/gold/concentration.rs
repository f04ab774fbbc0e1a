use arrow::record_batch::RecordBatch;
use std::collections::HashMap;

use crate::table;

/// Fraction of entities that make up the top group.
pub const TOP_SHARE: f64 = 0.2;

/// Revenue share of the top 20% of entities (at least one).
///
/// Rows with a null entity are ignored and null measures contribute 0.
/// Returns 0.0 when either column is missing, there are no entities, or the
/// grand total is zero.
pub fn top_share(fact: &RecordBatch, entity: &str, measure: &str) -> f64 {
    let (Some(entities), Some(measures)) =
        (fact.column_by_name(entity), fact.column_by_name(measure))
    else {
        return 0.0;
    };
    let amounts = table::f64_values(measures);

    let mut totals: HashMap<String, f64> = HashMap::new();
    for (row, amount) in amounts.iter().enumerate() {
        if let Some(key) = table::value_key(entities, row) {
            *totals.entry(key).or_default() += amount.unwrap_or(0.0);
        }
    }
    share_of_top(totals.into_values().collect(), TOP_SHARE)
}

/// Fraction of `sum(per_entity)` held by the largest `max(floor(n * share), 1)` values.
pub fn share_of_top(mut per_entity: Vec<f64>, share: f64) -> f64 {
    if per_entity.is_empty() {
        return 0.0;
    }
    let grand: f64 = per_entity.iter().sum();
    if grand == 0.0 {
        return 0.0;
    }
    per_entity.sort_by(|a, b| b.total_cmp(a));
    let top_n = ((per_entity.len() as f64 * share).floor() as usize).max(1);
    per_entity.iter().take(top_n).sum::<f64>() / grand
}
