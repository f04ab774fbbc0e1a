use anyhow::{Context, Result};
use arrow::{
    array::{ArrayRef, Float64Array, Int64Array, UInt32Array},
    compute::{sort_to_indices, take},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::table;
use crate::UNKNOWN;

pub const CA_COLUMN: &str = "ca";
pub const VOLUME_COLUMN: &str = "volume";

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    first_row: u32,
    ca: f64,
    volume: i64,
}

/// Revenue per value of `key`: `ca` is the sum of `measure`, `volume` the
/// number of non-null measures.
///
/// Rows with a null key are dropped. When `key` is not a column at all,
/// every row falls into a single [`UNKNOWN`] bucket. Output rows are sorted
/// by key and the key column keeps its source type.
pub fn aggregate_by(fact: &RecordBatch, key: &str, measure: &str) -> Result<RecordBatch> {
    let n = fact.num_rows();
    let keys = match fact.column_by_name(key) {
        Some(col) => col.clone(),
        None => {
            debug!(key, "group key missing, using a single UNKNOWN bucket");
            table::text_column(UNKNOWN, n)
        }
    };
    let amounts = fact
        .column_by_name(measure)
        .map(table::f64_values)
        .unwrap_or_else(|| vec![None; n]);

    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Bucket> = HashMap::new();
    for (row, amount) in amounts.iter().enumerate() {
        let Some(k) = table::value_key(&keys, row) else {
            continue;
        };
        let bucket = buckets.entry(k.clone()).or_insert_with(|| {
            order.push(k);
            Bucket {
                first_row: row as u32,
                ..Default::default()
            }
        });
        if let Some(v) = amount {
            bucket.ca += v;
            bucket.volume += 1;
        }
    }

    let groups: Vec<Bucket> = order.iter().map(|k| buckets[k]).collect();
    let firsts = UInt32Array::from_iter_values(groups.iter().map(|b| b.first_row));
    let group_keys = take(keys.as_ref(), &firsts, None).context("gathering group keys")?;
    let ca: ArrayRef = Arc::new(Float64Array::from_iter_values(groups.iter().map(|b| b.ca)));
    let volume: ArrayRef = Arc::new(Int64Array::from_iter_values(groups.iter().map(|b| b.volume)));

    let sorted = sort_to_indices(group_keys.as_ref(), None, None).context("sorting groups")?;
    let columns = [group_keys, ca, volume]
        .iter()
        .map(|c| take(c.as_ref(), &sorted, None))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("reordering groups")?;

    let schema = Schema::new(vec![
        Field::new(key, columns[0].data_type().clone(), true),
        Field::new(CA_COLUMN, DataType::Float64, true),
        Field::new(VOLUME_COLUMN, DataType::Int64, true),
    ]);
    table::build_batch(Arc::new(schema), columns, groups.len())
}
