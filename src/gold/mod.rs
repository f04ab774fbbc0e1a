//! Gold layer: dimensions, the purchase fact, aggregates and run KPIs.
//!
//! Everything here is a pure function of the silver inputs plus the
//! previously promoted `kpi_global`; persistence lives in `flow::stages`.

pub mod aggregate;
pub mod compare;
pub mod concentration;
pub mod dims;
pub mod fact;
pub mod kpi;
pub mod metadata;
pub mod quality;

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::GoldSettings;
use crate::history::{RunId, Validation};
use crate::table;

pub use compare::{compare_kpis, KpiComparison};
pub use kpi::{KpiSnapshot, MetricRow};
pub use metadata::RunMetadata;
pub use quality::QualityReport;

pub const DIM_CLIENT: &str = "dim_client";
pub const DIM_DATE: &str = "dim_date";
pub const FACT_ACHAT: &str = "fact_achat";
pub const AGG_CA_JOUR: &str = "agg_ca_jour";
pub const AGG_CA_MOIS: &str = "agg_ca_mois";
pub const AGG_CA_PAYS: &str = "agg_ca_pays";
pub const KPI_GLOBAL: &str = "kpi_global";
pub const KPI_COMPARISON: &str = "kpi_comparison";

/// Rename `source → target` for each alias whose source exists and whose
/// target does not.
pub fn apply_aliases(batch: &RecordBatch, aliases: &BTreeMap<String, String>) -> Result<RecordBatch> {
    let schema = batch.schema();
    let present = |name: &str| schema.column_with_name(name).is_some();
    let active: BTreeMap<&str, &str> = aliases
        .iter()
        .filter(|(src, dst)| present(src.as_str()) && !present(dst.as_str()))
        .map(|(src, dst)| (src.as_str(), dst.as_str()))
        .collect();
    if active.is_empty() {
        return Ok(batch.clone());
    }
    debug!(?active, "applying column aliases");
    table::rename_columns(batch, |name| {
        active.get(name).map_or_else(|| name.to_string(), |d| d.to_string())
    })
}

/// Every gold output of one run.
#[derive(Debug, Clone)]
pub struct GoldSnapshot {
    pub dim_client: RecordBatch,
    pub dim_date: RecordBatch,
    pub fact: RecordBatch,
    pub by_day: RecordBatch,
    pub by_month: RecordBatch,
    pub by_country: RecordBatch,
    pub kpis: KpiSnapshot,
    pub quality: QualityReport,
    pub comparison: KpiComparison,
    pub concentration: f64,
}

/// Build the whole gold model from silver clients and transactions.
///
/// `previous_kpis` is the last promoted `kpi_global`, if any.
pub fn build_snapshot(
    clients: &RecordBatch,
    transactions: &RecordBatch,
    previous_kpis: Option<&RecordBatch>,
    settings: &GoldSettings,
) -> Result<GoldSnapshot> {
    let clients = apply_aliases(clients, &settings.client_aliases)?;
    let transactions = apply_aliases(transactions, &settings.transaction_aliases)?;
    let schema = settings.fact_schema();

    let dim_client = dims::build_dim_client(&clients)?;
    let fact = fact::build_fact(&transactions, &dim_client, &schema)?;
    let dim_date = dims::build_dim_date(&fact, &schema.date)?;

    let by_day = aggregate::aggregate_by(&fact, fact::DAY_COLUMN, &schema.measure)?;
    let by_month = aggregate::aggregate_by(&fact, fact::MONTH_COLUMN, &schema.measure)?;
    let by_country = aggregate::aggregate_by(&fact, &schema.attribute, &schema.measure)?;

    let kpis = KpiSnapshot::compute(&fact, &schema.measure);
    let quality = QualityReport::compute(&fact, &schema.measure);
    let concentration = concentration::top_share(&fact, &settings.entity, &schema.measure);
    let previous = previous_kpis.map(kpi::metrics_from_batch);
    let comparison = compare_kpis(&kpis.metrics(), previous.as_ref());

    info!(
        fact_rows = fact.num_rows(),
        clients = dim_client.num_rows(),
        total_ca = kpis.total_ca,
        has_previous = comparison.has_previous,
        "gold model built"
    );

    Ok(GoldSnapshot {
        dim_client,
        dim_date,
        fact,
        by_day,
        by_month,
        by_country,
        kpis,
        quality,
        comparison,
        concentration,
    })
}

impl GoldSnapshot {
    /// Tables to persist, in write order, with the rule gating promotion.
    pub fn tables(&self) -> Result<Vec<(&'static str, RecordBatch, Validation)>> {
        Ok(vec![
            (DIM_CLIENT, self.dim_client.clone(), Validation::HasId),
            (DIM_DATE, self.dim_date.clone(), Validation::Always),
            (FACT_ACHAT, self.fact.clone(), Validation::Always),
            (AGG_CA_JOUR, self.by_day.clone(), Validation::Always),
            (AGG_CA_MOIS, self.by_month.clone(), Validation::Always),
            (AGG_CA_PAYS, self.by_country.clone(), Validation::Always),
            (KPI_GLOBAL, self.kpis.to_batch()?, Validation::SingleRow),
            (KPI_COMPARISON, self.comparison.to_batch()?, Validation::Always),
        ])
    }

    pub fn metadata(&self, run: RunId) -> RunMetadata {
        RunMetadata {
            run_ts: run,
            quality: self.quality.clone(),
            kpis: self.kpis.clone(),
            kpi_comparison: self.comparison.clone(),
            ca_concentration_top_20_pct: self.concentration,
        }
    }
}
