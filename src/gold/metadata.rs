use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{compare::KpiComparison, kpi::KpiSnapshot, quality::QualityReport};
use crate::history::RunId;

/// `metadata.json` written next to a gold run's history tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_ts: RunId,
    pub quality: QualityReport,
    pub kpis: KpiSnapshot,
    pub kpi_comparison: KpiComparison,
    pub ca_concentration_top_20_pct: f64,
}

impl RunMetadata {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing run metadata")
    }

    pub fn from_json_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("parsing run metadata")
    }
}
