//! Bronze → silver → gold tabular pipeline.
//!
//! Bronze CSV exports are normalised and cleaned into silver Parquet tables,
//! which feed a small dimensional model, aggregates and a KPI snapshot that is
//! compared against the previously promoted one. Every table is persisted
//! through [`history::VersionedWriter`] as an immutable history copy, a backup
//! and a validation-gated `current` copy.

pub mod config;
pub mod error;
pub mod flow;
pub mod gold;
pub mod history;
pub mod silver;
pub mod store;
pub mod table;

/// Placeholder used for missing text values and for unmatched categorical keys.
pub const UNKNOWN: &str = "UNKNOWN";
