//! Pipeline configuration: a YAML file where every field has a default,
//! overridden by `PIPELINE_*` environment variables and then by CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::flow::retry::RetryPolicy;
use crate::gold::fact::FactSchema;
use crate::silver::{ColumnType, TypeMap};

pub const ENV_STORE_ROOT: &str = "PIPELINE_STORE_ROOT";
pub const ENV_BRONZE_BUCKET: &str = "PIPELINE_BRONZE_BUCKET";
pub const ENV_SILVER_BUCKET: &str = "PIPELINE_SILVER_BUCKET";
pub const ENV_GOLD_BUCKET: &str = "PIPELINE_GOLD_BUCKET";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub silver: SilverConfig,
    pub gold: GoldSettings,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one sub-directory per bucket.
    pub root: PathBuf,
    pub bronze_bucket: String,
    pub silver_bucket: String,
    pub gold_bucket: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            bronze_bucket: "bronze".into(),
            silver_bucket: "silver".into(),
            gold_bucket: "gold".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilverConfig {
    /// Also process bronze `*.csv` objects that have no entry in `tables`.
    pub discover: bool,
    /// Table name (bronze object stem) to declared column types. Keys are
    /// canonical column names, `id` for the identifier.
    pub tables: BTreeMap<String, TypeMap>,
}

impl Default for SilverConfig {
    fn default() -> Self {
        let clients = TypeMap::from([
            ("id".to_string(), ColumnType::Int64),
            ("age".to_string(), ColumnType::Int64),
            ("birth_date".to_string(), ColumnType::Timestamp),
            ("date_inscription".to_string(), ColumnType::Timestamp),
        ]);
        let achats = TypeMap::from([
            ("id".to_string(), ColumnType::Int64),
            ("montant".to_string(), ColumnType::Float64),
            ("date_achat".to_string(), ColumnType::Timestamp),
        ]);
        Self {
            discover: true,
            tables: BTreeMap::from([("clients".into(), clients), ("achats".into(), achats)]),
        }
    }
}

impl SilverConfig {
    pub fn types_for(&self, table: &str) -> TypeMap {
        self.tables.get(table).cloned().unwrap_or_default()
    }
}

/// Inputs and column roles of the gold model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldSettings {
    pub client_table: String,
    pub transactions_table: String,
    /// Source name to gold name, applied to the client table.
    pub client_aliases: BTreeMap<String, String>,
    /// Source name to gold name, applied to the transactions table.
    pub transaction_aliases: BTreeMap<String, String>,
    pub measure: String,
    pub date: String,
    /// Transactions column referencing the client dimension `id`.
    pub foreign_key: String,
    /// Entity used for revenue concentration.
    pub entity: String,
    /// Client attribute joined onto the fact.
    pub attribute: String,
}

impl Default for GoldSettings {
    fn default() -> Self {
        let aliases = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect()
        };
        Self {
            client_table: "clients".into(),
            transactions_table: "achats".into(),
            client_aliases: aliases(&[("nom", "name"), ("pays", "country")]),
            transaction_aliases: aliases(&[
                ("id_client", "client_id"),
                ("montant", "amount"),
                ("date_achat", "purchase_date"),
            ]),
            measure: "amount".into(),
            date: "purchase_date".into(),
            foreign_key: "client_id".into(),
            entity: "client_id".into(),
            attribute: "country".into(),
        }
    }
}

impl GoldSettings {
    pub fn fact_schema(&self) -> FactSchema {
        FactSchema {
            date: self.date.clone(),
            measure: self.measure.clone(),
            foreign_key: self.foreign_key.clone(),
            attribute: self.attribute.clone(),
        }
    }
}

impl PipelineConfig {
    /// Read `path` if given (defaults otherwise), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// An empty document yields the defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `PIPELINE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_STORE_ROOT) {
            debug!(%root, "store root from environment");
            self.store.root = PathBuf::from(root);
        }
        for (key, slot) in [
            (ENV_BRONZE_BUCKET, &mut self.store.bronze_bucket),
            (ENV_SILVER_BUCKET, &mut self.store.silver_bucket),
            (ENV_GOLD_BUCKET, &mut self.store.gold_bucket),
        ] {
            if let Some(bucket) = lookup(key) {
                debug!(key, %bucket, "bucket from environment");
                *slot = bucket;
            }
        }
    }
}
