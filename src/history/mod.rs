//! Versioned artifacts: every table is kept as an immutable per-run history
//! copy, a rolling backup and a validation-gated `current` copy.
//!
//! Layout inside a bucket:
//!
//! ```text
//! current/<name>.parquet
//! backup/<name>.parquet
//! history/run_ts=<YYYY-MM-DDTHH-MM-SS>/<name>.parquet
//! history/run_ts=<YYYY-MM-DDTHH-MM-SS>/metadata.json
//! ```

pub mod writer;

use anyhow::{Context, Result};
use arrow::{array::Array, record_batch::RecordBatch};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::silver::ID_COLUMN;

pub use writer::{VersionedWriter, WriteOutcome};

pub const RUN_TS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
pub const CURRENT_PREFIX: &str = "current";
pub const BACKUP_PREFIX: &str = "backup";
pub const HISTORY_PREFIX: &str = "history";
pub const METADATA_FILE: &str = "metadata.json";

/// Identifier of one pipeline run: a UTC timestamp at second precision.
///
/// A single `RunId` is shared by every table written in the same run so their
/// history copies land in the same `run_ts=` folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(DateTime<Utc>);

impl RunId {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        Self(ts.trunc_subsecs(0))
    }

    /// Folder name under `history/`.
    pub fn folder(&self) -> String {
        format!("{}/run_ts={}", HISTORY_PREFIX, self)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(RUN_TS_FORMAT))
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let naive = NaiveDateTime::parse_from_str(s, RUN_TS_FORMAT)
            .with_context(|| format!("run id `{}` does not match {}", s, RUN_TS_FORMAT))?;
        Ok(Self(naive.and_utc()))
    }
}

impl TryFrom<String> for RunId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RunId> for String {
    fn from(run: RunId) -> Self {
        run.to_string()
    }
}

pub fn parquet_file(name: &str) -> String {
    format!("{}.parquet", name)
}

pub fn current_key(name: &str) -> String {
    format!("{}/{}", CURRENT_PREFIX, parquet_file(name))
}

pub fn backup_key(name: &str) -> String {
    format!("{}/{}", BACKUP_PREFIX, parquet_file(name))
}

pub fn history_key(run: &RunId, file: &str) -> String {
    format!("{}/{}", run.folder(), file)
}

/// Extract the run id from a key such as `history/run_ts=<ts>/x.parquet`.
pub fn run_id_from_key(key: &str) -> Option<RunId> {
    let rest = key.strip_prefix(HISTORY_PREFIX)?.strip_prefix("/run_ts=")?;
    let ts = rest.split('/').next()?;
    ts.parse().ok()
}

/// Gate that decides whether a written table may replace `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    /// Table has an `id` column that is not entirely null.
    HasId,
    /// Table has exactly one row.
    SingleRow,
    Always,
}

impl Validation {
    pub fn check(&self, batch: &RecordBatch) -> bool {
        match self {
            Validation::HasId => batch
                .column_by_name(ID_COLUMN)
                .is_some_and(|ids| batch.num_rows() > 0 && ids.null_count() < ids.len()),
            Validation::SingleRow => batch.num_rows() == 1,
            Validation::Always => true,
        }
    }
}
