use anyhow::{bail, Context, Result};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, instrument, warn};

use super::{
    backup_key, current_key, history_key, parquet_file, run_id_from_key, RunId, Validation,
    HISTORY_PREFIX,
};
use crate::error::StoreError;
use crate::store::{self, ObjectStore, JSON_CONTENT_TYPE, PARQUET_CONTENT_TYPE};
use crate::table::{read_parquet_from_memory, write_parquet_to_memory};

/// Where a table ended up after [`VersionedWriter::write_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Validation passed: `current` now holds this payload.
    Promoted { current: String, history: String },
    /// Validation failed: only history and backup were written and `current`
    /// still holds the last promoted payload.
    Degraded { history: String },
}

impl WriteOutcome {
    /// Key of the copy downstream readers should use for this run.
    pub fn effective_path(&self) -> &str {
        match self {
            WriteOutcome::Promoted { current, .. } => current,
            WriteOutcome::Degraded { history } => history,
        }
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self, WriteOutcome::Promoted { .. })
    }

    pub fn history_path(&self) -> &str {
        match self {
            WriteOutcome::Promoted { history, .. } | WriteOutcome::Degraded { history } => {
                history
            }
        }
    }
}

/// Writes tables and run documents into one bucket following the
/// current/backup/history layout.
#[derive(Clone)]
pub struct VersionedWriter {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl VersionedWriter {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Persist `batch` as `name` for `run`.
    ///
    /// History and backup are always written. `current` is overwritten only
    /// when `validation` passes.
    #[instrument(level = "info", skip(self, batch), fields(bucket = %self.bucket, rows = batch.num_rows()))]
    pub async fn write_table(
        &self,
        batch: &RecordBatch,
        name: &str,
        run: &RunId,
        validation: Validation,
    ) -> Result<WriteOutcome> {
        store::ensure_bucket(self.store.as_ref(), &self.bucket).await?;

        let payload = Bytes::from(
            write_parquet_to_memory(batch).with_context(|| format!("encoding table `{}`", name))?,
        );

        let history = history_key(run, &parquet_file(name));
        self.put_immutable(&history, payload.clone(), PARQUET_CONTENT_TYPE)
            .await?;

        let backup = backup_key(name);
        self.put(&backup, payload.clone(), PARQUET_CONTENT_TYPE)
            .await?;

        if !validation.check(batch) {
            warn!(
                table = name,
                ?validation,
                history = %history,
                "validation failed, current left unchanged"
            );
            return Ok(WriteOutcome::Degraded { history });
        }

        let current = current_key(name);
        self.put(&current, payload, PARQUET_CONTENT_TYPE).await?;
        info!(table = name, current = %current, "promoted");
        Ok(WriteOutcome::Promoted { current, history })
    }

    /// Store a JSON document inside the run's history folder.
    pub async fn write_document(&self, run: &RunId, file: &str, json: Vec<u8>) -> Result<String> {
        store::ensure_bucket(self.store.as_ref(), &self.bucket).await?;
        let key = history_key(run, file);
        self.put_immutable(&key, Bytes::from(json), JSON_CONTENT_TYPE)
            .await?;
        Ok(key)
    }

    /// The promoted copy of `name`, or `None` when nothing was ever promoted.
    pub async fn read_current(&self, name: &str) -> Result<Option<RecordBatch>> {
        let key = current_key(name);
        match self.store.get_object(&self.bucket, &key).await {
            Ok(data) => read_parquet_from_memory(data)
                .with_context(|| format!("decoding {}/{}", self.bucket, key))
                .map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}/{}", self.bucket, key)),
        }
    }

    /// Raw bytes of one file from a run's history folder.
    pub async fn read_history(&self, run: &RunId, file: &str) -> Result<Bytes> {
        let key = history_key(run, file);
        self.store
            .get_object(&self.bucket, &key)
            .await
            .with_context(|| format!("reading {}/{}", self.bucket, key))
    }

    /// Runs that left anything in history, oldest first.
    pub async fn history_runs(&self) -> Result<Vec<RunId>> {
        if !self.store.bucket_exists(&self.bucket).await? {
            return Ok(Vec::new());
        }
        let keys = self
            .store
            .list_objects(&self.bucket, &format!("{}/", HISTORY_PREFIX))
            .await
            .with_context(|| format!("listing history in `{}`", self.bucket))?;
        let runs: BTreeSet<RunId> = keys.iter().filter_map(|k| run_id_from_key(k)).collect();
        Ok(runs.into_iter().collect())
    }

    /// Whether `run` already left anything in this bucket's history.
    pub async fn has_run(&self, run: &RunId) -> Result<bool> {
        if !self.store.bucket_exists(&self.bucket).await? {
            return Ok(false);
        }
        let prefix = format!("{}/", run.folder());
        let keys = self
            .store
            .list_objects(&self.bucket, &prefix)
            .await
            .with_context(|| format!("listing {}/{}", self.bucket, prefix))?;
        Ok(!keys.is_empty())
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        debug!(bucket = %self.bucket, key, bytes = data.len(), "put object");
        self.store
            .put_object(&self.bucket, key, data, content_type)
            .await
            .with_context(|| format!("writing {}/{}", self.bucket, key))
    }

    /// History objects are write-once. Re-writing identical bytes (a retried
    /// stage within the same run) is accepted; different bytes are refused.
    async fn put_immutable(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        match self.store.get_object(&self.bucket, key).await {
            Ok(existing) if existing == data => {
                debug!(key, "history object already present with same payload");
                Ok(())
            }
            Ok(_) => bail!(
                "history object {}/{} already exists with different contents",
                self.bucket,
                key
            ),
            Err(StoreError::NotFound { .. }) => self.put(key, data, content_type).await,
            Err(e) => Err(e).with_context(|| format!("checking {}/{}", self.bucket, key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use arrow::array::{ArrayRef, Float64Array, Int64Array};
    use chrono::{TimeZone, Utc};

    fn run_at(sec: u32) -> RunId {
        RunId::from_datetime(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, sec).unwrap())
    }

    fn clients(ids: Vec<Option<i64>>) -> RecordBatch {
        let n = ids.len();
        RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(ids)) as ArrayRef),
            (
                "score",
                Arc::new(Float64Array::from(vec![1.0; n])) as ArrayRef,
            ),
        ])
        .unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<Option<i64>> {
        batch
            .column_by_name("id")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .iter()
            .collect()
    }

    #[tokio::test]
    async fn failed_validation_keeps_previous_current() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = VersionedWriter::new(store.clone(), "silver");
        let (t1, t2) = (run_at(1), run_at(2));

        let good = clients(vec![Some(1), Some(2)]);
        let first = writer
            .write_table(&good, "clients", &t1, Validation::HasId)
            .await?;
        assert!(first.is_promoted());
        assert_eq!(first.effective_path(), "current/clients.parquet");

        let bad = clients(vec![None, None, None]);
        let second = writer
            .write_table(&bad, "clients", &t2, Validation::HasId)
            .await?;
        assert_eq!(
            second,
            WriteOutcome::Degraded {
                history: "history/run_ts=2024-05-01T12-00-02/clients.parquet".into()
            }
        );
        assert_eq!(second.effective_path(), second.history_path());

        let current = writer.read_current("clients").await?.unwrap();
        assert_eq!(ids(&current), vec![Some(1), Some(2)]);

        let backup = read_parquet_from_memory(store.get_object("silver", "backup/clients.parquet").await?)?;
        assert_eq!(backup.num_rows(), 3);

        for run in [t1, t2] {
            let key = history_key(&run, "clients.parquet");
            assert!(store.get_object("silver", &key).await.is_ok(), "{}", key);
        }
        assert_eq!(writer.history_runs().await?, vec![t1, t2]);
        Ok(())
    }

    #[tokio::test]
    async fn same_payload_twice_gives_two_history_entries() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = VersionedWriter::new(store.clone(), "gold");
        let table = clients(vec![Some(7)]);

        let a = writer
            .write_table(&table, "kpi", &run_at(1), Validation::SingleRow)
            .await?;
        let b = writer
            .write_table(&table, "kpi", &run_at(2), Validation::SingleRow)
            .await?;
        assert_ne!(a.history_path(), b.history_path());
        assert_eq!(store.list_objects("gold", "history/").await?.len(), 2);
        assert_eq!(
            store.content_type("gold", "current/kpi.parquet").as_deref(),
            Some(PARQUET_CONTENT_TYPE)
        );
        Ok(())
    }

    #[tokio::test]
    async fn history_is_write_once() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = VersionedWriter::new(store, "gold");
        let run = run_at(1);

        writer
            .write_table(&clients(vec![Some(1)]), "t", &run, Validation::Always)
            .await?;
        // retry within the same run with identical data is fine
        writer
            .write_table(&clients(vec![Some(1)]), "t", &run, Validation::Always)
            .await?;
        let err = writer
            .write_table(&clients(vec![Some(2)]), "t", &run, Validation::Always)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_current_and_documents() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = VersionedWriter::new(store.clone(), "gold");
        assert!(writer.read_current("kpi_global").await?.is_none());
        assert!(writer.history_runs().await?.is_empty());

        let run = run_at(3);
        let key = writer
            .write_document(&run, "metadata.json", br#"{"ok":true}"#.to_vec())
            .await?;
        assert_eq!(key, "history/run_ts=2024-05-01T12-00-03/metadata.json");
        assert_eq!(
            store.content_type("gold", &key).as_deref(),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            writer.read_history(&run, "metadata.json").await?,
            Bytes::from_static(br#"{"ok":true}"#)
        );
        Ok(())
    }
}
