use anyhow::{bail, Context, Result};
use arrow::record_batch::RecordBatch;
use futures::FutureExt;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info, instrument, warn};

use super::scheduler::{Scheduler, TaskFn};
use crate::config::PipelineConfig;
use crate::error;
use crate::gold::{self, RunMetadata, KPI_GLOBAL};
use crate::history::{
    parquet_file, RunId, Validation, VersionedWriter, WriteOutcome, METADATA_FILE,
};
use crate::silver::{self, CastReport};
use crate::store::ObjectStore;
use crate::table::{read_parquet_from_memory, RawTable};

pub const GOLD_STAGE: &str = "gold";
const CSV_SUFFIX: &str = ".csv";

pub fn silver_stage_name(table: &str) -> String {
    format!("silver:{}", table)
}

/// Everything a stage needs: the store, the configuration and the run id
/// shared by every table written in this run.
pub struct PipelineContext {
    pub store: Arc<dyn ObjectStore>,
    pub config: PipelineConfig,
    pub run: RunId,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn ObjectStore>, config: PipelineConfig, run: RunId) -> Self {
        Self { store, config, run }
    }

    pub fn silver_writer(&self) -> VersionedWriter {
        VersionedWriter::new(self.store.clone(), &self.config.store.silver_bucket)
    }

    pub fn gold_writer(&self) -> VersionedWriter {
        VersionedWriter::new(self.store.clone(), &self.config.store.gold_bucket)
    }
}

/// Tables to run through silver: every configured table, plus each top-level
/// `*.csv` object in the bronze bucket when discovery is on.
pub async fn bronze_tables(ctx: &PipelineContext) -> Result<Vec<String>> {
    let mut tables: BTreeSet<String> = ctx.config.silver.tables.keys().cloned().collect();
    let bucket = &ctx.config.store.bronze_bucket;
    if ctx.config.silver.discover && ctx.store.bucket_exists(bucket).await? {
        let keys = ctx
            .store
            .list_objects(bucket, "")
            .await
            .with_context(|| format!("listing bronze bucket `{}`", bucket))?;
        tables.extend(
            keys.iter()
                .filter(|k| !k.contains('/'))
                .filter_map(|k| k.strip_suffix(CSV_SUFFIX))
                .map(str::to_string),
        );
    }
    Ok(tables.into_iter().collect())
}

#[derive(Debug, Clone)]
pub struct SilverOutcome {
    pub table: String,
    pub rows: usize,
    pub write: WriteOutcome,
    pub casts: CastReport,
}

/// bronze `<table>.csv` → normalise → clean → versioned silver write.
#[instrument(level = "info", skip(ctx), fields(run = %ctx.run))]
pub async fn run_silver_table(ctx: &PipelineContext, table: &str) -> Result<SilverOutcome> {
    let bucket = &ctx.config.store.bronze_bucket;
    let key = format!("{}{}", table, CSV_SUFFIX);
    let data = ctx
        .store
        .get_object(bucket, &key)
        .await
        .with_context(|| format!("reading bronze object {}/{}", bucket, key))?;

    let raw = RawTable::from_csv(&data).with_context(|| format!("parsing {}", key))?;
    let batch = raw.into_batch()?;
    let types = ctx.config.silver.types_for(table);
    let cleaned = silver::transform(&batch, &types)
        .with_context(|| format!("silver transform of `{}`", table))?;
    if cleaned.report.has_failures() {
        warn!(table, casts = %cleaned.report, "some columns kept their loaded type");
    }

    let write = ctx
        .silver_writer()
        .write_table(&cleaned.table, table, &ctx.run, Validation::HasId)
        .await?;
    Ok(SilverOutcome {
        table: table.to_string(),
        rows: cleaned.table.num_rows(),
        write,
        casts: cleaned.report,
    })
}

#[derive(Debug, Clone)]
pub struct GoldOutcome {
    pub tables: Vec<(String, WriteOutcome)>,
    pub metadata_key: String,
    pub metadata: RunMetadata,
}

/// The `kpi_global` promoted by the newest run strictly before `before`.
///
/// Resolved from history rather than `current`, so every attempt of a gold
/// stage sees the same snapshot even after an earlier attempt promoted its
/// own. Copies that fail the single-row gate were never promoted and copies
/// that cannot be decoded are skipped. Store failures propagate.
pub async fn previous_kpis(writer: &VersionedWriter, before: &RunId) -> Result<Option<RecordBatch>> {
    let file = parquet_file(KPI_GLOBAL);
    let runs = writer.history_runs().await?;
    for run in runs.iter().rev().filter(|run| *run < before) {
        let data = match writer.read_history(run, &file).await {
            Ok(data) => data,
            Err(e) if error::is_not_found(&e) => continue,
            Err(e) => return Err(e),
        };
        match read_parquet_from_memory(data) {
            Ok(batch) if Validation::SingleRow.check(&batch) => {
                debug!(%run, "previous kpi_global");
                return Ok(Some(batch));
            }
            Ok(batch) => {
                debug!(%run, rows = batch.num_rows(), "kpi_global was not promoted, skipping");
            }
            Err(e) => {
                warn!(%run, error = %e, "kpi_global unreadable, skipping");
            }
        }
    }
    Ok(None)
}

async fn silver_input(writer: &VersionedWriter, table: &str) -> Result<RecordBatch> {
    match writer.read_current(table).await? {
        Some(batch) => Ok(batch),
        None => bail!(
            "silver table `{}` has never been promoted in `{}`",
            table,
            writer.bucket()
        ),
    }
}

/// Promoted silver tables → gold model → versioned gold writes + `metadata.json`.
#[instrument(level = "info", skip(ctx), fields(run = %ctx.run))]
pub async fn run_gold(ctx: &PipelineContext) -> Result<GoldOutcome> {
    let settings = &ctx.config.gold;
    let silver = ctx.silver_writer();
    let clients = silver_input(&silver, &settings.client_table).await?;
    let transactions = silver_input(&silver, &settings.transactions_table).await?;

    let writer = ctx.gold_writer();
    let previous = previous_kpis(&writer, &ctx.run).await?;
    let snapshot = gold::build_snapshot(&clients, &transactions, previous.as_ref(), settings)?;

    let mut tables = Vec::new();
    for (name, batch, validation) in snapshot.tables()? {
        let outcome = writer
            .write_table(&batch, name, &ctx.run, validation)
            .await?;
        tables.push((name.to_string(), outcome));
    }

    let metadata = snapshot.metadata(ctx.run);
    let metadata_key = writer
        .write_document(&ctx.run, METADATA_FILE, metadata.to_json_bytes()?)
        .await?;
    info!(
        key = %metadata_key,
        concentration = metadata.ca_concentration_top_20_pct,
        "run metadata written"
    );

    Ok(GoldOutcome {
        tables,
        metadata_key,
        metadata,
    })
}

/// Which stages a pipeline run includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Full,
    SilverOnly,
    GoldOnly,
}

/// Refuse a run id that already has history in a bucket `plan` writes to.
///
/// History is write-once, so reusing a `run_ts` would either keep stale
/// copies silently or fail halfway through gold.
pub async fn ensure_new_run(ctx: &PipelineContext, plan: Plan) -> Result<()> {
    let mut writers = Vec::new();
    if plan != Plan::GoldOnly {
        writers.push(ctx.silver_writer());
    }
    if plan != Plan::SilverOnly {
        writers.push(ctx.gold_writer());
    }
    for writer in writers {
        if writer.has_run(&ctx.run).await? {
            bail!(
                "run {} already has history in `{}`; choose another --run-ts",
                ctx.run,
                writer.bucket()
            );
        }
    }
    Ok(())
}

fn silver_task(ctx: Arc<PipelineContext>, table: String) -> TaskFn {
    Box::new(move || {
        let ctx = ctx.clone();
        let table = table.clone();
        async move { run_silver_table(&ctx, &table).await.map(|_| ()) }.boxed()
    })
}

fn gold_task(ctx: Arc<PipelineContext>) -> TaskFn {
    Box::new(move || {
        let ctx = ctx.clone();
        async move { run_gold(&ctx).await.map(|_| ()) }.boxed()
    })
}

/// One silver stage per table and a gold stage depending on the silver
/// stages of its two inputs.
pub fn build_pipeline(ctx: Arc<PipelineContext>, tables: &[String], plan: Plan) -> Result<Scheduler> {
    let policy = ctx.config.retry;
    let mut scheduler = Scheduler::new();

    if plan != Plan::GoldOnly {
        for table in tables {
            scheduler.add_stage(
                &silver_stage_name(table),
                policy,
                silver_task(ctx.clone(), table.clone()),
            )?;
        }
    }

    if plan != Plan::SilverOnly {
        scheduler.add_stage(GOLD_STAGE, policy, gold_task(ctx.clone()))?;
        let gold = &ctx.config.gold;
        for input in [&gold.client_table, &gold.transactions_table] {
            let upstream = silver_stage_name(input);
            if scheduler.graph().contains(&upstream) {
                scheduler.add_dependency(GOLD_STAGE, &upstream)?;
            }
        }
    }
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::scheduler::RunReport;
    use crate::gold::{KpiComparison, DIM_CLIENT};
    use crate::history::{current_key, history_key};
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    fn init_test_logging() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("info,medallion=debug")),
            )
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    const CLIENTS_CSV: &str = "ID_Client,Nom,Email,Age,Pays,Date_Inscription
1,Alice Martin,alice@example.com,34,France,2023-02-11
2,Bob Stone,bob@example.com,-3,UK,2022-09-30
2,Bob Stone,bob@example.com,41,UK,2022-09-30
3,Chloé Petit,,29,,2024-01-05
";

    const ACHATS_CSV: &str = "ID_Achat,ID_Client,Montant,Date_Achat,Produit
100,1,120.0,2024-01-15 10:00:00,Laptop
101,2,80.5,2024-01-15 12:30:00,Phone
102,1,-10,2024-02-02 09:00:00,Cable
103,3,40.0,2024-02-10 16:45:00,
104,7,60.0,not a date,Mouse
";

    fn run_at(sec: u32) -> RunId {
        RunId::from_datetime(Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, sec).unwrap())
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry.backoff = Duration::from_millis(1);
        config
    }

    async fn seeded_store(clients: &str, achats: &str) -> Result<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket("bronze").await?;
        for (key, body) in [("clients.csv", clients), ("achats.csv", achats)] {
            store
                .put_object("bronze", key, Bytes::from(body.to_string()), "text/csv")
                .await?;
        }
        Ok(store)
    }

    async fn run_full(store: Arc<MemoryStore>, run: RunId) -> Result<RunReport> {
        let ctx = Arc::new(PipelineContext::new(store, fast_config(), run));
        let tables = bronze_tables(&ctx).await?;
        build_pipeline(ctx, &tables, Plan::Full)?.run().await
    }

    async fn metadata(store: &MemoryStore, run: RunId) -> Result<RunMetadata> {
        let bytes = store
            .get_object("gold", &history_key(&run, METADATA_FILE))
            .await?;
        RunMetadata::from_json_bytes(&bytes)
    }

    #[tokio::test]
    async fn bronze_to_gold_end_to_end() -> Result<()> {
        init_test_logging();
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;

        let report = run_full(store.clone(), run_at(1)).await?;
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.succeeded.len(), 3);
        assert_eq!(report.succeeded.last().unwrap().name, GOLD_STAGE);

        for table in ["clients", "achats"] {
            assert!(store.get_object("silver", &current_key(table)).await.is_ok());
        }
        for table in [DIM_CLIENT, "fact_achat", "agg_ca_pays", KPI_GLOBAL] {
            assert!(store.get_object("gold", &current_key(table)).await.is_ok(), "{}", table);
        }

        let first = metadata(&store, run_at(1)).await?;
        assert!(!first.kpi_comparison.has_previous);
        assert_eq!(first.quality.row_count, 5);
        // -10 was nulled in silver and imputed with the median of the rest
        assert_eq!(first.kpis.total_transactions, 5);
        assert_eq!(first.kpis.median_panier, Some(70.25));

        let second_report = run_full(store.clone(), run_at(2)).await?;
        assert!(second_report.is_success());
        let second = metadata(&store, run_at(2)).await?;
        let KpiComparison {
            has_previous,
            delta,
            ..
        } = second.kpi_comparison;
        assert!(has_previous);
        assert_eq!(delta["total_ca"], Some(0.0));
        Ok(())
    }

    #[tokio::test]
    async fn schema_error_aborts_before_gold() -> Result<()> {
        init_test_logging();
        let store = seeded_store("name,age\nAna,3\n", ACHATS_CSV).await?;
        let report = run_full(store.clone(), run_at(1)).await?;

        let failed = report.failed.as_ref().unwrap();
        assert_eq!(failed.name, silver_stage_name("clients"));
        assert_eq!(failed.attempts, 1);
        assert!(report.skipped.contains(&GOLD_STAGE.to_string()));
        assert!(store.list_objects("gold", "").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn transient_store_failure_is_retried() -> Result<()> {
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;
        let ctx = Arc::new(PipelineContext::new(store.clone(), fast_config(), run_at(1)));
        store.fail_next(1);

        let mut scheduler = Scheduler::new();
        let task = silver_task(ctx.clone(), "clients".into());
        scheduler.add_stage(&silver_stage_name("clients"), ctx.config.retry, task)?;
        let report = scheduler.run().await?;
        assert!(report.is_success());
        assert_eq!(report.succeeded[0].attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn identifier_without_values_is_degraded() -> Result<()> {
        let store = seeded_store("id,name\n,Ana\n,Bo\n", ACHATS_CSV).await?;
        let ctx = PipelineContext::new(store.clone(), fast_config(), run_at(4));
        let outcome = run_silver_table(&ctx, "clients").await?;
        assert!(!outcome.write.is_promoted());
        assert_eq!(
            outcome.write.effective_path(),
            "history/run_ts=2024-03-01T06-00-04/clients.parquet"
        );
        assert!(ctx.silver_writer().read_current("clients").await?.is_none());

        // gold cannot start without a promoted clients table
        let err = run_gold(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("never been promoted"));
        Ok(())
    }

    #[tokio::test]
    async fn discovery_picks_up_unconfigured_csv() -> Result<()> {
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;
        store
            .put_object(
                "bronze",
                "produits.csv",
                Bytes::from_static(b"id,label\n1,x\n"),
                "text/csv",
            )
            .await?;
        store
            .put_object(
                "bronze",
                "archive/old.csv",
                Bytes::from_static(b"id\n1\n"),
                "text/csv",
            )
            .await?;
        let mut config = fast_config();
        let ctx = PipelineContext::new(store.clone(), config.clone(), run_at(1));
        assert_eq!(bronze_tables(&ctx).await?, vec!["achats", "clients", "produits"]);

        config.silver.discover = false;
        let ctx = PipelineContext::new(store, config, run_at(1));
        assert_eq!(bronze_tables(&ctx).await?, vec!["achats", "clients"]);
        Ok(())
    }

    #[tokio::test]
    async fn gold_only_plan_has_no_dependencies() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(PipelineContext::new(store, fast_config(), run_at(1)));
        let scheduler = build_pipeline(ctx, &["clients".to_string()], Plan::GoldOnly)?;
        assert_eq!(scheduler.graph().len(), 1);
        assert!(scheduler.graph().dependencies(GOLD_STAGE).is_empty());
        Ok(())
    }

    fn gold_attempts(report: &RunReport) -> u32 {
        report
            .succeeded
            .iter()
            .find(|s| s.name == GOLD_STAGE)
            .map(|s| s.attempts)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn gold_retry_on_first_run_has_no_previous() -> Result<()> {
        init_test_logging();
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;
        store.fail_put_once("gold", &history_key(&run_at(1), METADATA_FILE));

        let report = run_full(store.clone(), run_at(1)).await?;
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(gold_attempts(&report), 2);

        let meta = metadata(&store, run_at(1)).await?;
        assert!(!meta.kpi_comparison.has_previous);
        assert!(meta.kpi_comparison.delta.values().all(Option::is_none));
        Ok(())
    }

    #[tokio::test]
    async fn gold_retry_compares_against_the_earlier_run() -> Result<()> {
        init_test_logging();
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;
        assert!(run_full(store.clone(), run_at(1)).await?.is_success());

        // the Laptop purchase grows by 100 in the second export
        let bumped = ACHATS_CSV.replace("100,1,120.0", "100,1,220.0");
        store
            .put_object("bronze", "achats.csv", Bytes::from(bumped), "text/csv")
            .await?;
        store.fail_put_once("gold", &history_key(&run_at(2), "kpi_comparison.parquet"));

        let report = run_full(store.clone(), run_at(2)).await?;
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(gold_attempts(&report), 2);

        let meta = metadata(&store, run_at(2)).await?;
        assert!(meta.kpi_comparison.has_previous);
        assert_eq!(meta.kpi_comparison.delta["total_ca"], Some(100.0));
        Ok(())
    }

    #[tokio::test]
    async fn previous_kpis_only_sees_earlier_runs() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let writer = VersionedWriter::new(store, "gold");
        for (sec, amount) in [(1, 10.0), (3, 30.0)] {
            let fact = RecordBatch::try_from_iter(vec![(
                "amount",
                Arc::new(arrow::array::Float64Array::from(vec![amount]))
                    as arrow::array::ArrayRef,
            )])?;
            let kpis = gold::KpiSnapshot::compute(&fact, "amount").to_batch()?;
            writer
                .write_table(&kpis, KPI_GLOBAL, &run_at(sec), Validation::SingleRow)
                .await?;
        }

        assert!(previous_kpis(&writer, &run_at(1)).await?.is_none());
        let total = |batch: &RecordBatch| gold::kpi::metrics_from_batch(batch)["total_ca"];
        let before_three = previous_kpis(&writer, &run_at(3)).await?.unwrap();
        assert_eq!(total(&before_three), Some(10.0));
        let before_five = previous_kpis(&writer, &run_at(5)).await?.unwrap();
        assert_eq!(total(&before_five), Some(30.0));
        Ok(())
    }

    #[tokio::test]
    async fn reused_run_ts_is_rejected() -> Result<()> {
        let store = seeded_store(CLIENTS_CSV, ACHATS_CSV).await?;
        assert!(run_full(store.clone(), run_at(1)).await?.is_success());

        let ctx = PipelineContext::new(store.clone(), fast_config(), run_at(1));
        let err = ensure_new_run(&ctx, Plan::Full).await.unwrap_err();
        assert!(err.to_string().contains("already has history"));
        assert!(ensure_new_run(&ctx, Plan::GoldOnly).await.is_err());

        let fresh = PipelineContext::new(store, fast_config(), run_at(2));
        ensure_new_run(&fresh, Plan::Full).await?;
        Ok(())
    }
}
