use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use medallion::{
    config::PipelineConfig,
    flow::{build_pipeline, stages, PipelineContext, Plan},
    gold::RunMetadata,
    history::{RunId, METADATA_FILE},
    store::{FsStore, ObjectStore},
};
use std::{path::PathBuf, sync::Arc};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "medallion", about = "Bronze → silver → gold KPI pipeline")]
struct Args {
    /// YAML config file; defaults are used when omitted
    #[arg(long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the bucket directories (overrides config and env)
    #[arg(long)]
    store_root: Option<PathBuf>,

    /// Run timestamp as YYYY-MM-DDTHH-MM-SS (UTC); defaults to now.
    /// Must not already have history in the buckets the command writes.
    #[arg(long)]
    run_ts: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Silver for every bronze table, then gold
    Run,
    /// Silver only
    Silver {
        /// Restrict to these tables (repeatable)
        #[arg(long)]
        table: Vec<String>,
    },
    /// Gold only, from the promoted silver tables
    Gold,
    /// List gold runs recorded in history
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,medallion=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let args = Args::parse();

    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if let Some(root) = args.store_root {
        config.store.root = root;
    }
    let run = match args.run_ts.as_deref() {
        Some(ts) => ts.parse::<RunId>()?,
        None => RunId::now(),
    };
    info!(root = %config.store.root.display(), %run, "startup");

    let store: Arc<dyn ObjectStore> = Arc::new(FsStore::new(config.store.root.clone()));
    let ctx = Arc::new(PipelineContext::new(store, config, run));

    let plan = match &args.command {
        Command::Run => Plan::Full,
        Command::Silver { .. } => Plan::SilverOnly,
        Command::Gold => Plan::GoldOnly,
        Command::History => return list_history(&ctx).await,
    };

    let mut tables = stages::bronze_tables(&ctx).await?;
    if let Command::Silver { table } = &args.command {
        if !table.is_empty() {
            tables.retain(|t| table.contains(t));
            if tables.is_empty() {
                bail!("none of {:?} is a known bronze table", table);
            }
        }
    }
    stages::ensure_new_run(&ctx, plan).await?;
    info!(?tables, ?plan, "building pipeline");

    let scheduler = build_pipeline(ctx.clone(), &tables, plan)?;
    if scheduler.graph().is_empty() {
        bail!("nothing to run: no bronze tables in `{}`", ctx.config.store.bronze_bucket);
    }
    let start = Instant::now();
    let report = scheduler.run().await?;
    if report.is_success() {
        info!(elapsed = ?start.elapsed(), "{}", report);
    } else {
        error!(elapsed = ?start.elapsed(), "{}", report);
    }
    report.into_result()
}

async fn list_history(ctx: &PipelineContext) -> Result<()> {
    let writer = ctx.gold_writer();
    let runs = writer.history_runs().await?;
    if runs.is_empty() {
        println!("no gold runs in `{}`", writer.bucket());
        return Ok(());
    }
    println!("{:<20} {:>14} {:>8} {:>10}", "run_ts", "total_ca", "tx", "top20%");
    for run in runs {
        let meta = match writer.read_history(&run, METADATA_FILE).await {
            Ok(bytes) => RunMetadata::from_json_bytes(&bytes),
            Err(e) => Err(e),
        };
        match meta {
            Ok(m) => println!(
                "{:<20} {:>14.2} {:>8} {:>10.3}",
                run.to_string(),
                m.kpis.total_ca,
                m.kpis.total_transactions,
                m.ca_concentration_top_20_pct
            ),
            Err(e) => {
                warn!(%run, error = %e, "no readable metadata");
                println!("{:<20} {:>14}", run.to_string(), "-");
            }
        }
    }
    Ok(())
}
