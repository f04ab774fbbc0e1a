use anyhow::{bail, Context, Result};
use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use medallion::gold::RunMetadata;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::schema::types::Type;
use std::{collections::BTreeMap, fs::File, path::PathBuf};

/// Print what a pipeline run left on disk: a Parquet table or a run's
/// `metadata.json`.
#[derive(Parser, Debug)]
#[command(name = "inspect_artifact")]
struct Args {
    /// `.parquet` or `.json` file
    path: PathBuf,

    /// Rows to preview for Parquet tables
    #[arg(long, default_value_t = 10)]
    rows: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => inspect_parquet(&args),
        Some("json") => inspect_metadata(&args),
        _ => bail!("expected a .parquet or .json file, got {}", args.path.display()),
    }
}

fn inspect_parquet(args: &Args) -> Result<()> {
    let path = &args.path;
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)?;
    let meta = reader.metadata();
    let file_meta = meta.file_metadata();

    println!("=== Parquet File: {} ===", path.display());
    println!("Created by:           {}", file_meta.created_by().unwrap_or("<unknown>"));
    println!("Total rows:           {}", file_meta.num_rows());
    println!("Number of row groups: {}", meta.num_row_groups());
    println!("File size on disk:    {} bytes", std::fs::metadata(path)?.len());
    println!();

    println!("=== Schema ===");
    print_schema(file_meta.schema_descr().root_schema(), 0);
    println!();

    // Null counts summed over row groups, keyed by leaf column.
    let mut nulls: BTreeMap<String, Option<u64>> = BTreeMap::new();
    for rg in meta.row_groups() {
        for col in rg.columns() {
            let count = col.statistics().and_then(|s| s.null_count_opt());
            let entry = nulls.entry(col.column_descr().name().to_string()).or_insert(Some(0));
            *entry = match (*entry, count) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            };
        }
    }
    println!("=== Nulls ===");
    for (name, count) in &nulls {
        match count {
            Some(n) => println!("- {:<30} {}", name, n),
            None => println!("- {:<30} <no stats>", name),
        }
    }
    println!();

    let file = File::open(path)?;
    let batches = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(args.rows.max(1))
        .with_limit(args.rows)
        .build()?
        .collect::<Result<Vec<_>, _>>()?;
    println!("=== First {} rows ===", args.rows);
    println!("{}", pretty_format_batches(&batches)?);
    Ok(())
}

fn print_schema(node: &Type, level: usize) {
    let indent = "  ".repeat(level);
    match node {
        Type::PrimitiveType {
            basic_info,
            physical_type,
            ..
        } => {
            let logical = basic_info
                .logical_type()
                .as_ref()
                .map_or(String::new(), |lt| format!(", {:?}", lt));
            println!("{}- {}: {:?}{}", indent, basic_info.name(), physical_type, logical);
        }
        Type::GroupType {
            basic_info, fields, ..
        } => {
            println!("{}+ {} (group)", indent, basic_info.name());
            for field in fields {
                print_schema(field.as_ref(), level + 1);
            }
        }
    }
}

fn inspect_metadata(args: &Args) -> Result<()> {
    let data = std::fs::read(&args.path).with_context(|| format!("reading {}", args.path.display()))?;
    let meta = RunMetadata::from_json_bytes(&data)?;

    println!("=== Run {} ===", meta.run_ts);
    println!("Rows:                 {}", meta.quality.row_count);
    println!("Null amount pct:      {:.3}", meta.quality.null_amount_pct);
    println!("Negative amount pct:  {:.3}", meta.quality.negative_amount_pct);
    println!("Top 20% CA share:     {:.3}", meta.ca_concentration_top_20_pct);
    println!();
    println!("=== KPIs ===");
    println!("{}", serde_json::to_string_pretty(&meta.kpis)?);
    println!();
    println!("=== Comparison ===");
    if meta.kpi_comparison.has_previous {
        println!("{}", serde_json::to_string_pretty(&meta.kpi_comparison)?);
    } else {
        println!("no previous run");
    }
    Ok(())
}
