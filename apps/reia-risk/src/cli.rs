use crate::config::Config;
use crate::datastore::{CsvResultStore, ResultSource};
use crate::db;
use crate::engine::OqApiClient;
use crate::loader::{drop_calculation, prune_orphan_tags, BulkLoader};
use crate::model::{LossCategory, RiskType};
use crate::pipeline::{ingest_tracked_branch, BranchJob, CalculationRunner, RiskAssessmentRunner};
use crate::report::{write_csv, write_json, AggregationRepository, StatisticsQuery};
use crate::schema::ensure_schema;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlx::PgPool;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "reia-risk",
    version,
    about = "Earthquake risk value ingestion and aggregation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the risk tables.
    InitDb,
    CreateCalculation(CreateCalculationArgs),
    RegisterTags(RegisterTagsArgs),
    /// Load an exported engine result for one branch.
    Ingest(IngestArgs),
    /// Wait for engine jobs and load every branch that completes.
    Run(RunArgs),
    /// Run a loss and a damage calculation as one risk assessment.
    Assess(AssessArgs),
    Stats(StatsArgs),
    DropCalculation(DropCalculationArgs),
    /// Delete aggregation tags nothing refers to.
    PruneTags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    Loss,
    Damage,
}

impl From<Kind> for RiskType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Loss => RiskType::Loss,
            Kind::Damage => RiskType::Damage,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

#[derive(Args)]
pub struct CreateCalculationArgs {
    #[arg(long, value_enum)]
    pub kind: Kind,
    /// Aggregation types, e.g. `--aggregate-by Canton --aggregate-by CantonGemeinde`.
    #[arg(long)]
    pub aggregate_by: Vec<String>,
    /// `<weight>:<exposure model id>`, once per branch.
    #[arg(long = "branch", required = true, value_parser = parse_branch_spec)]
    pub branches: Vec<(f64, i64)>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args)]
pub struct RegisterTagsArgs {
    #[arg(long)]
    pub exposure_model_id: i64,
    /// CSV file with a `type,name` header.
    #[arg(long)]
    pub tags_file: PathBuf,
}

#[derive(Args)]
pub struct IngestArgs {
    #[arg(long)]
    pub calculation_id: i64,
    #[arg(long)]
    pub branch_id: i64,
    /// Directory holding the engine's exported result tables.
    #[arg(long)]
    pub export_dir: PathBuf,
}

#[derive(Args)]
pub struct RunArgs {
    #[arg(long)]
    pub calculation_id: i64,
    /// Engine job ids, one per branch in branch id order.
    #[arg(long = "job-id", required = true, num_args = 1..)]
    pub job_ids: Vec<i64>,
}

#[derive(Args)]
pub struct AssessArgs {
    #[arg(long)]
    pub loss_calculation_id: i64,
    #[arg(long = "loss-job-id", required = true, num_args = 1..)]
    pub loss_job_ids: Vec<i64>,
    #[arg(long)]
    pub damage_calculation_id: i64,
    #[arg(long = "damage-job-id", required = true, num_args = 1..)]
    pub damage_job_ids: Vec<i64>,
}

#[derive(Args)]
pub struct StatsArgs {
    #[arg(long)]
    pub calculation_id: i64,
    #[arg(long, value_enum)]
    pub kind: Kind,
    /// Loss category, e.g. `structural` or `business_interruption`.
    #[arg(long, default_value = "structural")]
    pub category: String,
    #[arg(long)]
    pub aggregation_type: String,
    #[arg(long)]
    pub filter_tag_like: Option<String>,
    #[arg(long, default_value_t = false)]
    pub sum: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
    /// Write into this directory instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct DropCalculationArgs {
    #[arg(long)]
    pub calculation_id: i64,
}

fn parse_branch_spec(raw: &str) -> std::result::Result<(f64, i64), String> {
    let (weight, model) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <weight>:<exposure model id>, got {raw:?}"))?;
    let weight: f64 = weight
        .trim()
        .parse()
        .map_err(|err| format!("bad branch weight {weight:?}: {err}"))?;
    let model: i64 = model
        .trim()
        .parse()
        .map_err(|err| format!("bad exposure model id {model:?}: {err}"))?;
    Ok((weight, model))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

pub async fn dispatch(command: Commands, config: &Config, pool: PgPool) -> Result<()> {
    match command {
        Commands::InitDb => {
            ensure_schema(&pool).await?;
            Ok(())
        }
        Commands::CreateCalculation(args) => create_calculation(args, &pool).await,
        Commands::RegisterTags(args) => register_tags(args, &pool).await,
        Commands::Ingest(args) => ingest(args, config, pool).await,
        Commands::Run(args) => run(args, config, pool).await,
        Commands::Assess(args) => assess(args, config, pool).await,
        Commands::Stats(args) => stats(args, pool).await,
        Commands::DropCalculation(args) => {
            let report = drop_calculation(&pool, args.calculation_id).await?;
            print_json(&report)
        }
        Commands::PruneTags => {
            let pruned = prune_orphan_tags(&pool).await?;
            print_json(&serde_json::json!({ "pruned_tags": pruned }))
        }
    }
}

#[derive(Serialize)]
struct CreatedCalculation {
    calculation_id: i64,
    branch_ids: Vec<i64>,
}

async fn create_calculation(args: CreateCalculationArgs, pool: &PgPool) -> Result<()> {
    let total: f64 = args.branches.iter().map(|(weight, _)| weight).sum();
    if (total - 1.0).abs() > 1e-6 {
        bail!("branch weights must sum to 1, got {total}");
    }
    let calculation = db::create_calculation(
        pool,
        args.kind.into(),
        &args.aggregate_by,
        args.description.as_deref(),
    )
    .await?;
    let mut branch_ids = Vec::with_capacity(args.branches.len());
    for (weight, exposure_model_id) in args.branches {
        let branch = db::create_branch(pool, &calculation, weight, exposure_model_id).await?;
        branch_ids.push(branch.id);
    }
    tracing::info!(calculation_id = calculation.id, branches = branch_ids.len(), "calculation created");
    print_json(&CreatedCalculation {
        calculation_id: calculation.id,
        branch_ids,
    })
}

#[derive(serde::Deserialize)]
struct TagRecord {
    #[serde(rename = "type")]
    tag_type: String,
    name: String,
}

async fn register_tags(args: RegisterTagsArgs, pool: &PgPool) -> Result<()> {
    let mut reader = csv::Reader::from_path(&args.tags_file)
        .with_context(|| format!("failed to open {}", args.tags_file.display()))?;
    let mut tags = Vec::new();
    for record in reader.deserialize::<TagRecord>() {
        let record = record?;
        tags.push((record.tag_type.trim().to_string(), record.name.trim().to_string()));
    }
    let stored = db::upsert_aggregation_tags(pool, args.exposure_model_id, &tags).await?;
    tracing::info!(exposure_model_id = args.exposure_model_id, tags = stored.len(), "tags registered");
    print_json(&stored)
}

async fn ingest(args: IngestArgs, config: &Config, pool: PgPool) -> Result<()> {
    let calculation = db::fetch_calculation(&pool, args.calculation_id)
        .await?
        .with_context(|| format!("calculation {} does not exist", args.calculation_id))?;
    let branch = db::fetch_branch(&pool, args.branch_id).await?;

    let store = CsvResultStore::new(&args.export_dir);
    let snapshot = tokio::task::spawn_blocking(move || store.read())
        .await
        .context("result reader panicked")??;

    let loader = BulkLoader::new(pool.clone(), config.load_options());
    let report =
        ingest_tracked_branch(&pool, &loader, &calculation, &branch, &snapshot, config.oq_version)
            .await?;
    print_json(&report)
}

/// Pairs the calculation's branches, in id order, with the given engine jobs.
async fn branch_jobs(pool: &PgPool, calculation_id: i64, job_ids: &[i64]) -> Result<Vec<BranchJob>> {
    let branches = db::fetch_branches(pool, calculation_id).await?;
    if branches.len() != job_ids.len() {
        bail!(
            "calculation {calculation_id} has {} branches but {} job ids were given",
            branches.len(),
            job_ids.len()
        );
    }
    Ok(branches
        .iter()
        .zip(job_ids)
        .map(|(branch, job_id)| BranchJob {
            branch_id: branch.id,
            job_id: *job_id,
        })
        .collect())
}

async fn calculation_runner(
    config: &Config,
    pool: PgPool,
) -> Result<CalculationRunner<OqApiClient>> {
    let server = config
        .oq_api_server
        .as_deref()
        .context("OQ_API_SERVER is required to poll the engine")?;
    let engine = OqApiClient::new(server, config.engine_credentials(), &config.export_root)?;
    engine.login().await?;
    let loader = BulkLoader::new(pool.clone(), config.load_options());
    Ok(CalculationRunner::new(
        pool,
        engine,
        loader,
        config.oq_version,
        config.status_poll_interval(),
    ))
}

async fn run(args: RunArgs, config: &Config, pool: PgPool) -> Result<()> {
    let jobs = branch_jobs(&pool, args.calculation_id, &args.job_ids).await?;
    let runner = calculation_runner(config, pool).await?;
    let summary = runner.run(args.calculation_id, &jobs).await?;
    print_json(&summary)
}

async fn assess(args: AssessArgs, config: &Config, pool: PgPool) -> Result<()> {
    let loss_jobs = branch_jobs(&pool, args.loss_calculation_id, &args.loss_job_ids).await?;
    let damage_jobs = branch_jobs(&pool, args.damage_calculation_id, &args.damage_job_ids).await?;
    let assessment_id = db::create_risk_assessment(
        &pool,
        Some(args.loss_calculation_id),
        Some(args.damage_calculation_id),
    )
    .await?;
    tracing::info!(assessment_id, "risk assessment created");

    let runner = RiskAssessmentRunner::new(calculation_runner(config, pool).await?);
    let summary = runner
        .run(
            assessment_id,
            (args.loss_calculation_id, &loss_jobs),
            (args.damage_calculation_id, &damage_jobs),
        )
        .await?;
    print_json(&summary)
}

async fn stats(args: StatsArgs, pool: PgPool) -> Result<()> {
    let category = LossCategory::from_loss_type(&args.category)
        .with_context(|| format!("unknown loss category {:?}", args.category))?;
    let query = StatisticsQuery {
        calculation_id: args.calculation_id,
        risk_type: args.kind.into(),
        category,
        aggregation_type: args.aggregation_type,
        filter_tag_like: args.filter_tag_like,
        sum: args.sum,
    };
    let rows = AggregationRepository::new(pool).statistics(&query).await?;

    let mut writer: Box<dyn Write> = match &args.output {
        Some(dir) => {
            let extension = match args.format {
                OutputFormat::Json => "json",
                OutputFormat::Csv => "csv",
            };
            let path = dir.join(format!("{}.{extension}", query.export_file_name()));
            let file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            tracing::info!(path = %path.display(), rows = rows.len(), "writing statistics");
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout().lock()),
    };
    match args.format {
        OutputFormat::Json => write_json(&rows, &mut writer)?,
        OutputFormat::Csv => write_csv(&rows, &mut writer)?,
    }
    writer.flush()?;
    Ok(())
}
