use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use datalumos::config::LumosConfig;
use datalumos::connectors::{PipelineIdentityResolver, RawSourceConfig, SourceConfigNormalizer, SourceKind};
use datalumos::db::{connect_destination, TableRef};
use datalumos::ingestion::{ExtractionLoadOrchestrator, LoadStatus};
use datalumos::validation::{validate_table, RuleSpecification};
use datalumos::SchemaCatalog;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datalumos")]
#[command(about = "Load data sources into a warehouse and validate them against data-quality rules")]
struct Args {
    /// JSON configuration file (env vars DATALUMOS_* override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Schema catalog persisted between runs
    #[arg(long, global = true, default_value = "datalumos_catalog.json")]
    catalog: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a source and load it into the destination
    Load {
        /// filesystem, object_store or relational
        #[arg(short, long)]
        kind: String,

        /// JSON source configuration; flags below override its fields
        #[arg(short, long)]
        source: Option<PathBuf>,

        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        bucket_url: Option<String>,
        #[arg(long)]
        connection_string: Option<String>,
        #[arg(long)]
        file_glob: Option<String>,
        #[arg(long)]
        file_format: Option<String>,
        /// Comma-separated table list for relational sources
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
        #[arg(long)]
        table_name: Option<String>,
        #[arg(long)]
        dataset_name: Option<String>,
    },
    /// Run rule specifications against a loaded table
    Validate {
        /// Loaded table as `dataset.table`
        #[arg(short, long)]
        table: String,

        /// JSON array of rule specifications
        #[arg(short, long)]
        rules: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Markdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = LumosConfig::load(args.config.as_deref())?;
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match args.command {
        Command::Load {
            kind,
            source,
            path,
            bucket_url,
            connection_string,
            file_glob,
            file_format,
            tables,
            table_name,
            dataset_name,
        } => {
            let mut raw = match source {
                Some(file) => read_json::<RawSourceConfig>(&file)?,
                None => RawSourceConfig::default(),
            };
            raw.path = path.or(raw.path);
            raw.bucket_url = bucket_url.or(raw.bucket_url);
            raw.connection_string = connection_string.or(raw.connection_string);
            raw.file_glob = file_glob.or(raw.file_glob);
            raw.file_format = file_format.or(raw.file_format);
            raw.tables = tables.or(raw.tables);
            raw.table_name = table_name.or(raw.table_name);
            raw.dataset_name = dataset_name.or(raw.dataset_name);

            let kind: SourceKind = kind.parse()?;
            let request = SourceConfigNormalizer::normalize(&raw, kind)?;
            let identity = PipelineIdentityResolver::resolve(&request);
            info!(pipeline = %identity.pipeline_name, dataset = %identity.dataset_name, "Starting load");

            let destination = connect_destination(&config.destination).await?;
            let mut catalog = SchemaCatalog::load(&args.catalog)?;
            let orchestrator = ExtractionLoadOrchestrator::new(destination, config.retry.clone(), config.ingestion.clone());
            let result = orchestrator
                .run_with_cancel(&mut catalog, &identity, &request, cancel)
                .await;
            catalog
                .save(&args.catalog)
                .with_context(|| format!("saving catalog to {}", args.catalog.display()))?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.status == LoadStatus::Failed {
                error!(error = ?result.error, "Load failed");
                bail!("load of {} failed", identity.pipeline_name);
            }
        }
        Command::Validate { table, rules, format } => {
            let table = TableRef::parse(&table)
                .with_context(|| format!("table must be written as dataset.table, got {}", table))?;
            let specs: Vec<RuleSpecification> = read_json(&rules)?;
            let catalog = SchemaCatalog::load(&args.catalog)?;
            if catalog.table(&table.to_string()).is_none() {
                bail!("{} is not in the catalog {}; load it first", table, args.catalog.display());
            }

            let destination = connect_destination(&config.destination).await?;
            let report = validate_table(destination, &catalog, &table, &specs, &config.validation, cancel).await;

            match format {
                OutputFormat::Json => println!("{}", report.to_json()?),
                OutputFormat::Markdown => println!("{}", report.to_markdown()),
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
