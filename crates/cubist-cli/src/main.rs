//! Cubist CLI - cellset reads and writes from the shell
//!
//! Usage:
//!   cubist read --mdx "SELECT ..."               Read an MDX query
//!   cubist read --cube Sales --view Default       Read a saved view
//!   cubist read --mdx-file q.mdx --workers 8      Partitioned parallel read
//!   cubist write --cube Sales --input cells.json  Write cells
//!   cubist write ... --strategy bulk              Write through a file upload
//!
//! Connection settings come from cubist.toml (see `config`), with
//! CUBIST_URL overriding the server url.

mod config;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

use cubist_cellset::{
    csv, CellMap, CellValue, CellsetEngine, CellsetError, DimensionRef, NamingMode, QuerySource,
    WriteOptions, WriteStrategyKind,
};
use cubist_http::{HttpClient, HttpError, Transport};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "cubist")]
#[command(about = "Cellset reads and writes against a cube server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./cubist.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every cell of an MDX query or a view
    Read(ReadArgs),
    /// Write cells from a JSON file
    Write(WriteArgs),
}

#[derive(Args)]
struct ReadArgs {
    /// MDX query text
    #[arg(long, conflicts_with_all = ["mdx_file", "cube"])]
    mdx: Option<String>,

    /// File holding the MDX query
    #[arg(long, conflicts_with = "cube")]
    mdx_file: Option<PathBuf>,

    /// Cube of the view to read
    #[arg(long, requires = "view")]
    cube: Option<String>,

    /// View to read
    #[arg(long, requires = "cube")]
    view: Option<String>,

    /// The view is private to the session user
    #[arg(long)]
    private: bool,

    /// Concurrent partition reads (default: engine.max_workers)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Drop zero and empty cells
    #[arg(long)]
    skip_zeros: bool,

    /// Bare element names instead of unique names
    #[arg(long)]
    element_names: bool,

    /// Keep going when a partition fails
    #[arg(long)]
    best_effort: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Args)]
struct WriteArgs {
    /// Target cube
    #[arg(long)]
    cube: String,

    /// JSON file of [{"coordinates": [...], "value": ...}]
    #[arg(short, long)]
    input: PathBuf,

    /// How cells reach the server [default: procedure]
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Add to the current values
    #[arg(long)]
    increment: bool,

    /// Spread values written to consolidated cells
    #[arg(long)]
    allow_spread: bool,

    /// Skip cells the server marks as not updateable
    #[arg(long)]
    skip_non_updateable: bool,

    /// Dimension order of the input coordinates (comma separated)
    #[arg(long, value_delimiter = ',')]
    dimensions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Cellset,
    Procedure,
    Bulk,
}

/// The engine's default strategy unless one was named.
fn strategy_kind(arg: Option<StrategyArg>) -> WriteStrategyKind {
    arg.map(WriteStrategyKind::from).unwrap_or_default()
}

impl From<StrategyArg> for WriteStrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Cellset => WriteStrategyKind::DirectCellset,
            StrategyArg::Procedure => WriteStrategyKind::UnboundProcedure,
            StrategyArg::Bulk => WriteStrategyKind::BulkTransfer,
        }
    }
}

/// One cell of the write input and the read output.
#[derive(Debug, Serialize, Deserialize)]
struct CellRecord {
    coordinates: Vec<String>,
    value: CellValue,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", describe(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level)?;

    let config = CliConfig::load(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    rt.block_on(async {
        let engine = connect(&config).await?;
        match cli.command {
            Commands::Read(args) => run_read(&engine, args).await,
            Commands::Write(args) => run_write(&engine, args).await,
        }
    })
}

/// The error chain on one line, with transport details redacted.
fn describe(err: &anyhow::Error) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        if let Some(CellsetError::TransportFailure { context, source }) =
            cause.downcast_ref::<CellsetError>()
        {
            parts.push(format!(
                "transport failure while {} [{}]: {}",
                context,
                source.category(),
                source.sanitized_message()
            ));
            break;
        }
        if let Some(http) = cause.downcast_ref::<HttpError>() {
            parts.push(format!("[{}] {}", http.category(), http.sanitized_message()));
            break;
        }
        parts.push(cause.to_string());
    }
    parts.join(": ")
}

async fn connect(config: &CliConfig) -> Result<CellsetEngine> {
    let client = HttpClient::new(config.http_config()?).context("Failed to build HTTP client")?;
    let transport: Arc<dyn Transport> = Arc::new(client);
    let engine = match config.session() {
        Some(session) => CellsetEngine::new(transport, session, config.engine.clone()),
        None => CellsetEngine::connect(transport, config.engine.clone())
            .await
            .context("Failed to reach server")?,
    };
    info!(version = ?engine.session().server_version, "connected");
    Ok(engine)
}

fn query_source(args: &ReadArgs) -> Result<QuerySource> {
    if let Some(mdx) = &args.mdx {
        return Ok(QuerySource::mdx(mdx.clone()));
    }
    if let Some(path) = &args.mdx_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        return Ok(QuerySource::mdx(text));
    }
    match (&args.cube, &args.view) {
        (Some(cube), Some(view)) if args.private => Ok(QuerySource::private_view(cube, view)),
        (Some(cube), Some(view)) => Ok(QuerySource::view(cube, view)),
        _ => anyhow::bail!("Give --mdx, --mdx-file or --cube with --view"),
    }
}

async fn run_read(engine: &CellsetEngine, args: ReadArgs) -> Result<()> {
    let source = query_source(&args)?;
    let mut options = engine.read_options().skip_zeros(args.skip_zeros);
    if let Some(workers) = args.workers {
        options = options.workers(workers);
    }
    if args.best_effort {
        options = options.best_effort(true);
    }
    if args.element_names {
        options = options.naming(NamingMode::ElementNames);
    }

    let data = engine.read(&source, &options).await.context("Read failed")?;
    for lost in data.lost_partitions() {
        warn!(partition = lost.index, "partition lost");
        eprintln!("Partition {} lost; output is incomplete", lost.index);
    }

    let map = data.to_map()?;
    print!("{}", render(&map, args.format)?);
    Ok(())
}

fn render(map: &CellMap, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Csv => Ok(csv::encode(map.iter())),
        OutputFormat::Json => {
            let records: Vec<CellRecord> = map
                .iter()
                .map(|(coordinate, value)| CellRecord {
                    coordinates: coordinate.elements().to_vec(),
                    value: value.clone(),
                })
                .collect();
            let mut out = serde_json::to_string_pretty(&records)?;
            out.push('\n');
            Ok(out)
        }
    }
}

fn load_cells(path: &Path, dimensions: &[String]) -> Result<CellMap> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_cells(&text, dimensions).with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_cells(text: &str, dimensions: &[String]) -> Result<CellMap> {
    let records: Vec<CellRecord> = serde_json::from_str(text)?;
    let mut cells = CellMap::new(dimensions.iter().map(DimensionRef::new).collect());
    for record in records {
        cells.insert(record.coordinates, record.value);
    }
    Ok(cells)
}

async fn run_write(engine: &CellsetEngine, args: WriteArgs) -> Result<()> {
    let cells = load_cells(&args.input, &args.dimensions)?;
    let options = WriteOptions::default()
        .increment(args.increment)
        .allow_spread(args.allow_spread)
        .skip_non_updateable(args.skip_non_updateable);

    let strategy = strategy_kind(args.strategy);

    match engine.write(&args.cube, &cells, strategy, &options).await {
        Ok(report) => {
            println!(
                "Wrote {} of {} cells to {} ({})",
                report.applied, report.attempted, args.cube, report.strategy
            );
            if report.skipped > 0 {
                println!("Skipped {} read-only cells", report.skipped);
            }
            Ok(())
        }
        Err(err) => {
            if let CellsetError::WritePartialFailure { applied, .. } = &err {
                eprintln!("{} cells applied before the failures below", applied);
            }
            for failed in err.failed_cells() {
                eprintln!("  {}", failed);
            }
            Err(err).context("Write failed")
        }
    }
}

/// Initialize logging based on log level
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();

    Ok(())
}
