//! CLI entry point for the parcel distress ranker.
//!
//! `rank` pulls the city's open-data feeds, fuses them per parcel, and
//! writes the diversified top-N report. `list-datasets` shows what a run
//! would fetch.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use parcel_distress::{
    config::PipelineConfig,
    datasets::DatasetKind,
    pipeline::{Pipeline, soda_sources},
    report::{ReportFormat, log_preview, write_report},
    score::CapPolicy,
    tract::{LookupTable, TractResolver},
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const APP_TOKEN_VAR: &str = "SODA_APP_TOKEN";
const VACANCY_TOKEN_VAR: &str = "VACANCY_API_TOKEN";
const CONFIG_VAR: &str = "DISTRESS_CONFIG";

#[derive(Parser)]
#[command(name = "parcel_distress")]
#[command(about = "Rank likely vacant or distressed residential parcels", long_about = None)]
struct Cli {
    /// JSON config file overriding the embedded defaults
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingest, normalize and score, then write the report
    Rank {
        /// Report file to write
        #[arg(short, long, default_value = "distress_report.txt")]
        output: String,

        /// Report format
        #[arg(short, long, value_enum, default_value_t = FormatArg::Text)]
        format: FormatArg,

        /// Number of parcels to select
        #[arg(short = 'n', long)]
        top: Option<usize>,

        /// Fixed per-neighborhood cap
        #[arg(long, conflicts_with_all = ["dynamic_cap", "no_diversify"])]
        cap: Option<usize>,

        /// Cap each neighborhood at ceil(N / neighborhoods seen so far)
        #[arg(long, default_value_t = false, conflicts_with = "no_diversify")]
        dynamic_cap: bool,

        /// Plain top-N without the neighborhood cap
        #[arg(long, default_value_t = false)]
        no_diversify: bool,

        /// CSV mapping parcels/addresses to census tracts (kind,key,tract)
        #[arg(short, long)]
        tract_table: Option<String>,

        /// Dataset id of the vacancy feed (needs VACANCY_API_TOKEN)
        #[arg(long)]
        vacancy_dataset: Option<String>,
    },
    /// List the datasets a run would fetch
    ListDatasets,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Csv,
    Json,
}

impl From<FormatArg> for ReportFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Text => ReportFormat::Text,
            FormatArg::Csv => ReportFormat::Csv,
            FormatArg::Json => ReportFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/parcel_distress.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("parcel_distress.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var(CONFIG_VAR).ok());
    let mut config = PipelineConfig::load_or_default(config_path.as_deref())?;

    match cli.command {
        Commands::Rank {
            output,
            format,
            top,
            cap,
            dynamic_cap,
            no_diversify,
            tract_table,
            vacancy_dataset,
        } => {
            if let Some(n) = top {
                config.top_n = n;
            }
            if let Some(k) = cap {
                config.cap = CapPolicy::Fixed {
                    per_neighborhood: Some(k),
                };
            }
            if dynamic_cap {
                config.cap = CapPolicy::Dynamic;
            }
            if no_diversify {
                config.cap = CapPolicy::Unlimited;
            }
            if let Some(id) = vacancy_dataset {
                config.datasets.vacancy = Some(id);
            }
            config.validate()?;

            rank(config, &output, format.into(), tract_table.as_deref()).await?;
        }
        Commands::ListDatasets => list_datasets(&config),
    }

    Ok(())
}

fn env_token(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Runs the pipeline and writes the report only once everything succeeded.
#[tracing::instrument(skip(config, format), fields(top_n = config.top_n))]
async fn rank(
    config: PipelineConfig,
    output: &str,
    format: ReportFormat,
    tract_table: Option<&str>,
) -> Result<()> {
    let resolver: Arc<dyn TractResolver> = match tract_table {
        Some(path) => Arc::new(LookupTable::load(path)?),
        None => {
            info!("No tract table given, using tract fields from land-use rows");
            Arc::new(LookupTable::default())
        }
    };

    let app_token = env_token(APP_TOKEN_VAR);
    let vacancy_token = env_token(VACANCY_TOKEN_VAR);
    if config.datasets.vacancy.is_some() && vacancy_token.is_none() {
        info!(var = VACANCY_TOKEN_VAR, "Credential not set, vacancy feed disabled");
    }

    let (source, vacancy) = soda_sources(&config, app_token.as_deref(), vacancy_token.as_deref())?;
    let pipeline = Pipeline::new(config, source, resolver).with_vacancy_source(vacancy);

    let run = pipeline.run().await?;

    for (kind, status) in &run.feeds {
        info!(kind = %kind, status, "Feed status");
    }
    info!(
        scored = run.scored,
        selected = run.selected.len(),
        seeded = run.normalize.seeded,
        "Run summary"
    );

    write_report(output, &run.selected, format)?;
    log_preview(&run.selected, 10);
    Ok(())
}

fn list_datasets(config: &PipelineConfig) {
    let has_credential = env_token(VACANCY_TOKEN_VAR).is_some();

    for kind in DatasetKind::ALL {
        let id = config.datasets.id_for(kind);
        let enabled = id.is_some() && (!kind.requires_credential() || has_credential);
        info!(
            kind = %kind,
            dataset_id = id.unwrap_or("-"),
            role = if kind.is_mandatory() { "mandatory" } else { "optional" },
            auth = if kind.requires_credential() { "credential" } else { "open" },
            enabled,
            "Dataset"
        );
    }

    info!(
        base_url = %config.base_url,
        page_size = config.page_size,
        top_n = config.top_n,
        cap = ?config.cap,
        "Dataset list summary"
    );
}
