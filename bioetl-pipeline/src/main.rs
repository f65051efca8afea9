use std::path::PathBuf;
use std::process::ExitCode;

use bioetl_pipeline::config::load_config;
use bioetl_pipeline::error::{PipelineError, Stage};
use bioetl_pipeline::orchestrator::Pipeline;
use clap::{Parser, Subcommand};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::filter::{Directive, EnvFilter};

#[derive(Envconfig, Clone, Debug)]
struct Settings {
    /// `text` or `json`
    #[envconfig(from = "BIOETL_LOG_FORMAT", default = "text")]
    log_format: String,

    #[envconfig(from = "BIOETL_LOG_LEVEL", default = "info")]
    log_level: String,

    #[envconfig(from = "BIOETL_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Parser)]
#[command(name = "bioetl", version, about = "Reproducible extraction of bioactivity data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct ConfigArgs {
    /// Pipeline configuration document
    #[arg(long)]
    config: PathBuf,

    /// Override a configuration value, e.g. `--set sources.0.page_size=200`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, transform, validate and write one entity
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory for the output files, overriding the configuration
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Resolve the configuration and print the run plan without fetching or writing anything
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Keep at most this many records per source
        #[arg(long)]
        limit: Option<usize>,

        /// Keep a seeded random sample of this many rows
        #[arg(long)]
        sample: Option<usize>,
    },
    /// Check a configuration document and report every problem found
    ValidateConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn init_tracing(settings: &Settings) {
    let level = settings
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| Level::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(level)
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    if settings.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn execute(cli: Cli, settings: Settings) -> Result<(), PipelineError> {
    match cli.command {
        Commands::ValidateConfig { config } => {
            let loaded = load_config(&config.config, &config.overrides).map_err(PipelineError::config)?;
            println!(
                "{} is valid ({} sources, schema {}@{})",
                config.config.display(),
                loaded.sources.len(),
                loaded.schema.identifier,
                loaded.schema.declared_version
            );
            Ok(())
        }
        Commands::Run {
            config,
            output_dir,
            dry_run,
            limit,
            sample,
        } => {
            let mut loaded =
                load_config(&config.config, &config.overrides).map_err(PipelineError::config)?;
            if let Some(dir) = output_dir.or(settings.output_dir) {
                loaded.output.dir = dir;
            }
            loaded.run.limit = limit.or(loaded.run.limit);
            loaded.run.sample = sample.or(loaded.run.sample);

            let cancel = CancellationToken::new();
            let pipeline = Pipeline::new(loaded)?.with_cancellation(cancel.clone());

            if dry_run {
                let plan = pipeline.plan()?;
                let rendered =
                    serde_json::to_string_pretty(&plan).map_err(PipelineError::config)?;
                println!("{rendered}");
                return Ok(());
            }

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let run = pipeline.run().await?;
            info!(
                run_id = %run.run_id,
                rows = run.output.rows,
                csv = %run.output.csv.display(),
                sha256 = %run.output.csv_sha256,
                "run complete"
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::init_from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid environment: {e}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&settings);

    let cli = Cli::parse();
    match execute(cli, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // the message already carries the cause chain
            eprintln!("Error: {e}");
            match e.stage {
                Stage::Config => ExitCode::from(2),
                _ => ExitCode::from(1),
            }
        }
    }
}
