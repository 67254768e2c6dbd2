//! pkgwatch CLI
//!
//! Runs each stage of the package analysis pipeline as its own process.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pkgwatch_core::loader::AnalysisKind;
use pkgwatch_core::{Ecosystem, PipelineConfig};

#[derive(Parser)]
#[command(name = "pkgwatch")]
#[command(author = "Kief Studio")]
#[command(version)]
#[command(about = "Registry watcher and analysis pipeline for open-source packages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML); environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum EcosystemArg {
    Npm,
    Pypi,
    Rubygems,
    Crates,
}

impl From<EcosystemArg> for Ecosystem {
    fn from(e: EcosystemArg) -> Self {
        match e {
            EcosystemArg::Npm => Ecosystem::Npm,
            EcosystemArg::Pypi => Ecosystem::PyPI,
            EcosystemArg::Rubygems => Ecosystem::RubyGems,
            EcosystemArg::Crates => Ecosystem::CratesIo,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Dynamic,
    Static,
}

impl From<KindArg> for AnalysisKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Dynamic => AnalysisKind::Dynamic,
            KindArg::Static => AnalysisKind::Static,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a registry change feed and publish analysis jobs
    Poll {
        /// Registry to poll
        #[arg(value_enum)]
        ecosystem: EcosystemArg,

        /// Keep polling, sleeping this many seconds between cycles
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Consume analysis jobs until interrupted
    Worker,

    /// Load stored results into their table, replacing its contents
    Load {
        /// Which results to load
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// Show the state of a load job
    JobStatus {
        /// Job identifier printed by `load`
        job_id: String,
    },

    /// Rebuild the indicator index from stored results
    Index,

    /// Serve indicator searches over HTTP
    Serve,

    /// Run the static detectors on a local file
    Scan {
        /// File to scan
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show version and configuration
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "pkgwatch_cli=debug,pkgwatch_core=debug"
    } else if cli.quiet {
        "pkgwatch_cli=error,pkgwatch_core=error"
    } else {
        "pkgwatch_cli=info,pkgwatch_core=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .without_time()
        .init();

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(project) = &config.project {
        tracing::debug!("Project: {}", project);
    }

    match cli.command {
        Commands::Poll { ecosystem, interval } => {
            commands::poll::run(&config, ecosystem.into(), interval).await
        }
        Commands::Worker => commands::worker::run(&config).await,
        Commands::Load { kind } => commands::load::run(&config, kind.into()).await,
        Commands::JobStatus { job_id } => commands::job_status::run(&config, &job_id).await,
        Commands::Index => commands::index::run(&config).await,
        Commands::Serve => commands::serve::run(&config).await,
        Commands::Scan { path, format } => {
            let format = match format {
                OutputFormat::Text => output::OutputFormat::Text,
                OutputFormat::Json => output::OutputFormat::Json,
            };
            commands::scan::run(path, format)
        }
        Commands::Version => {
            commands::version::run(&config);
            Ok(())
        }
    }
}
