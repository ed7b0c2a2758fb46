//! Nodelink - road network loading tool

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use nodelink_common::logging::{init_logging, LogConfig, LogLevel};
use nodelink_etl::config::DbConfig;
use nodelink_etl::descriptor::{DatasetDescriptor, LoadMode};
use nodelink_etl::pipeline::{Pipeline, PipelineOptions};
use nodelink_etl::store::PgStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nodelink")]
#[command(author, version, about = "Road network loading tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Load one or more datasets into the spatial store
    Load {
        /// Dataset descriptor files (TOML), processed in order
        #[arg(short, long = "dataset", required = true)]
        descriptors: Vec<PathBuf>,

        /// Replace existing tables or append to them
        #[arg(short, long, value_enum, default_value_t = ModeArg::Overwrite)]
        mode: ModeArg,

        /// Write the run report as JSON to this path
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Validate descriptor files without touching the database
    Validate {
        /// Dataset descriptor files (TOML)
        #[arg(short, long = "dataset", required = true)]
        descriptors: Vec<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Overwrite,
    Append,
}

impl From<ModeArg> for LoadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Overwrite => LoadMode::Overwrite,
            ModeArg::Append => LoadMode::Append,
        }
    }
}

fn load_descriptors(paths: &[PathBuf]) -> Result<Vec<DatasetDescriptor>> {
    paths
        .iter()
        .map(|path| {
            DatasetDescriptor::from_toml_path(path)
                .with_context(|| format!("Invalid descriptor {}", path.display()))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    init_logging(&LogConfig::from_env().with_level(log_level))?;

    match cli.command {
        Command::Validate { descriptors } => {
            let loaded = load_descriptors(&descriptors)?;
            for descriptor in &loaded {
                info!(dataset = %descriptor.name, table = %descriptor.table, "Descriptor valid");
            }
            Ok(())
        }
        Command::Load {
            descriptors,
            mode,
            report,
            progress,
        } => {
            let loaded = load_descriptors(&descriptors)?;

            let config = DbConfig::load()?;
            let store = Arc::new(PgStore::connect(&config).await?);
            let pipeline = Pipeline::new(store);

            // First Ctrl-C stops the run at the next batch boundary
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received, stopping at the next batch boundary");
                        cancel.cancel();
                    }
                });
            }

            let options = PipelineOptions::new(mode.into())
                .with_cancel(cancel)
                .with_progress(progress);
            let run = pipeline.run(&loaded, &options).await;

            print!("{}", run.summary());
            if let Some(path) = report {
                run.write_json(&path)?;
                info!(path = %path.display(), "Run report written");
            }

            if let Some(failed) = run
                .datasets
                .iter()
                .find(|d| d.state != nodelink_etl::report::RunState::Succeeded)
            {
                match failed.failed_stage {
                    Some(stage) => {
                        bail!("dataset '{}' failed during {}", failed.dataset, stage)
                    }
                    None => bail!("dataset '{}' ended {}", failed.dataset, failed.state),
                }
            }
            Ok(())
        }
    }
}
