mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fls_common::Arch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fls-cli")]
#[command(about = "FLS grading CLI - inspect the queue and grade submissions locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List submissions waiting to be graded
    Submissions {
        /// Architecture queue to list (defaults to this host's)
        #[arg(short, long, value_parser = parse_arch)]
        arch: Option<Arch>,

        /// Print raw JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check whether a submission tarball would be accepted by the extractor
    CheckTarball {
        /// Path to a .tar or .tar.gz archive
        path: PathBuf,
    },

    /// Build and grade a submission tarball with the local Docker sandbox
    GradeLocal {
        /// Path to a .tar or .tar.gz archive
        path: PathBuf,

        /// Keep the job workspace instead of deleting it
        #[arg(short, long)]
        keep: bool,

        /// Copy the job log here when done
        #[arg(short, long)]
        log: Option<PathBuf>,
    },
}

fn parse_arch(raw: &str) -> Result<Arch, String> {
    Arch::parse(raw).ok_or_else(|| format!("unknown architecture '{}'", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submissions { arch, json } => {
            commands::list_submissions(arch, json).await?;
        }
        Commands::CheckTarball { path } => {
            commands::check_tarball(&path)?;
        }
        Commands::GradeLocal { path, keep, log } => {
            commands::grade_local(&path, keep, log.as_deref()).await?;
        }
    }

    Ok(())
}
