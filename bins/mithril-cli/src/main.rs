mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mithril-cli")]
#[command(about = "Mithril CLI - Check exercise trees and submit solutions for grading", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate every pool and exercise file in a directory tree
    Check {
        /// Exercises root directory
        #[arg(short, long, default_value = "exercises")]
        dir: PathBuf,
    },

    /// List pools and their exercises
    List {
        /// Exercises root directory
        #[arg(short, long, default_value = "exercises")]
        dir: PathBuf,
    },

    /// Submit a solution and wait for the grading outcome
    Submit {
        /// Client id used in the submission subject
        #[arg(short, long)]
        client: String,

        /// Exercise id
        #[arg(short, long)]
        exercise: String,

        /// Source file to submit (repeatable)
        #[arg(short, long)]
        file: Vec<PathBuf>,

        /// Plain answer for text/mcq exercises (repeatable)
        #[arg(short, long)]
        answer: Vec<String>,

        /// How long to wait for the outcome, in milliseconds
        #[arg(long, default_value = "10000")]
        timeout_ms: u64,

        /// NATS server URL (defaults to NATS_URL)
        #[arg(long)]
        nats_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { dir } => {
            commands::check_exercises(&dir)?;
        }
        Commands::List { dir } => {
            commands::list_exercises(&dir)?;
        }
        Commands::Submit {
            client,
            exercise,
            file,
            answer,
            timeout_ms,
            nats_url,
        } => {
            let payload = commands::build_payload(&file, &answer)?;
            let nats_url = nats_url.unwrap_or_else(mithril_common::config::nats_url);
            commands::submit(
                &nats_url,
                &client,
                &exercise,
                payload,
                Duration::from_millis(timeout_ms),
            )
            .await?;
        }
    }

    Ok(())
}
