//! opguard operator tool.
//!
//! Validates executor configuration files, inspects JSON-lines audit logs
//! and runs a self-check of the execution pipeline.

mod commands;
mod self_check;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// opguard operator tool
#[derive(Parser, Debug)]
#[command(name = "opguard")]
#[command(version, about = "Critical operation executor tooling")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a JSON configuration file
    CheckConfig {
        /// Path to the configuration file
        path: PathBuf,

        /// Print the effective configuration (defaults filled in)
        #[arg(long)]
        print: bool,
    },

    /// Print records from a JSON-lines audit log
    Audit {
        /// Path to the audit log
        path: PathBuf,

        /// Only records for this correlation id (children included)
        #[arg(long)]
        correlation_id: Option<String>,

        /// Only records with this outcome
        #[arg(long, value_enum)]
        outcome: Option<OutcomeFilter>,

        /// Only records for this operation kind
        #[arg(long)]
        kind: Option<String>,

        /// Output format
        #[arg(long, default_value = "text", value_enum)]
        format: OutputFormat,
    },

    /// Run sample operations against a scratch store
    SelfCheck {
        /// Configuration file to run with (defaults otherwise)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Store directory (a temporary store otherwise)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Print the metrics registry in Prometheus text format
        #[arg(long)]
        metrics: bool,
    },
}

/// Outcome selector for `audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutcomeFilter {
    Success,
    Failure,
    Alert,
}

/// Output format for `audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per record
    Text,
    /// One JSON object per line
    Json,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opguard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::CheckConfig { path, print } => commands::check_config(&path, print)?,
        Command::Audit {
            path,
            correlation_id,
            outcome,
            kind,
            format,
        } => {
            let filter = commands::AuditFilter {
                correlation_id,
                outcome,
                kind,
            };
            commands::print_audit(&path, &filter, format)?
        }
        Command::SelfCheck {
            config,
            data_dir,
            metrics,
        } => {
            let report = self_check::run(config.as_deref(), data_dir.as_deref())?;
            println!("{}", report.render());
            if metrics {
                println!("{}", report.prometheus);
            }
            if !report.passed() {
                return Err("self-check failed".into());
            }
        }
    }
    Ok(())
}
