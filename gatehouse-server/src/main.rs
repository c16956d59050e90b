//! The `gatehouse` command line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use gatehouse_core::config;
use gatehouse_core::kms::{self, KmsPurpose, KmsRegistry};
use gatehouse_server::controller::store::PgControlStore;
use gatehouse_server::controller::ControlPlane;
use gatehouse_server::supervisor::{ServerOptions, Supervisor};

#[derive(Parser)]
#[command(name = "gatehouse", version, about = "Identity-aware session broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a gatehouse server (controller, worker, or both)
    Server(ServerArgs),

    /// Worker management helpers
    Workers {
        #[command(subcommand)]
        action: WorkersAction,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Path to the configuration file
    #[arg(long)]
    config: PathBuf,

    /// Path to a file containing a kms block with "config" purpose, used to
    /// decrypt the main configuration file. Defaults to looking for such a
    /// block in the main file itself.
    #[arg(long = "config-kms")]
    config_kms: Option<PathBuf>,

    /// Log verbosity: trace, debug, info, warn, or err
    #[arg(long, env = "GATEHOUSE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: standard or json
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum WorkersAction {
    /// Mint a one-time activation token for controller-led worker enrollment
    NewActivationToken {
        /// Path to a controller configuration file
        #[arg(long)]
        config: PathBuf,

        /// Token validity, e.g. "30m", "24h"
        #[arg(long, default_value = "24h")]
        validity: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Workers { action } => run_workers(action).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(ServerOptions {
        config_path: args.config,
        config_kms_path: args.config_kms,
        log_level: args.log_level,
        log_format: args.log_format,
        handle_signals: true,
    })?;
    supervisor.run().await
}

async fn run_workers(action: WorkersAction) -> anyhow::Result<()> {
    match action {
        WorkersAction::NewActivationToken { config, validity } => {
            let validity_secs = parse_duration(&validity)?;

            let wrapper = kms::config_wrapper_from_path(&config)
                .context("error constructing config kms wrapper")?;
            let loaded = config::load_file(&config, wrapper.as_deref())?;
            let controller_config = loaded
                .controller
                .as_ref()
                .context("minting activation tokens requires a controller configuration")?;

            let registry = KmsRegistry::from_blocks(&loaded.kms)?;
            let root_wrapper = registry
                .resolve(KmsPurpose::Root)
                .context("root KMS not found after parsing kms blocks")?;

            let pool = PgPoolOptions::new()
                .max_connections(2)
                .connect(&controller_config.database.url)
                .await
                .context("error connecting to database")?;
            let store = Arc::new(PgControlStore::new(pool));

            let plane = ControlPlane::open(&controller_config.name, store, root_wrapper).await?;
            let token = plane.mint_activation_token(validity_secs);

            println!("Worker Activation Token");
            println!("=======================");
            println!();
            println!("Token:   {token}");
            println!();
            println!("Expires: {} (unix seconds)", token.expires_at());
            println!();
            println!("Place this in the worker's configuration as");
            println!("\"controller_generated_activation_token\" (or behind env:// or");
            println!("file:// indirection). The token is single-use.");

            for (purpose, e) in registry.finalize_all() {
                tracing::warn!(purpose = %purpose, error = %e, "error finalizing kms wrapper");
            }
            if let Some(wrapper) = wrapper {
                if let Err(e) = wrapper.finalize() {
                    tracing::warn!(error = %e, "error finalizing config kms");
                }
            }
            Ok(())
        }
    }
}

/// Parse a duration like "90s", "30m", or "24h" into seconds. A bare number
/// means seconds.
fn parse_duration(s: &str) -> anyhow::Result<i64> {
    let s = s.trim();
    let (number, unit) = match s.chars().last() {
        Some('s') => (&s[..s.len() - 1], 1),
        Some('m') => (&s[..s.len() - 1], 60),
        Some('h') => (&s[..s.len() - 1], 3600),
        _ => (s, 1),
    };
    let number: i64 = number
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    Ok(number.saturating_mul(unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("90").unwrap(), 90);
        assert_eq!(parse_duration("90s").unwrap(), 90);
        assert_eq!(parse_duration("30m").unwrap(), 1800);
        assert_eq!(parse_duration("24h").unwrap(), 86_400);
        assert!(parse_duration("soon").is_err());
    }
}
