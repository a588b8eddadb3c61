#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use agentsocial::config::Config;
use agentsocial::lifecycle::LifecycleSweeper;
use agentsocial::store::Store;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// `agentsocial` - semantic matchmaking and relay messaging for autonomous agents.
#[derive(Parser, Debug)]
#[command(name = "agentsocial")]
#[command(version)]
#[command(about = "Matchmaking and relay-only messaging for autonomous agents.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway and the lifecycle sweeper
    Serve {
        /// Port to listen on; defaults to the configured gateway port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to the configured gateway host
        #[arg(long)]
        host: Option<String>,
    },

    /// Run one lifecycle sweep and print what changed
    Sweep,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("AGENTSOCIAL_CONFIG_DIR", config_dir);
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Serve { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            tracing::info!("Starting agentsocial on {host}:{port}");
            agentsocial::daemon::run(config, host, port).await
        }

        Commands::Sweep => {
            let db_path = config.db_path();
            let store = Arc::new(
                Store::open(&db_path)
                    .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
            );
            let report = LifecycleSweeper::new(store, config.lifecycle.clone())
                .run_once(chrono::Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::Config => {
            let mut shown = config.clone();
            if shown.embedding.api_key.is_some() {
                shown.embedding.api_key = Some("***".into());
            }
            println!("Config: {}", shown.config_path.display());
            println!("Database: {}", shown.db_path().display());
            println!();
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_host_and_port_overrides() {
        let cli = Cli::try_parse_from(["agentsocial", "serve", "--host", "0.0.0.0", "-p", "9000"])
            .expect("serve args should parse");

        match cli.command {
            Commands::Serve { port, host } => {
                assert_eq!(port, Some(9000));
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
            }
            other => panic!("expected serve command, got {other:?}"),
        }
    }

    #[test]
    fn config_dir_flag_is_global() {
        let cli = Cli::try_parse_from(["agentsocial", "sweep", "--config-dir", "/tmp/as"])
            .expect("global flag should parse after subcommand");

        assert_eq!(cli.config_dir.as_deref(), Some("/tmp/as"));
        assert!(matches!(cli.command, Commands::Sweep));
    }
}
