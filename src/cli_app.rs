//! CLI front-end: argument parsing and subcommand dispatch.

#![allow(missing_docs)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::coordinator::Coordinator;
use crate::daemon::signals::ShutdownToken;

#[derive(Debug, Parser)]
#[command(
    name = "loadkeeper",
    version,
    about = "Keeps always-free cloud instances above the provider's idle-reclamation floor"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the shaping daemon in the foreground.
    Run {
        /// Path to a TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Load and validate the configuration, then exit.
    Validate {
        /// Path to a TOML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

pub fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Run { config } => {
            let config = Config::load(config.as_deref())?;
            let token = ShutdownToken::new();
            token.register_signals();
            #[allow(clippy::cast_precision_loss)]
            let now = chrono::Utc::now().timestamp() as f64;
            let coordinator = Coordinator::init(config, token, now)?;
            coordinator.run()
        }
        Command::Validate { config } => {
            let config = Config::load(config.as_deref())?;
            let hash = config.stable_hash()?;
            println!("configuration ok (hash {hash})");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn validate_with_missing_explicit_config_fails() {
        let cli = Cli {
            command: Command::Validate {
                config: Some(PathBuf::from("/nonexistent/loadkeeper.toml")),
            },
        };
        let err = run(&cli).expect_err("missing explicit config must fail");
        assert_eq!(err.code(), "LK-1002");
    }

    #[test]
    fn validate_with_defaults_succeeds() {
        let cli = Cli {
            command: Command::Validate { config: None },
        };
        run(&cli).expect("default configuration is valid");
    }
}
