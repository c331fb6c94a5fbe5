mod commands;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::migrate;
use logging::{init_logging, LoggingConfig};

#[derive(Parser)]
#[command(name = "migrator")]
#[command(about = "Versioned SQL migrations for PostgreSQL", version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = migrator_core::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Apply all pending migrations
    Up {
        /// List what would be applied without touching the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Roll back migrations of the latest batch
    Down {
        /// Number of migrations to roll back
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        steps: u64,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration pair
    Create {
        /// Migration name
        name: String,

        /// Target directory (defaults to the configured migrations path)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Apply pending migrations, rolling back this run's batch on failure
    Auto,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LoggingConfig {
        level: cli.log_level.clone(),
        json_format: cli.log_json,
        ..LoggingConfig::default()
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Up { dry_run } => {
            migrate::up(&cli.config, dry_run).await?;
        }
        Commands::Down { steps } => {
            migrate::down(&cli.config, steps as usize).await?;
        }
        Commands::Status { json } => {
            migrate::status(&cli.config, json).await?;
        }
        Commands::Create { name, dir } => {
            migrate::create(&cli.config, &name, dir.as_deref())?;
        }
        Commands::Auto => {
            migrate::auto(&cli.config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["migrator", "up", "--dry-run"]).unwrap();
        assert_eq!(cli.command, Commands::Up { dry_run: true });
        assert_eq!(cli.config, PathBuf::from("migrator.toml"));

        let cli = Cli::try_parse_from(["migrator", "down"]).unwrap();
        assert_eq!(cli.command, Commands::Down { steps: 1 });

        let cli =
            Cli::try_parse_from(["migrator", "--config", "db.toml", "down", "--steps", "3"])
                .unwrap();
        assert_eq!(cli.command, Commands::Down { steps: 3 });
        assert_eq!(cli.config, PathBuf::from("db.toml"));

        let cli = Cli::try_parse_from(["migrator", "create", "add users", "--dir", "sql"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Create {
                name: "add users".to_string(),
                dir: Some(PathBuf::from("sql"))
            }
        );

        let cli = Cli::try_parse_from(["migrator", "status", "--json", "--log-json"]).unwrap();
        assert_eq!(cli.command, Commands::Status { json: true });
        assert!(cli.log_json);
    }

    #[test]
    fn test_zero_steps_rejected() {
        assert!(Cli::try_parse_from(["migrator", "down", "--steps", "0"]).is_err());
        assert!(Cli::try_parse_from(["migrator"]).is_err());
    }
}
