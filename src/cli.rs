use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Main CLI interface for `dbproxy`
#[derive(Parser)]
#[command(name = "dbproxy")]
#[command(version = crate::VERSION)]
#[command(about = "dbproxy - Lazily connected PostgreSQL access with idle reclamation")]
#[command(
    long_about = "One shared database connection, opened on first use and closed again once it sits idle"
)]
pub struct Cli {
    /// Path to the configuration file [default: dbproxy.toml, optional]
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check that the database answers
    Ping,
    /// List databases on the server
    Databases {
        /// Print JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// List schemas in the connected database
    Schemas {
        /// Print JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// List tables in a schema
    Tables {
        /// Schema to list; defaults to the configured default schema
        #[arg(long, value_name = "NAME")]
        schema: Option<String>,
        /// Print JSON instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Hammer the shared connection with concurrent requests
    Stress {
        /// Number of concurrent workers
        #[arg(short = 'c', long, default_value_t = 10)]
        concurrency: usize,
        /// How long to run when no request count is given
        #[arg(short = 'd', long, value_parser = humantime::parse_duration, default_value = "30s")]
        duration: Duration,
        /// Total number of requests (0 = run for duration)
        #[arg(short = 'n', long, default_value_t = 0)]
        requests: u64,
        /// Per-request timeout
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        timeout: Duration,
    },
}

impl Cli {
    /// Parse command line arguments
    #[must_use]
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
