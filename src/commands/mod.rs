use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::database::Database;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// List commands (databases, schemas, tables)
pub mod list;
/// Ping command functionality
pub mod ping;
/// Stress command functionality
pub mod stress;

/// Bound on the final disconnect when a command finishes
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Load configuration and build the (not yet connected) database handle
///
/// `None` looks for `dbproxy.toml` and falls back to the environment.
pub fn open_database(config_path: Option<&Path>) -> Result<Database> {
    let config = match config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load_default()
            .with_context(|| format!("Failed to load configuration from {DEFAULT_CONFIG_FILE}"))?,
    };
    let database = Database::from_config(&config).context("Invalid connection configuration")?;
    debug!("Database handle ready for {}", database.manager().address());
    Ok(database)
}

/// Close the shared connection, logging instead of failing
pub async fn close_database(database: &Database) {
    if let Err(e) = database.manager().shutdown_within(CLOSE_TIMEOUT).await {
        warn!("Error closing database connection: {}", e);
    }
}
