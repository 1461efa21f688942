use crate::database::Database;
use anyhow::{Context, Result};
use std::time::Instant;
use tracing::info;

/// Handle the ping command
#[allow(clippy::disallowed_methods)]
pub async fn handle_ping(database: &Database) -> Result<()> {
    let started = Instant::now();
    database.ping().await.context("Ping failed")?;
    let latency = started.elapsed();

    let version = database
        .server_version()
        .await
        .context("Failed to read server version")?;

    info!("Ping succeeded in {:?}", latency);
    println!("✅ {} is reachable ({:?})", database.manager().address(), latency);
    println!("   Server version: {version}");
    Ok(())
}
