use crate::database::Database;
use crate::stress::{self, StressConfig};
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

/// Handle the stress command
///
/// Every worker pings through the same manager, so the run should show a
/// single connect however high the concurrency.
#[allow(clippy::disallowed_methods)]
pub async fn handle_stress(database: &Database, config: StressConfig) -> Result<()> {
    println!("Starting stress test...");
    println!("Target:          {}", database.manager().address());
    println!("Concurrency:     {}", config.concurrency);
    if config.requests > 0 {
        println!("Total Requests:  {}", config.requests);
    } else {
        println!("Duration:        {:?}", config.duration);
    }
    println!("Request Timeout: {:?}", config.timeout);
    println!();

    let (stop_tx, stop_rx) = watch::channel(false);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping stress test");
            let _ = stop_tx.send(true);
        }
    });

    let target = database.clone();
    let report = stress::run_until(
        config,
        move || {
            let target = target.clone();
            async move { target.ping().await }
        },
        stop_rx,
    )
    .await;
    interrupt.abort();

    println!("{report}");

    let stats = database.manager().stats();
    info!(
        "Manager after stress test: connects={}, connect_failures={}",
        stats.connects, stats.connect_failures
    );
    println!("Connection Manager:");
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("Failed to serialize manager stats")?
    );
    Ok(())
}
