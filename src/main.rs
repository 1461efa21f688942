use dbproxy::cli::{Cli, Commands};
use dbproxy::commands::{close_database, list, open_database, ping, stress};
use dbproxy::stress::StressConfig;
use std::process;
use tracing_subscriber::EnvFilter;

// Allow println in main CLI binary
#[allow(clippy::disallowed_methods)]
fn main() {
    // Initialize comprehensive logging
    init_logging();

    let cli = Cli::parse();
    tracing::info!("dbproxy CLI initialized");

    let Some(command) = cli.command else {
        println!("dbproxy - Use --help for available commands");
        return;
    };

    let database = match open_database(cli.config.as_deref()) {
        Ok(database) => database,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        let result = match command {
            Commands::Ping => ping::handle_ping(&database).await,
            Commands::Databases { json } => list::handle_databases(&database, json).await,
            Commands::Schemas { json } => list::handle_schemas(&database, json).await,
            Commands::Tables { schema, json } => {
                list::handle_tables(&database, schema.as_deref(), json).await
            }
            Commands::Stress {
                concurrency,
                duration,
                requests,
                timeout,
            } => {
                let config = StressConfig {
                    concurrency,
                    duration,
                    requests,
                    timeout,
                };
                stress::handle_stress(&database, config).await
            }
        };

        close_database(&database).await;
        result
    });

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Initialize comprehensive logging based on environment variables
fn init_logging() {
    // Default to INFO level, can be overridden by RUST_LOG environment variable
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dbproxy=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
