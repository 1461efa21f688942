//! `dbproxy` - Lazily connected, idle-reclaimed database access
//!
//! The core is [`ConnectionManager`]: it owns at most one live connection,
//! opens it on first demand (exactly once, however many callers race), and
//! closes it from a background task once it has been idle for too long.

#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    missing_docs,
    rust_2018_idioms
)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

/// Command line interface definition
pub mod cli;
/// Command handlers for the CLI
pub mod commands;
/// Configuration management for dbproxy
pub mod config;
pub mod connection;
/// Read operations built on the managed connection
pub mod database;
/// Error types for connect and disconnect
pub mod error;
pub mod manager;
pub mod stress;

pub use config::Config;
pub use connection::{Connector, PgConnection, PostgresConnector};
pub use database::{Database, DatabaseError, TableRef};
pub use error::{ConnectError, DisconnectError};
pub use manager::{ConnectionManager, ManagerSettings, ManagerStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
