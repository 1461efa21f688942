//! # Database Read Operations
//!
//! Thin request helpers on top of the [`ConnectionManager`]. Every operation
//! borrows the shared connection with `acquire`, issues one request and
//! returns; the manager alone decides when the connection is opened and
//! closed.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbproxy::{Config, Database};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("dbproxy.toml")?;
//! let database = Database::from_config(&config)?;
//!
//! let tables = database.list_tables("public").await?;
//! let users = database.table(Some("public"), "users")?;
//! let count = database.row_count(&users).await?;
//!
//! database.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{Config, ConfigError};
use crate::connection::{PgConnection, PostgresConnector};
use crate::error::{ConnectError, DisconnectError};
use crate::manager::{ConnectionManager, ManagerSettings};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Schema used when neither the caller nor the configuration names one
pub const FALLBACK_SCHEMA: &str = "public";

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The shared connection could not be borrowed
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Database query error
    #[error("Database query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// A schema or table name was empty
    #[error("Invalid name: {0}")]
    InvalidName(String),
}

/// Reference to a table, selected by name
///
/// Pure naming: nothing is checked against the server until it is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    schema: String,
    name: String,
}

impl TableRef {
    /// Schema the table lives in
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Table name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema-qualified, quoted identifier safe to splice into SQL
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

/// Result of [`Database::list_databases`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseList {
    /// Database names, sorted
    pub databases: Vec<String>,
    /// Number of databases
    pub count: usize,
}

/// Result of [`Database::list_schemas`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaList {
    /// Schema names, sorted
    pub schemas: Vec<String>,
    /// Number of schemas
    pub count: usize,
}

/// Result of [`Database::list_tables`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableList {
    /// Schema that was listed
    pub schema: String,
    /// Table names, sorted
    pub tables: Vec<String>,
    /// Number of tables
    pub count: usize,
}

/// Read operations against the managed `PostgreSQL` connection
#[derive(Clone)]
pub struct Database {
    manager: ConnectionManager<PostgresConnector>,
    default_schema: Option<String>,
}

impl Database {
    /// Wrap an existing manager
    #[must_use]
    pub const fn new(
        manager: ConnectionManager<PostgresConnector>,
        default_schema: Option<String>,
    ) -> Self {
        Self {
            manager,
            default_schema,
        }
    }

    /// Build the manager from configuration
    ///
    /// Does not connect; the first operation does.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let connection = &config.connection;
        let settings: ManagerSettings = connection.manager_settings();
        let manager = ConnectionManager::postgres(connection.resolved_url()?, settings);
        Ok(Self::new(manager, connection.default_schema.clone()))
    }

    /// The underlying connection manager
    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager<PostgresConnector> {
        &self.manager
    }

    /// Schema used for tables named without one
    #[must_use]
    pub fn default_schema(&self) -> &str {
        self.default_schema.as_deref().unwrap_or(FALLBACK_SCHEMA)
    }

    /// Borrow the shared connection, replacing it once if the server dropped it
    async fn connection(&self) -> Result<Arc<PgConnection>, DatabaseError> {
        let connection = self.manager.acquire().await?;
        if !connection.is_closed() {
            return Ok(connection);
        }

        warn!(
            "Connection to {} was closed by the server, reconnecting",
            self.manager.address()
        );
        if let Err(e) = self.manager.invalidate(&connection).await {
            debug!("Discarding closed connection failed: {}", e);
        }
        drop(connection);

        let connection = self.manager.acquire().await?;
        if connection.is_closed() {
            return Err(ConnectError::Closed.into());
        }
        Ok(connection)
    }

    /// Check the server answers
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let connection = self.connection().await?;
        connection.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// The server's version string
    pub async fn server_version(&self) -> Result<String, DatabaseError> {
        let connection = self.connection().await?;
        let row = connection.query_one("SHOW server_version", &[]).await?;
        Ok(row.get(0))
    }

    /// Names of all connectable, non-template databases
    pub async fn list_databases(&self) -> Result<DatabaseList, DatabaseError> {
        let connection = self.connection().await?;
        let rows = connection
            .query(
                "SELECT datname FROM pg_database \
                 WHERE NOT datistemplate AND datallowconn ORDER BY datname",
                &[],
            )
            .await?;

        let databases: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        debug!("Listed {} databases", databases.len());
        Ok(DatabaseList {
            count: databases.len(),
            databases,
        })
    }

    /// Names of all user schemas
    pub async fn list_schemas(&self) -> Result<SchemaList, DatabaseError> {
        let connection = self.connection().await?;
        let rows = connection
            .query(
                "SELECT schema_name::text FROM information_schema.schemata \
                 WHERE schema_name NOT LIKE 'pg\\_%' AND schema_name <> 'information_schema' \
                 ORDER BY schema_name",
                &[],
            )
            .await?;

        let schemas: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        Ok(SchemaList {
            count: schemas.len(),
            schemas,
        })
    }

    /// Names of the base tables in `schema`
    pub async fn list_tables(&self, schema: &str) -> Result<TableList, DatabaseError> {
        let schema = validate_name("schema", schema)?;
        let connection = self.connection().await?;
        let rows = connection
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[&schema],
            )
            .await?;

        let tables: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        debug!("Listed {} tables in schema {}", tables.len(), schema);
        Ok(TableList {
            schema: schema.to_string(),
            count: tables.len(),
            tables,
        })
    }

    /// Select a table by name; `schema = None` uses the default schema
    pub fn table(&self, schema: Option<&str>, name: &str) -> Result<TableRef, DatabaseError> {
        let schema = validate_name("schema", schema.unwrap_or_else(|| self.default_schema()))?;
        let name = validate_name("table", name)?;
        Ok(TableRef {
            schema: schema.to_string(),
            name: name.to_string(),
        })
    }

    /// Number of rows in a table
    pub async fn row_count(&self, table: &TableRef) -> Result<i64, DatabaseError> {
        let connection = self.connection().await?;
        let sql = format!("SELECT count(*) FROM {}", table.qualified_name());
        let row = connection.query_one(sql.as_str(), &[]).await?;
        Ok(row.get(0))
    }

    /// Close the managed connection; see [`ConnectionManager::shutdown`]
    pub async fn shutdown(&self) -> Result<(), DisconnectError> {
        self.manager.shutdown().await
    }
}

fn validate_name<'a>(kind: &str, name: &'a str) -> Result<&'a str, DatabaseError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(DatabaseError::InvalidName(format!("{kind} name is required")));
    }
    Ok(trimmed)
}

/// Quote an SQL identifier, doubling embedded quotes
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_database(default_schema: Option<&str>) -> Database {
        let manager = ConnectionManager::postgres(
            "postgresql://postgres@127.0.0.1:1/postgres",
            ManagerSettings::default(),
        );
        Database::new(manager, default_schema.map(String::from))
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_uses_default_schema() {
        let database = offline_database(Some("app"));
        let table = database.table(None, "users").unwrap();
        assert_eq!(table.schema(), "app");
        assert_eq!(table.name(), "users");
        assert_eq!(table.qualified_name(), "\"app\".\"users\"");

        let fallback = offline_database(None).table(None, "users").unwrap();
        assert_eq!(fallback.schema(), FALLBACK_SCHEMA);
    }

    #[test]
    fn test_table_rejects_empty_names() {
        let database = offline_database(None);
        assert!(matches!(
            database.table(None, "  "),
            Err(DatabaseError::InvalidName(_))
        ));
        assert!(matches!(
            database.table(Some(""), "users"),
            Err(DatabaseError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_list_tables_rejects_empty_schema_without_connecting() {
        let database = offline_database(None);
        let result = database.list_tables("").await;
        assert!(matches!(result, Err(DatabaseError::InvalidName(_))));
        assert_eq!(database.manager().stats().connects, 0);
        assert_eq!(database.manager().stats().connect_failures, 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_connect_error() {
        let database = offline_database(None);
        let result = database.ping().await;
        assert!(matches!(result, Err(DatabaseError::Connect(_))));
        assert!(!database.manager().is_connected());
    }
}
