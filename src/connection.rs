//! Database connection establishment and teardown
//!
//! [`Connector`] is the seam between the lifecycle manager and the driver:
//! the manager decides *when* to connect and disconnect, the connector knows
//! *how*. [`PostgresConnector`] is the production implementation.

use crate::error::{ConnectError, DisconnectError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::Deref;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};
use url::Url;

/// Creates and closes the physical connection behind a manager
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The live connection handed out to borrowers
    type Connection: Send + Sync + 'static;

    /// Establish a new connection to `address`
    async fn connect(&self, address: &str) -> Result<Self::Connection, ConnectError>;

    /// Close a connection previously returned by [`Connector::connect`]
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), DisconnectError>;
}

/// Connector for `PostgreSQL` servers using `tokio-postgres`
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

impl PostgresConnector {
    /// Create a new `PostgreSQL` connector
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Background driver task of one `tokio-postgres` connection
struct Driver {
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A live `PostgreSQL` connection
///
/// Dereferences to [`tokio_postgres::Client`]. Once the manager disconnects
/// it, every request on the client fails with a closed-connection error.
pub struct PgConnection {
    client: Client,
    driver: Mutex<Option<Driver>>,
}

impl PgConnection {
    /// The underlying client
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Whether the server side of the connection has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PgConnection;

    async fn connect(&self, address: &str) -> Result<PgConnection, ConnectError> {
        let redacted = redact_address(address);
        debug!("Opening PostgreSQL connection to {}", redacted);

        let (client, connection) =
            tokio_postgres::connect(address, NoTls)
                .await
                .map_err(|e| ConnectError::Failed {
                    address: redacted.clone(),
                    details: e.to_string(),
                })?;

        let (close, close_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        warn!("PostgreSQL connection to {} terminated: {}", redacted, e);
                    }
                }
                _ = close_rx => {
                    debug!("Closing PostgreSQL connection to {}", redacted);
                }
            }
        });

        Ok(PgConnection {
            client,
            driver: Mutex::new(Some(Driver { close, task })),
        })
    }

    async fn disconnect(&self, connection: &PgConnection) -> Result<(), DisconnectError> {
        let Some(driver) = connection.driver.lock().take() else {
            return Ok(());
        };

        // The driver may already have exited on a server-side close.
        let _ = driver.close.send(());
        driver.task.await.map_err(|e| DisconnectError::Failed {
            details: e.to_string(),
        })
    }
}

/// Render a connection address safe for logs
///
/// URL addresses keep everything but the password; key/value connection
/// strings keep only their `host`, `port`, `user` and `dbname` pairs.
#[must_use]
pub fn redact_address(address: &str) -> String {
    match Url::parse(address) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => address
            .split_whitespace()
            .filter(|pair| {
                ["host=", "port=", "user=", "dbname="]
                    .iter()
                    .any(|key| pair.starts_with(key))
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}
