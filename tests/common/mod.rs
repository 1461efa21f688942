//! Shared test utilities for dbproxy integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dbproxy::{ConnectError, ConnectionManager, Connector, DisconnectError, ManagerSettings};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters and failure switches shared between a test and its connector
#[derive(Debug, Default)]
pub struct Tally {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub live: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
}

impl Tally {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }
}

/// In-memory connector that counts every connect and disconnect
pub struct MockConnector {
    tally: Arc<Tally>,
    connect_delay: Duration,
    disconnect_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            tally: Arc::new(Tally::default()),
            connect_delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    pub fn tally(&self) -> Arc<Tally> {
        Arc::clone(&self.tally)
    }
}

/// Connection produced by [`MockConnector`]
#[derive(Debug)]
pub struct MockConnection {
    pub id: usize,
    closed: AtomicBool,
    tally: Arc<Tally>,
}

impl MockConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.tally.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, address: &str) -> Result<MockConnection, ConnectError> {
        let id = self.tally.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        if self.tally.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectError::Failed {
                address: address.to_string(),
                details: format!("connection refused (attempt {id})"),
            });
        }

        self.tally.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id,
            closed: AtomicBool::new(false),
            tally: Arc::clone(&self.tally),
        })
    }

    async fn disconnect(&self, connection: &MockConnection) -> Result<(), DisconnectError> {
        self.tally.disconnects.fetch_add(1, Ordering::SeqCst);
        if !self.disconnect_delay.is_zero() {
            tokio::time::sleep(self.disconnect_delay).await;
        }

        if self.tally.fail_disconnect.load(Ordering::SeqCst) {
            return Err(DisconnectError::Failed {
                details: "socket error".to_string(),
            });
        }

        connection.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Idle timeout 100ms, check interval 20ms
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings::new()
        .with_idle_timeout(Duration::from_millis(100))
        .with_check_interval(Duration::from_millis(20))
        .with_connect_timeout(Duration::from_secs(1))
        .with_disconnect_timeout(Duration::from_millis(50))
}

/// Build a manager around `connector`, returning the tally alongside
pub fn mock_manager(
    connector: MockConnector,
    settings: ManagerSettings,
) -> (ConnectionManager<MockConnector>, Arc<Tally>) {
    let tally = connector.tally();
    (
        ConnectionManager::new("mock://primary", connector, settings),
        tally,
    )
}
