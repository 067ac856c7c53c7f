//! One connection per transport kind, at most one of them open.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{ApduError, Result};
use crate::state::ConnectionState;
use crate::transport::{TransportConnector, TransportKind};

/// Owns the process's connections, keyed by transport kind.
///
/// Starting one connection stops the others first, so commands never
/// interleave across two keys.
#[derive(Debug, Default)]
pub struct KeyManager {
    connections: HashMap<TransportKind, Connection>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector, replacing any connection of the same kind.
    pub fn add_connector<C>(&mut self, connector: C, config: ConnectionConfig) -> &Connection
    where
        C: TransportConnector + 'static,
    {
        self.insert(Connection::new(connector, config))
    }

    /// Register an already built connection. A replaced one is stopped.
    pub fn insert(&mut self, connection: Connection) -> &Connection {
        let kind = connection.kind();
        match self.connections.entry(kind) {
            Entry::Occupied(mut slot) => {
                debug!(kind = %kind, "Replacing connection");
                slot.insert(connection).stop();
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(connection),
        }
    }

    pub fn connection(&self, kind: TransportKind) -> Option<&Connection> {
        self.connections.get(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.connections.keys().copied()
    }

    /// The connection currently Open, if any.
    pub fn open_connection(&self) -> Option<&Connection> {
        self.connections.values().find(|c| c.state().is_open())
    }

    /// Stop every other connection, then start `kind`.
    pub fn start(&self, kind: TransportKind) -> bool {
        let Some(target) = self.connections.get(&kind) else {
            return false;
        };
        self.stop_others(kind);
        target.start()
    }

    /// Like [`start`](Self::start), waiting up to each connection's
    /// `stop_timeout_ms` for the others to close and `timeout` for the target
    /// to open.
    pub fn start_blocking(&self, kind: TransportKind, timeout: Duration) -> Result<&Connection> {
        let target = self
            .connections
            .get(&kind)
            .ok_or(ApduError::ConnectionNotReady {
                state: ConnectionState::Closed,
            })?;
        for (other_kind, other) in &self.connections {
            if *other_kind != kind && other.state() != ConnectionState::Closed {
                info!(from = %other_kind, to = %kind, "Switching connection");
                other.stop_blocking(other.config().stop_timeout())?;
            }
        }
        target.start_blocking(timeout)?;
        Ok(target)
    }

    pub fn stop_all(&self) {
        for connection in self.connections.values() {
            connection.stop();
        }
    }

    fn stop_others(&self, kind: TransportKind) {
        for (other_kind, other) in &self.connections {
            if *other_kind != kind && other.state() != ConnectionState::Closed {
                info!(from = %other_kind, to = %kind, "Switching connection");
                other.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionDescription, MockConnector, MockTransport};

    const WAIT: Duration = Duration::from_secs(5);

    fn mock(kind: TransportKind) -> MockTransport {
        let mock = MockTransport::loopback();
        mock.set_description(ConnectionDescription::new(kind, format!("Mock {kind}")));
        mock
    }

    #[test]
    fn test_only_one_connection_open() {
        let usb = mock(TransportKind::Usb);
        let nfc = mock(TransportKind::Nfc);
        let mut manager = KeyManager::new();
        manager.add_connector(MockConnector::new(usb.clone()), ConnectionConfig::default());
        manager.add_connector(MockConnector::new(nfc.clone()), ConnectionConfig::default());

        manager.start_blocking(TransportKind::Usb, WAIT).unwrap();
        assert_eq!(manager.open_connection().unwrap().kind(), TransportKind::Usb);

        let nfc_conn = manager.start_blocking(TransportKind::Nfc, WAIT).unwrap();
        assert!(nfc_conn.state().is_open());
        assert_eq!(
            manager.connection(TransportKind::Usb).unwrap().state(),
            ConnectionState::Closed
        );
        assert_eq!(usb.close_count(), 1);
        assert_eq!(manager.open_connection().unwrap().kind(), TransportKind::Nfc);
    }

    #[test]
    fn test_switch_fails_when_other_will_not_close() {
        let usb = mock(TransportKind::Usb);
        let nfc = mock(TransportKind::Nfc);
        let mut manager = KeyManager::new();
        let quick_stop = ConnectionConfig {
            stop_timeout_ms: 50,
            ..Default::default()
        };
        manager.add_connector(MockConnector::new(usb.clone()), quick_stop);
        manager.add_connector(MockConnector::new(nfc.clone()), ConnectionConfig::default());
        let usb_conn = manager.start_blocking(TransportKind::Usb, WAIT).unwrap();

        // A command stuck on the key keeps USB in Closing
        usb.hold();
        let stuck = usb_conn.submit(crate::apdu::Command::new(0, 0x01, 0, 0)).unwrap();
        assert!(usb.wait_until_parked(WAIT));
        assert!(matches!(
            manager.start_blocking(TransportKind::Nfc, WAIT),
            Err(ApduError::Timeout { timeout_ms: 50 })
        ));
        assert_eq!(nfc.open_count(), 0);

        usb.release();
        assert!(stuck.wait().is_ok());
        manager.start_blocking(TransportKind::Nfc, WAIT).unwrap();
        assert_eq!(manager.open_connection().unwrap().kind(), TransportKind::Nfc);
    }

    #[test]
    fn test_unknown_kind() {
        let manager = KeyManager::new();
        assert!(!manager.start(TransportKind::Accessory));
        assert!(manager.start_blocking(TransportKind::Accessory, WAIT).is_err());
        assert!(manager.open_connection().is_none());
    }

    #[test]
    fn test_stop_all() {
        let usb = mock(TransportKind::Usb);
        let mut manager = KeyManager::new();
        let conn = manager.add_connector(MockConnector::new(usb), ConnectionConfig::default());
        conn.start_blocking(WAIT).unwrap();

        manager.stop_all();
        let conn = manager.connection(TransportKind::Usb).unwrap();
        conn.stop_blocking(WAIT).unwrap();
        assert_eq!(manager.kinds().count(), 1);
        assert!(manager.open_connection().is_none());
    }
}
