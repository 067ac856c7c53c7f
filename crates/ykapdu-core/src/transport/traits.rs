//! Key transport abstraction.
//!
//! Defines the `KeyTransport` trait for exchanging raw APDU frames with a key,
//! and `TransportConnector` for creating one when a connection opens. The
//! engine never cares which physical link sits behind it.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X}")]
    DeviceNotFound { vid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Physical link variant, chosen when the connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Lightning/accessory protocol.
    Accessory,
    /// Contactless.
    Nfc,
    /// USB CCID.
    Usb,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Accessory => write!(f, "Accessory"),
            TransportKind::Nfc => write!(f, "NFC"),
            TransportKind::Usb => write!(f, "USB"),
        }
    }
}

/// Metadata of the connected key, available while the connection is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescription {
    pub kind: TransportKind,
    pub name: String,
    pub serial: Option<u32>,
    pub firmware_version: Option<String>,
    /// Whether the key accepts extended-length APDUs.
    pub extended_apdu: bool,
}

impl ConnectionDescription {
    pub fn new(kind: TransportKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            serial: None,
            firmware_version: None,
            extended_apdu: true,
        }
    }
}

/// Raw frame exchange with a key.
///
/// Implementations are owned by exactly one connection worker, so `send`
/// takes `&mut self` and is never called concurrently.
pub trait KeyTransport: Send {
    /// Link handshake. Called once while the connection is opening.
    fn open(&mut self) -> Result<ConnectionDescription, TransportError>;

    /// Send one APDU frame and return the raw response (payload + status word).
    fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Tear the link down. Called once while the connection is closing.
    fn close(&mut self) {}

    fn kind(&self) -> TransportKind;
}

/// Creates a fresh transport each time a connection opens.
pub trait TransportConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn KeyTransport>, TransportError>;

    fn kind(&self) -> TransportKind;
}
