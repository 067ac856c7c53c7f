//! ykapdu-core: APDU session engine for hardware security keys.
//!
//! This crate drives ISO 7816-4 command/response exchanges with a key over
//! any transport, serializing every command through one worker per
//! connection.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **APDU**: Command/response types and short/extended framing
//! - **Transport**: Key communication abstraction (CCID over nusb, mock)
//! - **Dispatch**: FIFO command queue and the serial dispatcher
//! - **State**: Connection state machine
//! - **Events**: Observer registry for state, attach/detach and frame events
//! - **Connection**: Lifecycle orchestrator owning the worker thread
//! - **Session**: Commands scoped to a selected application
//! - **Manager**: One connection per transport kind, one open at a time
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use ykapdu_core::{Application, CcidConnector, Command, Connection, ConnectionConfig};
//!
//! let conn = Connection::new(CcidConnector::new(), ConnectionConfig::default());
//! conn.start_blocking(Duration::from_secs(10)).expect("no key");
//!
//! let piv = conn.select(&Application::Piv).expect("SELECT failed");
//! let serial = piv.execute(Command::new(0x00, 0xF8, 0x00, 0x00)).expect("GET SERIAL failed");
//! println!("{:02X?}", serial.payload());
//! ```

pub mod apdu;
pub mod application;
pub mod blocking;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod manager;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use apdu::{ApduCodec, Command, Response, StatusWord};
pub use application::{Application, TouchPolicy};
pub use blocking::{
    clear_current_thread_non_blocking, is_current_thread_non_blocking,
    mark_current_thread_non_blocking,
};
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use dispatch::{CommandResult, PendingResponse};
pub use error::{ApduError, Result};
pub use events::{
    ChannelObserver, ConnectionEvent, ConnectionObserver, NullObserver, PacketDirection,
    SubscriptionId, TracingObserver,
};
pub use manager::KeyManager;
pub use session::Session;
pub use state::{ConnectionState, Transition};
pub use transport::{
    CcidConnector, ConnectionDescription, KeyTransport, MockConnector, MockTransport,
    TransportConnector, TransportError, TransportKind,
};
