//! Transport layer module.

pub mod ccid;
pub mod mock;
pub mod traits;

pub use ccid::{CcidConnector, CcidDevice, CcidTransport, list_keys};
pub use mock::{MockConnector, MockTransport};
pub use traits::{
    ConnectionDescription, KeyTransport, TransportConnector, TransportError, TransportKind,
};
