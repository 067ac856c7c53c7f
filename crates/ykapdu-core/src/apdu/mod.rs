//! APDU module - command/response framing.

pub mod codec;
pub mod command;
pub mod constants;
pub mod response;

pub use codec::ApduCodec;
pub use command::Command;
pub use constants::*;
pub use response::{Response, StatusWord};
