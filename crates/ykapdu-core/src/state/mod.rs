//! State machine module.

pub(crate) mod cell;
pub mod machine;

pub(crate) use cell::StateCell;
pub use machine::{ConnectionState, Transition};
