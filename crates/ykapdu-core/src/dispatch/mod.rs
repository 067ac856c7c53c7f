//! Command queue and dispatcher.

pub(crate) mod dispatcher;
pub mod queue;

pub(crate) use dispatcher::{DispatchExit, Dispatcher};
pub(crate) use queue::{CommandQueue, QueueEntry};
pub use queue::{CommandResult, PendingResponse};
