//! Sessions bound to a selected application.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::apdu::{Command, Response};
use crate::connection::Inner;
use crate::dispatch::PendingResponse;
use crate::error::{ApduError, Result};

/// Commands issued on behalf of one selected application.
///
/// Valid while its connection stays Open and no other application has been
/// selected since. After that every call fails with
/// [`ApduError::SessionClosed`].
pub struct Session {
    inner: Arc<Inner>,
    aid: Vec<u8>,
    epoch: u64,
    generation: u64,
}

impl Session {
    /// Bind to `aid`, which the worker must have just recorded as selected.
    pub(crate) fn bind(inner: Arc<Inner>, aid: &[u8]) -> Result<Self> {
        let epoch = inner.epoch();
        let generation = {
            let selection = inner.selection();
            if selection.aid.as_deref() != Some(aid) {
                return Err(ApduError::SessionClosed);
            }
            selection.generation
        };
        if !inner.state().is_open() || inner.epoch() != epoch {
            return Err(ApduError::SessionClosed);
        }
        debug!(aid = %hex::encode_upper(aid), generation, "Session bound");
        Ok(Self {
            inner,
            aid: aid.to_vec(),
            epoch,
            generation,
        })
    }

    pub fn aid(&self) -> &[u8] {
        &self.aid
    }

    pub fn is_valid(&self) -> bool {
        if !self.inner.state().is_open() || self.inner.epoch() != self.epoch {
            return false;
        }
        let selection = self.inner.selection();
        selection.generation == self.generation && selection.aid.as_deref() == Some(&self.aid[..])
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ApduError::SessionClosed)
        }
    }

    /// Queue a command without waiting.
    pub fn submit(&self, command: Command) -> Result<PendingResponse> {
        self.ensure_valid()?;
        self.inner.submit(command)
    }

    /// Send a command and return the raw response, whatever its status word.
    pub fn transmit(&self, command: Command) -> Result<Response> {
        self.ensure_valid()?;
        self.inner
            .execute_blocking(command, self.inner.command_timeout())
    }

    /// Send a command; a non-success status word becomes [`ApduError::Status`].
    pub fn execute(&self, command: Command) -> Result<Response> {
        self.transmit(command)?.into_result()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("aid", &hex::encode_upper(&self.aid))
            .field("valid", &self.is_valid())
            .finish()
    }
}
