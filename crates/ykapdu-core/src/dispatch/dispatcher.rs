//! Serial command execution against one transport.

use tracing::{debug, instrument, warn};

use super::queue::{CommandQueue, CommandResult};
use crate::apdu::{ApduCodec, Command, Response};
use crate::error::ApduError;
use crate::events::{ConnectionEvent, ObserverRegistry, PacketDirection};
use crate::transport::KeyTransport;

/// Why [`Dispatcher::run`] returned.
#[derive(Debug)]
pub(crate) enum DispatchExit {
    /// Queue was shut down.
    Shutdown,
    /// The transport failed; the connection is gone.
    TransportLost(String),
}

/// Pulls entries off the queue one at a time and runs them to completion.
///
/// Lives on the connection worker thread, which exclusively owns the
/// transport.
pub(crate) struct Dispatcher<'a> {
    transport: &'a mut dyn KeyTransport,
    codec: ApduCodec,
    observers: &'a ObserverRegistry,
    max_get_response_rounds: usize,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        transport: &'a mut dyn KeyTransport,
        codec: ApduCodec,
        observers: &'a ObserverRegistry,
        max_get_response_rounds: usize,
    ) -> Self {
        Self {
            transport,
            codec,
            observers,
            max_get_response_rounds,
        }
    }

    /// Serve `queue` until it shuts down or the transport fails.
    ///
    /// `on_complete` sees every executed command and its result before the
    /// caller does.
    pub fn run<F>(&mut self, queue: &CommandQueue, mut on_complete: F) -> DispatchExit
    where
        F: FnMut(&Command, &CommandResult),
    {
        while let Some(entry) = queue.next() {
            let id = entry.id;
            if entry.is_cancelled() {
                debug!(id, "Skipping cancelled command");
                queue.finish(id);
                entry.complete(Err(ApduError::Cancelled));
                continue;
            }

            let result = self.execute(&entry.command);
            on_complete(&entry.command, &result);
            let lost = match &result {
                Err(ApduError::Transport(e)) => Some(e.to_string()),
                _ => None,
            };
            if lost.is_some() {
                // Nothing new may be queued behind a dead link.
                queue.close_intake();
            }
            queue.finish(id);
            entry.complete(result);

            if let Some(reason) = lost {
                warn!(id, reason = %reason, "Transport lost while executing command");
                return DispatchExit::TransportLost(reason);
            }
        }
        DispatchExit::Shutdown
    }

    /// Execute one command, following `61XX` continuations.
    #[instrument(skip(self, command), fields(ins = %format!("{:02X}", command.instruction())))]
    pub fn execute(&mut self, command: &Command) -> CommandResult {
        let frame = self.codec.encode(command)?;
        let first = self.exchange(&frame)?;
        if !first.status().is_more_data() {
            return Ok(first);
        }

        let mut status = first.status();
        let mut payload = first.into_payload();
        let mut rounds = 0;
        while let Some(remaining) = status.remaining() {
            rounds += 1;
            if rounds > self.max_get_response_rounds {
                warn!(rounds, "GET RESPONSE chain too long");
                return Err(ApduError::MalformedResponse { len: payload.len() });
            }
            debug!(remaining, round = rounds, "Fetching more response data");
            let frame = self.codec.encode(&Command::get_response(remaining))?;
            let next = self.exchange(&frame)?;
            status = next.status();
            payload.extend_from_slice(next.payload());
        }

        Ok(Response::new(status, payload))
    }

    fn exchange(&mut self, frame: &[u8]) -> Result<Response, ApduError> {
        self.observers
            .notify(&ConnectionEvent::packet(PacketDirection::Tx, frame));
        let raw = self.transport.send(frame)?;
        self.observers
            .notify(&ConnectionEvent::packet(PacketDirection::Rx, &raw));
        self.codec.decode(&raw)
    }
}
