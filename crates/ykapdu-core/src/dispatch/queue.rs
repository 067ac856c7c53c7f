//! FIFO of pending commands and the handles callers wait on.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::apdu::{Command, Response};
use crate::blocking::ensure_blocking_allowed;
use crate::error::ApduError;

pub type CommandResult = Result<Response, ApduError>;

/// Where a finished command's result goes.
pub(crate) enum Completion {
    Channel(mpsc::SyncSender<CommandResult>),
    Callback(Box<dyn FnOnce(CommandResult) + Send>),
}

/// A queued command with its completion target and cancellation flag.
pub(crate) struct QueueEntry {
    pub id: u64,
    pub command: Command,
    cancelled: Arc<AtomicBool>,
    completion: Completion,
}

impl QueueEntry {
    /// Entry paired with a [`PendingResponse`].
    pub fn with_handle(id: u64, command: Command) -> (Self, PendingResponse) {
        let (tx, rx) = mpsc::sync_channel(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Self {
            id,
            command,
            cancelled: cancelled.clone(),
            completion: Completion::Channel(tx),
        };
        let handle = PendingResponse {
            id,
            receiver: rx,
            cancelled,
        };
        (entry, handle)
    }

    /// Entry that hands its result to `callback` on the worker thread.
    pub fn with_callback<F>(id: u64, command: Command, callback: F) -> Self
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        Self {
            id,
            command,
            cancelled: Arc::new(AtomicBool::new(false)),
            completion: Completion::Callback(Box::new(callback)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn complete(self, result: CommandResult) {
        match self.completion {
            // Receiver may be gone; the caller lost interest.
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(callback) => callback(result),
        }
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle to a submitted command's eventual result.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    receiver: mpsc::Receiver<CommandResult>,
    cancelled: Arc<AtomicBool>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Cancel this command if it has not been sent yet.
    ///
    /// A command already on the wire runs to completion and its result is
    /// still delivered.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Non-blocking poll. `None` while the command is pending.
    pub fn try_result(&self) -> Option<CommandResult> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(ApduError::Cancelled)),
        }
    }

    /// Block until the command completes.
    pub fn wait(self) -> CommandResult {
        ensure_blocking_allowed("PendingResponse::wait")?;
        self.receiver.recv().unwrap_or(Err(ApduError::Cancelled))
    }

    /// Block until the command completes or `timeout` elapses.
    ///
    /// On timeout the command stays queued; the handle can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> CommandResult {
        ensure_blocking_allowed("PendingResponse::wait_timeout")?;
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(ApduError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(ApduError::Cancelled),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    in_flight: Option<u64>,
    accepting: bool,
    shutdown: bool,
}

/// FIFO shared between submitters and the connection worker.
///
/// The worker is the only consumer, which is what keeps at most one entry in
/// flight.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start accepting entries for a newly opened connection.
    pub fn open(&self) {
        let mut state = self.lock();
        state.accepting = true;
        state.shutdown = false;
    }

    /// Append an entry. Hands it back if the queue is not accepting.
    pub fn push(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        let mut state = self.lock();
        if !state.accepting {
            return Err(entry);
        }
        debug!(id = entry.id, ins = %format!("{:02X}", entry.command.instruction()), "Command queued");
        state.entries.push_back(entry);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Block until an entry is available and mark it in flight.
    ///
    /// Returns `None` once the queue is shut down.
    pub fn next(&self) -> Option<QueueEntry> {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(entry) = state.entries.pop_front() {
                state.in_flight = Some(entry.id);
                return Some(entry);
            }
            state = match self.ready.wait(state) {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
        }
    }

    /// Free the in-flight slot.
    pub fn finish(&self, id: u64) {
        let mut state = self.lock();
        if state.in_flight == Some(id) {
            state.in_flight = None;
        }
    }

    /// Complete every not-yet-sent entry with `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().entries.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            entry.complete(Err(ApduError::Cancelled));
        }
        if count > 0 {
            debug!(count, "Cancelled queued commands");
        }
        count
    }

    /// Stop accepting and wake the worker. Queued entries stay until drained.
    pub fn halt(&self) {
        {
            let mut state = self.lock();
            state.accepting = false;
            state.shutdown = true;
        }
        self.ready.notify_all();
    }

    /// Stop accepting, wake the worker and cancel everything still queued.
    pub fn shutdown(&self) -> usize {
        self.halt();
        self.cancel_all()
    }

    /// Stop accepting new entries without waking the worker.
    pub fn close_intake(&self) {
        self.lock().accepting = false;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cmd(ins: u8) -> Command {
        Command::new(0x00, ins, 0x00, 0x00)
    }

    #[test]
    fn test_push_rejected_until_open() {
        let queue = CommandQueue::new();
        let (entry, _handle) = QueueEntry::with_handle(1, cmd(0x01));
        assert!(queue.push(entry).is_err());

        queue.open();
        let (entry, _handle) = QueueEntry::with_handle(2, cmd(0x02));
        assert!(queue.push(entry).is_ok());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_next_is_fifo_and_marks_in_flight() {
        let queue = CommandQueue::new();
        queue.open();
        for id in 1..=3 {
            let (entry, _h) = QueueEntry::with_handle(id, cmd(id as u8));
            queue.push(entry).unwrap();
        }
        let first = queue.next().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(queue.in_flight(), Some(1));
        queue.finish(1);
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.next().unwrap().id, 2);
    }

    #[test]
    fn test_cancel_all_completes_with_cancelled() {
        let queue = CommandQueue::new();
        queue.open();
        let mut handles = Vec::new();
        for id in 1..=4 {
            let (entry, h) = QueueEntry::with_handle(id, cmd(0x10));
            queue.push(entry).unwrap();
            handles.push(h);
        }
        assert_eq!(queue.cancel_all(), 4);
        assert!(queue.is_empty());
        for h in handles {
            assert!(matches!(h.try_result(), Some(Err(ApduError::Cancelled))));
        }
    }

    #[test]
    fn test_shutdown_wakes_and_rejects() {
        let queue = Arc::new(CommandQueue::new());
        queue.open();
        let q = queue.clone();
        let worker = std::thread::spawn(move || q.next().is_none());
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(worker.join().unwrap());

        let (entry, _h) = QueueEntry::with_handle(9, cmd(0x01));
        assert!(queue.push(entry).is_err());
    }

    #[test]
    fn test_callback_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let entry = QueueEntry::with_callback(1, cmd(0x01), move |result| {
            assert!(result.is_ok());
            h.fetch_add(1, Ordering::SeqCst);
        });
        entry.complete(Ok(Response::success(vec![])));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_cancel_sets_flag() {
        let (entry, handle) = QueueEntry::with_handle(1, cmd(0x01));
        assert!(!entry.is_cancelled());
        handle.cancel();
        assert!(entry.is_cancelled());
    }

    #[test]
    fn test_wait_timeout_keeps_handle() {
        let (entry, handle) = QueueEntry::with_handle(1, cmd(0x01));
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(5)),
            Err(ApduError::Timeout { .. })
        ));
        entry.complete(Ok(Response::success(vec![0x42])));
        assert_eq!(handle.wait().unwrap().payload(), &[0x42]);
    }
}
