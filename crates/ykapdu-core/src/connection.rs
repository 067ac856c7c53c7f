//! Connection lifecycle and the worker thread that owns the transport.
//!
//! A [`Connection`] moves through `Closed -> Opening -> Open -> Closing ->
//! Closed`. Each start spawns one worker thread that performs the handshake,
//! serves the command queue and tears the transport down again. Everything
//! else talks to the worker through the queue and the shared state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, instrument, warn};

use crate::apdu::{ApduCodec, Command, INS_SELECT, P1_SELECT_BY_AID};
use crate::application::Application;
use crate::blocking::ensure_blocking_allowed;
use crate::config::ConnectionConfig;
use crate::dispatch::{
    CommandQueue, CommandResult, DispatchExit, Dispatcher, PendingResponse, QueueEntry,
};
use crate::error::{ApduError, Result};
use crate::events::{
    ConnectionEvent, ConnectionObserver, ObserverRegistry, SubscriptionId, TracingObserver,
};
use crate::session::Session;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{
    ConnectionDescription, KeyTransport, TransportConnector, TransportError, TransportKind,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Application currently selected on the key.
#[derive(Debug, Default)]
pub(crate) struct Selection {
    pub aid: Option<Vec<u8>>,
    /// Bumped whenever a different application gets selected.
    pub generation: u64,
}

/// State shared between the handle, its sessions and the worker.
pub(crate) struct Inner {
    kind: TransportKind,
    connector: Box<dyn TransportConnector>,
    config: ConnectionConfig,
    state: StateCell,
    observers: ObserverRegistry,
    /// Replaced on every start so a stale worker never consumes new entries.
    queue: Mutex<Arc<CommandQueue>>,
    description: Mutex<Option<(u64, ConnectionDescription)>>,
    selection: Mutex<Selection>,
    /// Incremented on every `Closed -> Opening`.
    epoch: AtomicU64,
    /// Set while a worker holds a transport, from connect until close.
    transport_busy: Mutex<bool>,
    transport_idle: Condvar,
    key_connected: AtomicBool,
    auto_start: AtomicBool,
    next_id: AtomicU64,
    open_failures: AtomicU64,
    last_open_error: Mutex<Option<String>>,
}

impl Inner {
    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn selection(&self) -> MutexGuard<'_, Selection> {
        lock(&self.selection)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    fn current_queue(&self) -> Arc<CommandQueue> {
        lock(&self.queue).clone()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn not_ready(&self) -> ApduError {
        ApduError::ConnectionNotReady {
            state: self.state.get(),
        }
    }

    pub(crate) fn submit(&self, command: Command) -> Result<PendingResponse> {
        if !self.state.get().is_open() {
            return Err(self.not_ready());
        }
        let (entry, handle) = QueueEntry::with_handle(self.next_id(), command);
        self.current_queue()
            .push(entry)
            .map_err(|_| self.not_ready())?;
        Ok(handle)
    }

    fn submit_with<F>(&self, command: Command, callback: F) -> Result<u64>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        if !self.state.get().is_open() {
            return Err(self.not_ready());
        }
        let id = self.next_id();
        let entry = QueueEntry::with_callback(id, command, callback);
        self.current_queue()
            .push(entry)
            .map_err(|_| self.not_ready())?;
        Ok(id)
    }

    /// Wait for Open, submit and wait for the result, all within `timeout`.
    pub(crate) fn execute_blocking(&self, command: Command, timeout: Duration) -> CommandResult {
        ensure_blocking_allowed("execute_blocking")?;
        let deadline = Instant::now() + timeout;
        if let Err(state) = self.state.wait_for(|s| s.is_open(), timeout) {
            return Err(ApduError::ConnectionNotReady { state });
        }

        let handle = self.submit(command)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match handle.wait_timeout(remaining) {
            Err(ApduError::Timeout { .. }) => {
                handle.cancel();
                Err(ApduError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            other => other,
        }
    }

    /// Returns whether this call moved the connection to Opening.
    fn start(self: &Arc<Self>) -> bool {
        let queue = Arc::new(CommandQueue::new());
        let mut epoch = 0;
        let started = self.state.transition_with(
            |s| {
                if s != ConnectionState::Closed {
                    return None;
                }
                epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                *lock(&self.queue) = queue.clone();
                Some(ConnectionState::Opening)
            },
            &self.observers,
        );
        if started.is_none() {
            debug!(state = %self.state.get(), "Start ignored");
            return false;
        }

        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("ykapdu-{}", self.kind).to_lowercase())
            .spawn(move || run_worker(inner, epoch, queue));
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn connection worker");
            self.fail_open(epoch, e.to_string());
            return true;
        }
        self.watch_handshake(epoch);
        true
    }

    /// Fail the start if `epoch` is still Opening once `start_timeout_ms` passes.
    fn watch_handshake(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        let timeout = self.config.start_timeout();
        let spawned = thread::Builder::new()
            .name(format!("ykapdu-{}-watchdog", self.kind).to_lowercase())
            .spawn(move || {
                let settled = inner
                    .state
                    .wait_for(|s| s != ConnectionState::Opening, timeout);
                if settled.is_err()
                    && inner.fail_open(epoch, format!("handshake timed out after {:?}", timeout))
                {
                    warn!(epoch, timeout_ms = timeout.as_millis() as u64, "Handshake timed out");
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Handshake runs without a watchdog");
        }
    }

    /// Wait until no earlier worker holds a transport, or until `deadline`.
    fn acquire_transport(&self, deadline: Instant) -> Option<TransportLease<'_>> {
        let mut busy = lock(&self.transport_busy);
        while *busy {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            busy = self
                .transport_idle
                .wait_timeout(busy, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        *busy = true;
        Some(TransportLease { inner: self })
    }

    fn stop(&self) {
        let stopped = self.state.transition_with(
            |s| match s {
                ConnectionState::Open => {
                    self.current_queue().halt();
                    Some(ConnectionState::Closing)
                }
                // The worker drops the transport once its handshake returns.
                ConnectionState::Opening => Some(ConnectionState::Closed),
                _ => None,
            },
            &self.observers,
        );
        match stopped {
            Some(t) if t.from == ConnectionState::Open => {
                let cancelled = self.current_queue().cancel_all();
                debug!(cancelled, "Stopping connection");
            }
            Some(_) => debug!("Start abandoned"),
            None => {}
        }
    }

    /// Close the start of `epoch` as failed. Returns whether it was still Opening.
    fn fail_open(&self, epoch: u64, reason: String) -> bool {
        self.state
            .transition_with(
                |s| {
                    if s != ConnectionState::Opening || self.epoch() != epoch {
                        return None;
                    }
                    *lock(&self.last_open_error) = Some(reason);
                    self.open_failures.fetch_add(1, Ordering::SeqCst);
                    Some(ConnectionState::Closed)
                },
                &self.observers,
            )
            .is_some()
    }

    /// Begin closing `epoch` after its transport failed.
    fn close_after_loss(&self, epoch: u64, queue: &CommandQueue, reason: &TransportError) {
        let closing = self.state.transition_with(
            |s| {
                if s != ConnectionState::Open || self.epoch() != epoch {
                    return None;
                }
                queue.halt();
                Some(ConnectionState::Closing)
            },
            &self.observers,
        );
        if closing.is_some() {
            warn!(reason = %reason, "Closing after transport loss");
        }
    }

    fn open_error(&self) -> ApduError {
        let reason = lock(&self.last_open_error)
            .clone()
            .unwrap_or_else(|| "handshake failed".to_string());
        ApduError::Transport(TransportError::OpenFailed(reason))
    }

    fn handshake(&self) -> std::result::Result<(Box<dyn KeyTransport>, ConnectionDescription), TransportError> {
        let mut transport = self.connector.connect()?;
        let description = transport.open()?;
        Ok((transport, description))
    }

    fn clear_description(&self, epoch: Option<u64>) {
        let mut description = lock(&self.description);
        if epoch.is_none() || description.as_ref().map(|(e, _)| *e) == epoch {
            *description = None;
        }
    }

    /// Remember which application a successful SELECT left active.
    fn track_selection(&self, epoch: u64, command: &Command, result: &CommandResult) {
        if command.instruction() != INS_SELECT || command.p1() != P1_SELECT_BY_AID {
            return;
        }
        let Ok(response) = result else { return };
        if !response.is_success() || self.epoch() != epoch {
            return;
        }
        let mut selection = self.selection();
        if selection.aid.as_deref() != Some(command.data()) {
            selection.generation += 1;
            selection.aid = Some(command.data().to_vec());
            debug!(aid = %hex::encode_upper(command.data()), "Application selected");
        }
    }
}

/// Marks the connection's transport as taken; released on drop.
struct TransportLease<'a> {
    inner: &'a Inner,
}

impl Drop for TransportLease<'_> {
    fn drop(&mut self) {
        *lock(&self.inner.transport_busy) = false;
        self.inner.transport_idle.notify_all();
    }
}

fn run_worker(inner: Arc<Inner>, epoch: u64, queue: Arc<CommandQueue>) {
    let span = info_span!("connection", kind = %inner.kind, epoch);
    let _enter = span.enter();

    // A detached worker may still be inside a transport call.
    let deadline = Instant::now() + inner.config.start_timeout();
    let Some(_lease) = inner.acquire_transport(deadline) else {
        warn!("Previous transport still in use");
        inner.fail_open(epoch, "previous transport still in use".to_string());
        return;
    };
    if inner.epoch() != epoch || inner.state() != ConnectionState::Opening {
        debug!("Start abandoned before handshake");
        return;
    }

    let (mut transport, description) = match inner.handshake() {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Handshake failed");
            inner.fail_open(epoch, e.to_string());
            return;
        }
    };

    let extended = inner
        .config
        .extended_apdu
        .unwrap_or(description.extended_apdu);
    let opened = inner.state.transition_with(
        |s| {
            if s != ConnectionState::Opening || inner.epoch() != epoch {
                return None;
            }
            *lock(&inner.description) = Some((epoch, description.clone()));
            inner.selection().aid = None;
            queue.open();
            Some(ConnectionState::Open)
        },
        &inner.observers,
    );
    if opened.is_none() {
        debug!("Connection abandoned during handshake");
        transport.close();
        return;
    }

    inner.key_connected.store(true, Ordering::SeqCst);
    info!(
        name = %description.name,
        serial = ?description.serial,
        firmware = ?description.firmware_version,
        extended,
        "Connection open"
    );

    let exit = Dispatcher::new(
        transport.as_mut(),
        ApduCodec::new(extended),
        &inner.observers,
        inner.config.max_get_response_rounds,
    )
    .run(&queue, |command, result| {
        inner.track_selection(epoch, command, result);
        // Callers see the failure only once the connection is Closing.
        if let Err(ApduError::Transport(e)) = result {
            inner.close_after_loss(epoch, &queue, e);
        }
    });

    if let DispatchExit::TransportLost(reason) = exit {
        let cancelled = queue.shutdown();
        debug!(reason = %reason, cancelled, "Dispatcher stopped");
    }

    transport.close();
    inner.clear_description(Some(epoch));
    inner.state.transition_with(
        |s| (s == ConnectionState::Closing && inner.epoch() == epoch).then_some(ConnectionState::Closed),
        &inner.observers,
    );
    debug!("Worker finished");
}

/// A logical link to one key over one transport kind.
///
/// Dropping the handle stops the connection.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection that logs its events via tracing.
    pub fn new<C>(connector: C, config: ConnectionConfig) -> Self
    where
        C: TransportConnector + 'static,
    {
        Self::with_observer(connector, config, Arc::new(TracingObserver))
    }

    /// Create a connection with a custom first observer.
    pub fn with_observer<C>(
        connector: C,
        config: ConnectionConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self
    where
        C: TransportConnector + 'static,
    {
        let observers = ObserverRegistry::new();
        observers.subscribe(observer);
        let auto_start = config.auto_start;
        Self {
            inner: Arc::new(Inner {
                kind: connector.kind(),
                connector: Box::new(connector),
                config,
                state: StateCell::new(),
                observers,
                queue: Mutex::new(Arc::new(CommandQueue::new())),
                description: Mutex::new(None),
                selection: Mutex::new(Selection::default()),
                epoch: AtomicU64::new(0),
                transport_busy: Mutex::new(false),
                transport_idle: Condvar::new(),
                key_connected: AtomicBool::new(false),
                auto_start: AtomicBool::new(auto_start),
                next_id: AtomicU64::new(0),
                open_failures: AtomicU64::new(0),
                last_open_error: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// Key metadata; `None` unless Open.
    pub fn description(&self) -> Option<ConnectionDescription> {
        if !self.state().is_open() {
            return None;
        }
        lock(&self.inner.description).as_ref().map(|(_, d)| d.clone())
    }

    pub fn is_key_connected(&self) -> bool {
        self.inner.key_connected.load(Ordering::SeqCst)
    }

    pub fn set_auto_start(&self, enabled: bool) {
        self.inner.auto_start.store(enabled, Ordering::SeqCst);
    }

    pub fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) -> SubscriptionId {
        self.inner.observers.subscribe(observer)
    }

    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::Receiver<ConnectionEvent>) {
        self.inner.observers.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    /// Begin opening. No-op unless Closed; returns whether it started.
    #[instrument(skip(self), fields(kind = %self.inner.kind))]
    pub fn start(&self) -> bool {
        self.inner.start()
    }

    /// Start and wait until Open, the handshake fails or `timeout` elapses.
    pub fn start_blocking(&self, timeout: Duration) -> Result<()> {
        ensure_blocking_allowed("Connection::start_blocking")?;
        let deadline = Instant::now() + timeout;
        let failures = self.inner.open_failures.load(Ordering::SeqCst);
        loop {
            let initiated = self.start();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inner.state.wait_for(|s| !s.is_transitional(), remaining) {
                Ok(ConnectionState::Open) => return Ok(()),
                Ok(_) if self.inner.open_failures.load(Ordering::SeqCst) != failures => {
                    return Err(self.inner.open_error());
                }
                Ok(state) if initiated => return Err(ApduError::ConnectionNotReady { state }),
                // Someone else's transition ended in Closed; try our own.
                Ok(_) => continue,
                Err(_) => {
                    return Err(ApduError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Begin closing. Queued commands complete with `Cancelled`; the one in
    /// flight finishes first. A stop while Opening returns to Closed at once.
    #[instrument(skip(self), fields(kind = %self.inner.kind))]
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn stop_blocking(&self, timeout: Duration) -> Result<()> {
        ensure_blocking_allowed("Connection::stop_blocking")?;
        self.stop();
        self.inner
            .state
            .wait_for(|s| s == ConnectionState::Closed, timeout)
            .map(|_| ())
            .map_err(|_| ApduError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }

    /// Queue a command. Fails immediately unless Open.
    pub fn submit(&self, command: Command) -> Result<PendingResponse> {
        self.inner.submit(command)
    }

    /// Queue a command whose result goes to `callback` on the worker thread.
    pub fn submit_with<F>(&self, command: Command, callback: F) -> Result<u64>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        self.inner.submit_with(command, callback)
    }

    /// Submit and wait, bounded by `command_timeout_ms`. Waits for Open first.
    pub fn execute_blocking(&self, command: Command) -> CommandResult {
        self.inner
            .execute_blocking(command, self.inner.config.command_timeout())
    }

    /// Cancel every queued command that has not been sent yet.
    pub fn cancel_all(&self) -> usize {
        self.inner.current_queue().cancel_all()
    }

    /// SELECT `aid` and bind a session to it.
    ///
    /// A non-success status fails with [`ApduError::Status`] and leaves the
    /// current selection alone.
    #[instrument(skip(self, aid), fields(aid = %hex::encode_upper(aid)))]
    pub fn select_application(&self, aid: &[u8]) -> Result<Session> {
        let response = self
            .inner
            .execute_blocking(Command::select(aid), self.inner.config.command_timeout())?
            .into_result()?;
        debug!(len = response.payload().len(), "SELECT accepted");
        Session::bind(Arc::clone(&self.inner), aid)
    }

    pub fn select(&self, application: &Application) -> Result<Session> {
        self.select_application(application.aid())
    }

    /// Report a physical attach. Starts the connection when auto-start is on.
    pub fn key_attached(&self) {
        self.inner.key_connected.store(true, Ordering::SeqCst);
        self.inner
            .observers
            .notify(&ConnectionEvent::KeyAttached {
                kind: self.inner.kind,
            });
        if self.inner.auto_start.load(Ordering::SeqCst) {
            self.start();
        }
    }

    /// Report a physical detach. Drops straight to Closed; a later start waits
    /// until the old worker has let go of its transport.
    pub fn key_detached(&self) {
        self.inner.key_connected.store(false, Ordering::SeqCst);
        self.inner
            .observers
            .notify(&ConnectionEvent::KeyDetached {
                kind: self.inner.kind,
            });
        let inner = &self.inner;
        let closed = inner.state.transition_with(
            |s| {
                if s == ConnectionState::Closed {
                    return None;
                }
                inner.current_queue().halt();
                Some(ConnectionState::Closed)
            },
            &inner.observers,
        );
        if closed.is_some() {
            inner.current_queue().cancel_all();
            inner.clear_description(None);
            inner.selection().aid = None;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.inner.kind)
            .field("state", &self.inner.state.get())
            .finish()
    }
}
