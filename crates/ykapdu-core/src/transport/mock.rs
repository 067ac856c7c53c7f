//! Mock key transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::traits::{
    ConnectionDescription, KeyTransport, TransportConnector, TransportError, TransportKind,
};

/// Time a simulated exchange spends outside the state lock.
const EXCHANGE_TIME: Duration = Duration::from_micros(200);

/// Scripted reply for the next `send`.
#[derive(Debug, Clone)]
enum MockReply {
    Frame(Vec<u8>),
    Fail,
}

#[derive(Debug)]
struct MockState {
    /// Queued replies returned in order.
    replies: VecDeque<MockReply>,
    /// Captured frames.
    write_log: Vec<Vec<u8>>,
    /// Whether the key is "attached".
    connected: bool,
    /// Echo each frame back with 9000 when no reply is queued.
    loopback: bool,
    fail_open: bool,
    /// Park every `send` until released.
    hold: bool,
    /// Park every `open` until released.
    hold_open: bool,
    parked: usize,
    in_flight: usize,
    max_in_flight: usize,
    open_count: usize,
    close_count: usize,
    description: ConnectionDescription,
}

/// Mock transport. Clones share state, so a test keeps one handle while the
/// connection owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new((
                Mutex::new(MockState {
                    replies: VecDeque::new(),
                    write_log: Vec::new(),
                    connected: true,
                    loopback: false,
                    fail_open: false,
                    hold: false,
                    hold_open: false,
                    parked: 0,
                    in_flight: 0,
                    max_in_flight: 0,
                    open_count: 0,
                    close_count: 0,
                    description: ConnectionDescription::new(TransportKind::Usb, "Mock YubiKey"),
                }),
                Condvar::new(),
            )),
        }
    }

    /// Transport that echoes every frame back followed by `90 00`.
    pub fn loopback() -> Self {
        let mock = Self::new();
        mock.lock().loopback = true;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others.
        self.shared.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.shared.1.notify_all();
    }

    /// Block while `held` says so and the key stays attached.
    fn park<'a>(
        &'a self,
        mut state: MutexGuard<'a, MockState>,
        held: fn(&MockState) -> bool,
    ) -> MutexGuard<'a, MockState> {
        if !held(&state) {
            return state;
        }
        state.parked += 1;
        self.notify();
        while held(&state) && state.connected {
            state = match self.shared.1.wait(state) {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
        }
        state.parked -= 1;
        state
    }

    /// Queue a raw response frame.
    pub fn queue_response(&self, frame: &[u8]) {
        self.lock().replies.push_back(MockReply::Frame(frame.to_vec()));
    }

    /// Queue a response built from payload and status word.
    pub fn queue_status(&self, payload: &[u8], sw: u16) {
        let mut frame = payload.to_vec();
        frame.extend_from_slice(&sw.to_be_bytes());
        self.queue_response(&frame);
    }

    /// Queue an I/O failure.
    pub fn queue_failure(&self) {
        self.lock().replies.push_back(MockReply::Fail);
    }

    /// Make the next handshake fail.
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_description(&self, description: ConnectionDescription) {
        self.lock().description = description;
    }

    /// Park every subsequent `send` until [`release`](Self::release).
    pub fn hold(&self) {
        self.lock().hold = true;
    }

    /// Park every subsequent handshake until [`release`](Self::release).
    pub fn hold_handshake(&self) {
        self.lock().hold_open = true;
    }

    pub fn release(&self) {
        let mut state = self.lock();
        state.hold = false;
        state.hold_open = false;
        drop(state);
        self.notify();
    }

    /// Wait until a `send` or handshake is parked.
    pub fn wait_until_parked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.parked == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.1.wait_timeout(state, deadline - now) {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Get all captured frames.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.lock().write_log.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().write_log.clear();
    }

    /// Highest number of concurrent `send` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// Simulate key removal. Parked sends fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.lock().connected = false;
        self.notify();
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyTransport for MockTransport {
    fn open(&mut self) -> Result<ConnectionDescription, TransportError> {
        let mut state = self.park(self.lock(), |s| s.hold_open);
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.fail_open {
            return Err(TransportError::OpenFailed("scripted handshake failure".into()));
        }
        state.open_count += 1;
        Ok(state.description.clone())
    }

    fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        state.write_log.push(frame.to_vec());

        // Let overlapping callers show up in `max_in_flight`.
        drop(state);
        thread::sleep(EXCHANGE_TIME);
        let mut state = self.park(self.lock(), |s| s.hold);

        let result = if !state.connected {
            Err(TransportError::Disconnected)
        } else {
            match state.replies.pop_front() {
                Some(MockReply::Frame(bytes)) => Ok(bytes),
                Some(MockReply::Fail) => Err(TransportError::ReadFailed("scripted failure".into())),
                None if state.loopback => {
                    let mut echo = frame.to_vec();
                    echo.extend_from_slice(&[0x90, 0x00]);
                    Ok(echo)
                }
                None => Err(TransportError::Timeout { timeout_ms: 5000 }),
            }
        };
        state.in_flight -= 1;
        result
    }

    fn close(&mut self) {
        self.lock().close_count += 1;
    }

    fn kind(&self) -> TransportKind {
        self.lock().description.kind
    }
}

/// Connector handing out clones of one [`MockTransport`].
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    transport: MockTransport,
}

impl MockConnector {
    pub fn new(transport: MockTransport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }
}

impl TransportConnector for MockConnector {
    fn connect(&self) -> Result<Box<dyn KeyTransport>, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::DeviceNotFound { vid: 0x1050 });
        }
        Ok(Box::new(self.transport.clone()))
    }

    fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_reply_queue() {
        let mut mock = MockTransport::new();
        mock.queue_status(&[0x01], 0x9000);
        mock.queue_status(&[], 0x6A82);

        assert_eq!(mock.send(&[0x00, 0xA4, 0x04, 0x00]).unwrap(), vec![0x01, 0x90, 0x00]);
        assert_eq!(mock.send(&[0x00, 0xA4, 0x04, 0x00]).unwrap(), vec![0x6A, 0x82]);

        // Queue is empty now
        assert!(mock.send(&[0x00]).is_err());
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockTransport::loopback();
        mock.send(b"Hello").unwrap();
        mock.send(b"World").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
    }

    #[test]
    fn test_mock_loopback_echo() {
        let mut mock = MockTransport::loopback();
        assert_eq!(mock.send(&[1, 2, 3]).unwrap(), vec![1, 2, 3, 0x90, 0x00]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::loopback();
        assert!(mock.is_connected());

        mock.disconnect();
        assert!(!mock.is_connected());
        assert!(mock.send(b"test").is_err());
        assert!(mock.open().is_err());
    }

    #[test]
    fn test_overlapping_sends_are_counted() {
        let mock = MockTransport::loopback();
        let senders: Vec<_> = (0..8)
            .map(|_| {
                let mut mock = mock.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        mock.send(&[0x00, 0x01]).unwrap();
                    }
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }
        assert_eq!(mock.get_writes().len(), 800);
        assert!(mock.max_in_flight() > 1);
    }

    #[test]
    fn test_held_handshake_waits_for_release() {
        let mock = MockTransport::new();
        mock.hold_handshake();
        let mut opener = mock.clone();
        let handshake = thread::spawn(move || opener.open());

        assert!(mock.wait_until_parked(Duration::from_secs(5)));
        assert_eq!(mock.open_count(), 0);
        mock.release();
        assert!(handshake.join().unwrap().is_ok());
        assert_eq!(mock.open_count(), 1);
    }

    #[test]
    fn test_connector_requires_attached_key() {
        let mock = MockTransport::new();
        let connector = MockConnector::new(mock.clone());
        assert!(connector.connect().is_ok());
        mock.disconnect();
        assert!(matches!(
            connector.connect(),
            Err(TransportError::DeviceNotFound { .. })
        ));
    }
}
