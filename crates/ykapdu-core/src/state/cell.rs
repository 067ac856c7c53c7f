//! Shared connection state with ordered change notification.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::machine::{ConnectionState, Transition};
use crate::events::{ConnectionEvent, ObserverRegistry};

fn relock<T>(r: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    r.unwrap_or_else(|e| e.into_inner())
}

/// Current state plus the machinery to change it.
///
/// Transitions are serialized by `order`, and observers are called while it
/// is held, so notifications arrive in transition order. Observers must not
/// start, stop or block on the connection from inside a callback.
#[derive(Debug, Default)]
pub(crate) struct StateCell {
    order: Mutex<()>,
    current: AtomicU8,
    state: Mutex<ConnectionState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.current.load(Ordering::Acquire))
    }

    /// Apply `to` if legal from the current state.
    pub fn transition(
        &self,
        to: ConnectionState,
        observers: &ObserverRegistry,
    ) -> Option<Transition> {
        self.transition_with(|_| Some(to), observers)
    }

    /// Decide the next state from the current one and apply it atomically.
    ///
    /// `decide` returning `None` leaves the state untouched.
    pub fn transition_with<F>(&self, decide: F, observers: &ObserverRegistry) -> Option<Transition>
    where
        F: FnOnce(ConnectionState) -> Option<ConnectionState>,
    {
        let _order = relock(self.order.lock());
        let mut state = relock(self.state.lock());
        let from = *state;
        let to = decide(from)?;
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Rejected state transition");
            return None;
        }
        *state = to;
        self.current.store(to.as_u8(), Ordering::Release);
        debug!(from = %from, to = %to, "State transition");

        // Waiters wake only after every observer has seen the change.
        observers.notify(&ConnectionEvent::StateChanged { from, to });
        drop(state);
        self.changed.notify_all();
        Some(Transition { from, to })
    }

    /// Block until `pred` holds or the timeout expires. Returns the last seen state.
    pub fn wait_for<F>(&self, pred: F, timeout: Duration) -> Result<ConnectionState, ConnectionState>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = relock(self.state.lock());
        loop {
            if pred(*state) {
                return Ok(*state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(*state);
            }
            state = match self.changed.wait_timeout(state, deadline - now) {
                Ok((s, _)) => s,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transition_notifies_observers() {
        let cell = StateCell::new();
        let observers = ObserverRegistry::new();
        let (_id, rx) = observers.subscribe_channel();

        assert!(cell.transition(ConnectionState::Opening, &observers).is_some());
        assert!(cell.transition(ConnectionState::Open, &observers).is_some());
        assert_eq!(cell.get(), ConnectionState::Open);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            ConnectionEvent::StateChanged {
                from: ConnectionState::Opening,
                to: ConnectionState::Open
            }
        ));
    }

    #[test]
    fn test_illegal_transition_is_not_applied() {
        let cell = StateCell::new();
        let observers = ObserverRegistry::new();
        let (_id, rx) = observers.subscribe_channel();

        assert!(cell.transition(ConnectionState::Open, &observers).is_none());
        assert_eq!(cell.get(), ConnectionState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wait_for_wakes_on_change() {
        let cell = Arc::new(StateCell::new());
        let observers = Arc::new(ObserverRegistry::new());

        let c = cell.clone();
        let o = observers.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c.transition(ConnectionState::Opening, &o);
        });

        let seen = cell.wait_for(|s| s == ConnectionState::Opening, Duration::from_secs(5));
        assert_eq!(seen, Ok(ConnectionState::Opening));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let cell = StateCell::new();
        let seen = cell.wait_for(|s| s.is_open(), Duration::from_millis(10));
        assert_eq!(seen, Err(ConnectionState::Closed));
    }
}
