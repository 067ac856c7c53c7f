//! Event system for observing connections.
//!
//! Callers subscribe with a callback or a channel and get every state change
//! in transition order, plus key attach/detach and frame traffic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::state::ConnectionState;
use crate::transport::TransportKind;

/// Bytes of each frame copied into packet events.
const PACKET_PREVIEW_LEN: usize = 32;

/// Events emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Key physically attached.
    KeyAttached { kind: TransportKind },
    /// Key physically removed.
    KeyDetached { kind: TransportKind },
    /// APDU frame sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
}

impl ConnectionEvent {
    pub(crate) fn packet(direction: PacketDirection, frame: &[u8]) -> Self {
        ConnectionEvent::Packet {
            direction,
            length: frame.len(),
            data: Some(frame.iter().take(PACKET_PREVIEW_LEN).copied().collect()),
        }
    }
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Key
    Rx, // Key -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving connection events.
pub trait ConnectionObserver: Send + Sync {
    /// Called synchronously on the thread that caused the event. Must not
    /// start, stop or block on the connection.
    fn on_event(&self, event: &ConnectionEvent);
}

impl<F> ConnectionObserver for F
where
    F: Fn(&ConnectionEvent) + Send + Sync,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ConnectionObserver for NullObserver {
    fn on_event(&self, _event: &ConnectionEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Connection state changed");
            }
            ConnectionEvent::KeyAttached { kind } => {
                tracing::info!(kind = %kind, "Key attached");
            }
            ConnectionEvent::KeyDetached { kind } => {
                tracing::warn!(kind = %kind, "Key detached");
            }
            ConnectionEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "APDU frame");
            }
        }
    }
}

/// Forwards events into an mpsc channel. Send errors are ignored.
pub struct ChannelObserver {
    sender: mpsc::Sender<ConnectionEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::Sender<ConnectionEvent>) -> Self {
        Self { sender }
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_event(&self, event: &ConnectionEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Set of independent subscribers.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn ConnectionObserver>)>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ConnectionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, observer));
        id
    }

    /// Subscribe a fresh channel and return its receiving end.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel();
        (self.subscribe(Arc::new(ChannelObserver::new(tx))), rx)
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every subscriber, in subscription order.
    pub fn notify(&self, event: &ConnectionEvent) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let snapshot: Vec<_> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in snapshot {
            observer.on_event(event);
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_multiple_subscribers_receive_events() {
        let registry = ObserverRegistry::new();
        let (_a, rx_a) = registry.subscribe_channel();
        let (_b, rx_b) = registry.subscribe_channel();

        registry.notify(&ConnectionEvent::KeyAttached {
            kind: TransportKind::Nfc,
        });

        assert_eq!(rx_a.try_iter().count(), 1);
        assert_eq!(rx_b.try_iter().count(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = ObserverRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = registry.subscribe(Arc::new(move |_: &ConnectionEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let event = ConnectionEvent::KeyDetached {
            kind: TransportKind::Usb,
        };
        registry.notify(&event);
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.notify(&event);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_packet_preview_is_truncated() {
        let frame = vec![0xAA; 100];
        match ConnectionEvent::packet(PacketDirection::Tx, &frame) {
            ConnectionEvent::Packet { length, data, .. } => {
                assert_eq!(length, 100);
                assert_eq!(data.unwrap().len(), PACKET_PREVIEW_LEN);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
