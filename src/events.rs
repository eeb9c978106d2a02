//! State machine diagnostic events.
//!
//! The walk engine emits an event around every attempted transition and
//! on every backward revert. Listeners receive them asynchronously but in
//! emission order: each connection owns a bounded queue drained by a
//! single background worker thread, so listener work never adds latency
//! to the negotiation thread and events never reorder relative to each
//! other.
//!
//! When the queue is full the event is dropped with a warning rather than
//! blocking negotiation; slow listeners lose diagnostics, not ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::fsm::descriptor::StateId;

/// One state machine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStateEvent {
    /// The walk is about to attempt entering a state.
    AboutToTransitionInto {
        /// Candidate state.
        state: StateId,
    },
    /// A state was entered and the position advanced.
    SuccessfullyTransitionedInto {
        /// Entered state.
        state: StateId,
        /// Negotiation detail, e.g. the mechanism used. May be empty.
        detail: String,
    },
    /// A candidate's precondition was not met.
    TransitionNotPossible {
        /// Candidate state.
        state: StateId,
        /// Why entry was impossible.
        reason: String,
    },
    /// A candidate was attempted and failed.
    TransitionFailed {
        /// Candidate state.
        state: StateId,
        /// Failure cause.
        cause: String,
    },
    /// A state was reset while the walk unwound backward.
    StateRevertBackwardsWalk {
        /// Reverted state.
        state: StateId,
    },
    /// The walk reached its requested final state.
    FinalStateReached {
        /// The final state.
        state: StateId,
    },
}

impl ConnectionStateEvent {
    /// The state this event concerns.
    pub fn state(&self) -> StateId {
        match self {
            Self::AboutToTransitionInto { state }
            | Self::SuccessfullyTransitionedInto { state, .. }
            | Self::TransitionNotPossible { state, .. }
            | Self::TransitionFailed { state, .. }
            | Self::StateRevertBackwardsWalk { state }
            | Self::FinalStateReached { state } => *state,
        }
    }
}

/// A [`ConnectionStateEvent`] stamped with its connection and time.
#[derive(Debug, Clone)]
pub struct StampedEvent {
    /// Connection the event belongs to.
    pub connection: Uuid,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The event itself.
    pub event: ConnectionStateEvent,
}

/// Receiver of state machine events.
///
/// Callbacks run on the connection's event worker thread and must not
/// panic; keep them quick to avoid filling the bounded queue.
pub trait ConnectionStateListener: Send {
    /// Called for every event, in emission order.
    fn on_event(&self, event: &StampedEvent);
}

impl<F> ConnectionStateListener for F
where
    F: Fn(&StampedEvent) + Send,
{
    fn on_event(&self, event: &StampedEvent) {
        self(event);
    }
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerList = Arc<Mutex<Vec<(ListenerId, Box<dyn ConnectionStateListener>)>>>;

enum Control {
    Event(StampedEvent),
    Flush(SyncSender<()>),
}

/// Per-connection ordered asynchronous event dispatcher.
pub(crate) struct EventDispatcher {
    tx: Option<SyncSender<Control>>,
    listeners: ListenerList,
    next_listener_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub(crate) fn new(connection: Uuid, queue_capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Control>(queue_capacity.max(1));
        let listeners: ListenerList = Arc::new(Mutex::new(Vec::new()));
        let worker_listeners = Arc::clone(&listeners);

        let worker = std::thread::Builder::new()
            .name(format!("c2s-events-{connection}"))
            .spawn(move || {
                while let Ok(control) = rx.recv() {
                    match control {
                        Control::Event(event) => {
                            let guard = worker_listeners
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner);
                            for (_, listener) in guard.iter() {
                                listener.on_event(&event);
                            }
                        }
                        Control::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            listeners,
            next_listener_id: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    pub(crate) fn add_listener(&self, listener: Box<dyn ConnectionStateListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut guard = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|(listener_id, _)| *listener_id != id);
        guard.len() != before
    }

    pub(crate) fn emit(&self, event: StampedEvent) {
        // No listeners, no queue traffic.
        if self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            return;
        }

        let Some(tx) = &self.tx else { return };
        match tx.try_send(Control::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("diagnostic event queue full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Block until every event emitted before this call was delivered.
    pub(crate) fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if tx.send(Control::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(event: ConnectionStateEvent) -> StampedEvent {
        StampedEvent {
            connection: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }

    #[test]
    fn test_events_delivered_in_order() {
        let dispatcher = EventDispatcher::new(Uuid::new_v4(), 512).unwrap();
        let seen: Arc<Mutex<Vec<StateId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.add_listener(Box::new(move |event: &StampedEvent| {
            sink.lock().unwrap().push(event.event.state());
        }));

        for _ in 0..100 {
            dispatcher.emit(stamped(ConnectionStateEvent::AboutToTransitionInto {
                state: StateId::SaslAuthentication,
            }));
            dispatcher.emit(stamped(ConnectionStateEvent::SuccessfullyTransitionedInto {
                state: StateId::ResourceBinding,
                detail: String::new(),
            }));
        }
        dispatcher.flush();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        for pair in seen.chunks(2) {
            assert_eq!(pair, [StateId::SaslAuthentication, StateId::ResourceBinding]);
        }
    }

    #[test]
    fn test_remove_listener() {
        let dispatcher = EventDispatcher::new(Uuid::new_v4(), 16).unwrap();
        let seen: Arc<Mutex<Vec<StateId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = dispatcher.add_listener(Box::new(move |event: &StampedEvent| {
            sink.lock().unwrap().push(event.event.state());
        }));

        dispatcher.emit(stamped(ConnectionStateEvent::FinalStateReached {
            state: StateId::Disconnected,
        }));
        dispatcher.flush();
        assert!(dispatcher.remove_listener(id));
        assert!(!dispatcher.remove_listener(id));

        dispatcher.emit(stamped(ConnectionStateEvent::FinalStateReached {
            state: StateId::Disconnected,
        }));
        dispatcher.flush();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_emit_without_listeners_is_cheap_noop() {
        let dispatcher = EventDispatcher::new(Uuid::new_v4(), 1).unwrap();
        // Queue capacity one, but nothing is enqueued without listeners.
        for _ in 0..50 {
            dispatcher.emit(stamped(ConnectionStateEvent::FinalStateReached {
                state: StateId::Disconnected,
            }));
        }
        dispatcher.flush();
    }
}
