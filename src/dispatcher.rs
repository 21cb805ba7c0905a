//! Serialized fan-out of [`ConnectionEvent`]s to subscribers.
//!
//! Producers (the driver task, `stop`, state transitions) only push onto a
//! FIFO queue. Whichever producer finds the queue idle becomes the drainer and
//! delivers events one at a time until the queue is empty; producers that
//! arrive meanwhile return immediately and their events are picked up by the
//! active drainer. This gives a single delivery sequence per connection
//! without a dedicated task: no subscriber ever sees two events concurrently,
//! and events arrive in the order they were enqueued. A handler that emits
//! from inside a callback has its event queued behind the current one instead
//! of being dispatched re-entrantly.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::error::ConnectionError;
use crate::event::{ConnectionEvent, EventKind};

/// Error type subscribers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every subscriber callback.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&ConnectionEvent) -> HandlerResult + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Handler,
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<ConnectionEvent>,
    delivering: bool,
}

/// Subscriber registry plus the delivery sequencer.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
    queue: Mutex<Queue>,
    next_id: AtomicU64,
    idle: Notify,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`, or for every event if `None`.
    pub fn subscribe<F>(&self, kind: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_subscribers().push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    ///
    /// An event that is being delivered while this runs may still reach the
    /// handler once.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock_subscribers();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Subscribe an unbounded channel to every event.
    ///
    /// Events sent after the receiver is dropped are discarded.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(None, move |event| {
            if tx.send(event.clone()).is_err() {
                debug!("event receiver dropped, discarding event");
            }
            Ok(())
        });
        rx
    }

    /// Queue an event without delivering it.
    ///
    /// Used while holding other locks; the caller must follow up with
    /// [`drain`](Self::drain) once they are released.
    pub(crate) fn enqueue(&self, event: ConnectionEvent) {
        self.lock_queue().pending.push_back(event);
    }

    /// Queue several events back to back.
    ///
    /// They are pushed under one queue lock, so an event raised by a handler
    /// on another thread cannot land between them.
    pub(crate) fn enqueue_all(&self, events: impl IntoIterator<Item = ConnectionEvent>) {
        self.lock_queue().pending.extend(events);
    }

    /// Queue an event and deliver everything pending.
    pub fn emit(&self, event: ConnectionEvent) {
        self.enqueue(event);
        self.drain();
    }

    /// Deliver pending events unless another caller is already doing so.
    pub(crate) fn drain(&self) {
        {
            let mut queue = self.lock_queue();
            if queue.delivering {
                return;
            }
            queue.delivering = true;
        }

        loop {
            let event = {
                let mut queue = self.lock_queue();
                match queue.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.delivering = false;
                        drop(queue);
                        self.idle.notify_waiters();
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    /// Wait until every event queued so far has been delivered.
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let stalled = {
                let queue = self.lock_queue();
                if !queue.delivering && queue.pending.is_empty() {
                    return;
                }
                !queue.delivering
            };
            if stalled {
                self.drain();
                continue;
            }
            notified.await;
        }
    }

    fn deliver(&self, event: &ConnectionEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .lock_subscribers()
            .iter()
            .filter(|s| s.kind.is_none_or(|k| k == kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("handler panicked: {}", panic_message(&*payload)),
            };

            if kind == EventKind::Error {
                // Re-routing would loop.
                error!(error = %failure, "error handler failed");
            } else {
                warn!(?kind, error = %failure, "event handler failed");
                self.enqueue(ConnectionEvent::error(ConnectionError::Handler(failure)));
            }
        }
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.lock_subscribers().len())
            .field("pending", &self.lock_queue().pending.len())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    fn received(text: &str) -> ConnectionEvent {
        ConnectionEvent::Received(text.to_string())
    }

    fn recorder(dispatcher: &EventDispatcher, kind: Option<EventKind>) -> Arc<StdMutex<Vec<String>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe(kind, move |event| {
            let label = match event {
                ConnectionEvent::Received(text) => format!("received:{text}"),
                ConnectionEvent::Error(e) => format!("error:{e}"),
                other => format!("{:?}", other.kind()),
            };
            sink.lock().unwrap().push(label);
            Ok(())
        });
        seen
    }

    #[test]
    fn delivers_in_order_to_matching_subscribers() {
        let dispatcher = EventDispatcher::new();
        let all = recorder(&dispatcher, None);
        let only_closed = recorder(&dispatcher, Some(EventKind::Closed));

        dispatcher.emit(received("a"));
        dispatcher.emit(ConnectionEvent::Closed);
        dispatcher.emit(received("b"));

        assert_eq!(
            *all.lock().unwrap(),
            vec!["received:a", "Closed", "received:b"]
        );
        assert_eq!(*only_closed.lock().unwrap(), vec!["Closed"]);
    }

    #[test]
    fn batch_stays_contiguous_while_another_thread_drains() {
        use crate::state::{ConnectionState, StateChange};

        let dispatcher = Arc::new(EventDispatcher::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = StdMutex::new(release_rx);
        dispatcher.subscribe(None, move |event| match event {
            ConnectionEvent::Received(_) => {
                entered_tx.send(()).unwrap();
                release_rx.lock().unwrap().recv().unwrap();
                Ok(())
            }
            ConnectionEvent::StateChanged(_) => Err("state handler failed".into()),
            _ => Ok(()),
        });
        let seen = recorder(&dispatcher, None);

        let drainer = {
            let dispatcher = Arc::clone(&dispatcher);
            std::thread::spawn(move || dispatcher.emit(received("busy")))
        };
        entered_rx.recv().unwrap();

        dispatcher.enqueue_all([
            ConnectionEvent::StateChanged(StateChange::new(
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            )),
            ConnectionEvent::Reconnected,
        ]);
        dispatcher.drain();
        release_tx.send(()).unwrap();
        drainer.join().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "received:busy",
                "StateChanged",
                "Reconnected",
                "error:event handler failed: state handler failed",
            ]
        );
    }

    #[test]
    fn failing_handler_is_rerouted_to_error() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Some(EventKind::Received), |_| Err("bad payload".into()));
        let errors = recorder(&dispatcher, Some(EventKind::Error));
        let received_seen = recorder(&dispatcher, Some(EventKind::Received));

        dispatcher.emit(received("x"));

        assert_eq!(*received_seen.lock().unwrap(), vec!["received:x"]);
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["error:event handler failed: bad payload"]
        );
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Some(EventKind::Received), |_| panic!("boom"));
        let errors = recorder(&dispatcher, Some(EventKind::Error));
        let others = recorder(&dispatcher, Some(EventKind::Received));

        dispatcher.emit(received("1"));
        dispatcher.emit(received("2"));

        assert_eq!(*others.lock().unwrap(), vec!["received:1", "received:2"]);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("boom"));
    }

    #[test]
    fn failing_error_handler_does_not_loop() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Some(EventKind::Error), |_| Err("nope".into()));
        let errors = recorder(&dispatcher, Some(EventKind::Error));

        dispatcher.emit(ConnectionEvent::error(ConnectionError::Timeout));

        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn reentrant_emit_is_queued_not_nested() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inside = Arc::new(AtomicBool::new(false));
        let nested = Arc::new(AtomicBool::new(false));

        let d = Arc::clone(&dispatcher);
        let (inside2, nested2) = (Arc::clone(&inside), Arc::clone(&nested));
        dispatcher.subscribe(None, move |event| {
            if inside2.swap(true, Ordering::SeqCst) {
                nested2.store(true, Ordering::SeqCst);
            }
            if let ConnectionEvent::Received(text) = event {
                if text == "outer" {
                    d.emit(received("inner"));
                }
            }
            inside2.store(false, Ordering::SeqCst);
            Ok(())
        });
        let seen = recorder(&dispatcher, None);

        dispatcher.emit(received("outer"));

        assert!(!nested.load(Ordering::SeqCst));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["received:outer", "received:inner"]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(StdMutex::new(0));
        let sink = Arc::clone(&seen);
        let id = dispatcher.subscribe(None, move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        dispatcher.emit(ConnectionEvent::Reconnected);
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.emit(ConnectionEvent::Reconnected);

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_everything() {
        let dispatcher = EventDispatcher::new();
        let mut rx = dispatcher.channel();

        dispatcher.emit(received("hi"));
        dispatcher.emit(ConnectionEvent::Closed);

        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Received(t)) if t == "hi"));
        assert!(matches!(rx.recv().await, Some(ConnectionEvent::Closed)));
    }

    #[tokio::test]
    async fn flush_drains_enqueued_events() {
        let dispatcher = EventDispatcher::new();
        let seen = recorder(&dispatcher, None);

        dispatcher.enqueue(received("late"));
        dispatcher.flush().await;

        assert_eq!(*seen.lock().unwrap(), vec!["received:late"]);
    }
}
