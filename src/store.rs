//! Dissemination store for session data.
//!
//! The [`Store`] is the single place consumers look at: the latest record, the
//! append-only history of the current session, the connection status and the
//! identity of the attached device. Every change produces a [`StoreEvent`]
//! that is delivered synchronously to registered observers, in the order the
//! changes happened.
//!
//! # Example
//!
//! ```
//! use volt_daq::store::{Store, StoreEvent};
//!
//! let store = Store::new();
//! let subscription = store.subscribe(|event| {
//!     if let StoreEvent::Latest(record) = event {
//!         println!("{record}");
//!     }
//! });
//! // ...
//! subscription.unsubscribe();
//! ```

use crate::record::Record;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Connection status shown to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether a session is open
    pub connected: bool,
    /// Why the last session ended abnormally, if it did
    pub error: Option<String>,
}

/// Identity reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Raw identifier (e.g. `VOLT0`)
    pub id: Option<String>,
    /// Human-readable name
    pub name: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            id: None,
            name: "None".to_string(),
        }
    }
}

/// A change to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// History was cleared for a new session
    SessionStarted,
    /// Latest record replaced
    Latest(Record),
    /// A record was appended at `index`
    Appended {
        /// Position in history
        index: usize,
    },
    /// Connection status changed
    Status(ConnectionStatus),
    /// Device identity changed
    Device(DeviceInfo),
    /// User-facing notice (e.g. device disconnected)
    Notice(String),
}

/// Point-in-time copy of the store.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Latest record
    pub latest: Option<Record>,
    /// Full session history
    pub history: Vec<Record>,
    /// Connection status
    pub status: ConnectionStatus,
    /// Device identity
    pub device: DeviceInfo,
}

type Observer = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(u64, Observer)>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<Snapshot>,
    observers: Mutex<Observers>,
    // Held across mutate + notify so events reach observers in mutation order
    dispatch: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to session state. Cheap to clone.
///
/// Observers run on the thread that made the change and must not write to
/// the store themselves.
#[derive(Clone, Default)]
pub struct Store {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Store")
            .field("history_len", &state.history.len())
            .field("status", &state.status)
            .field("device", &state.device)
            .finish()
    }
}

impl Store {
    /// Empty store, disconnected.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut Snapshot) -> Vec<StoreEvent>,
    {
        let _dispatch = lock(&self.shared.dispatch);
        let events = mutate(&mut lock(&self.shared.state));
        if events.is_empty() {
            return;
        }

        let observers: Vec<Observer> = lock(&self.shared.observers)
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for event in &events {
            for observer in &observers {
                observer(event);
            }
        }
    }

    /// Clear latest and history for a new session.
    pub fn start_session(&self) {
        self.apply(|state| {
            state.latest = None;
            state.history.clear();
            vec![StoreEvent::SessionStarted]
        });
    }

    /// Replace the latest record.
    pub fn set_latest(&self, record: Record) {
        self.apply(|state| {
            state.latest = Some(record.clone());
            vec![StoreEvent::Latest(record)]
        });
    }

    /// Append a record to history.
    pub fn append_history(&self, record: Record) {
        self.apply(|state| {
            state.history.push(record);
            vec![StoreEvent::Appended {
                index: state.history.len() - 1,
            }]
        });
    }

    /// Set latest and append in one step.
    pub fn publish(&self, record: Record) {
        self.apply(|state| {
            state.latest = Some(record.clone());
            state.history.push(record.clone());
            vec![
                StoreEvent::Latest(record),
                StoreEvent::Appended {
                    index: state.history.len() - 1,
                },
            ]
        });
    }

    /// Update connection status. No event if unchanged.
    pub fn set_status(&self, status: ConnectionStatus) {
        self.apply(|state| {
            if state.status == status {
                return Vec::new();
            }
            state.status = status.clone();
            vec![StoreEvent::Status(status)]
        });
    }

    /// Update device identity. No event if unchanged.
    pub fn set_device(&self, device: DeviceInfo) {
        self.apply(|state| {
            if state.device == device {
                return Vec::new();
            }
            state.device = device.clone();
            vec![StoreEvent::Device(device)]
        });
    }

    /// Emit a user-facing notice.
    pub fn notify(&self, message: impl Into<String>) {
        let message = message.into();
        self.apply(|_| vec![StoreEvent::Notice(message)]);
    }

    /// Latest record, if any.
    pub fn latest(&self) -> Option<Record> {
        lock(&self.shared.state).latest.clone()
    }

    /// Copy of the session history.
    pub fn history(&self) -> Vec<Record> {
        lock(&self.shared.state).history.clone()
    }

    /// Run `f` against the history without copying it.
    pub fn with_history<R>(&self, f: impl FnOnce(&[Record]) -> R) -> R {
        f(&lock(&self.shared.state).history)
    }

    /// Number of records in history.
    pub fn history_len(&self) -> usize {
        lock(&self.shared.state).history.len()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared.state).status.clone()
    }

    /// Current device identity.
    pub fn device(&self) -> DeviceInfo {
        lock(&self.shared.state).device.clone()
    }

    /// Copy of everything.
    pub fn snapshot(&self) -> Snapshot {
        lock(&self.shared.state).clone()
    }

    /// Register an observer. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let mut observers = lock(&self.shared.observers);
        let id = observers.next_id;
        observers.next_id += 1;
        observers.entries.push((id, Arc::new(observer)));

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Lazy, unbounded stream of every subsequent event.
    ///
    /// The stream ends once every handle to the store is gone.
    pub fn watch(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |event| {
            // Receiver gone means the stream was dropped; its subscription goes with it
            let _ = tx.send(event.clone());
        });

        EventStream {
            inner: UnboundedReceiverStream::new(rx),
            _subscription: subscription,
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        lock(&self.shared.observers).entries.len()
    }
}

/// Handle that keeps an observer registered.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Detach the observer now.
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.observers)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Stream returned by [`Store::watch`].
pub struct EventStream {
    inner: UnboundedReceiverStream<StoreEvent>,
    _subscription: Subscription,
}

impl Stream for EventStream {
    type Item = StoreEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordLabel;
    use futures::StreamExt;

    fn record(index: u64, value: f64) -> Record {
        Record {
            label: RecordLabel::Index(index),
            fields: vec![Some(value)],
        }
    }

    fn recorder(store: &Store) -> (Arc<Mutex<Vec<StoreEvent>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = store.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (seen, subscription)
    }

    #[test]
    fn publish_updates_latest_and_history_in_order() {
        let store = Store::new();
        let (seen, _sub) = recorder(&store);

        store.publish(record(0, 1.0));
        store.publish(record(1, 2.0));

        assert_eq!(store.latest(), Some(record(1, 2.0)));
        assert_eq!(store.history(), vec![record(0, 1.0), record(1, 2.0)]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StoreEvent::Latest(record(0, 1.0)),
                StoreEvent::Appended { index: 0 },
                StoreEvent::Latest(record(1, 2.0)),
                StoreEvent::Appended { index: 1 },
            ]
        );
    }

    #[test]
    fn new_session_clears_history() {
        let store = Store::new();
        store.append_history(record(0, 1.0));
        store.set_latest(record(0, 1.0));

        store.start_session();

        assert!(store.history().is_empty());
        assert!(store.latest().is_none());
    }

    #[test]
    fn observer_sees_state_already_applied() {
        let store = Store::new();
        let reader = store.clone();
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lengths);
        let _sub = store.subscribe(move |event| {
            if let StoreEvent::Appended { index } = event {
                sink.lock().unwrap().push((*index, reader.history_len()));
            }
        });

        store.append_history(record(0, 1.0));
        store.append_history(record(1, 1.0));

        assert_eq!(*lengths.lock().unwrap(), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn unchanged_status_is_not_renotified() {
        let store = Store::new();
        let (seen, _sub) = recorder(&store);

        let open = ConnectionStatus {
            connected: true,
            error: None,
        };
        store.set_status(open.clone());
        store.set_status(open.clone());

        assert_eq!(*seen.lock().unwrap(), vec![StoreEvent::Status(open)]);
    }

    #[test]
    fn dropping_subscription_detaches() {
        let store = Store::new();
        let (seen, sub) = recorder(&store);
        assert_eq!(store.observer_count(), 1);

        store.notify("first");
        sub.unsubscribe();
        store.notify("second");

        assert_eq!(store.observer_count(), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![StoreEvent::Notice("first".into())]
        );
    }

    #[test]
    fn subscription_outliving_store_is_harmless() {
        let store = Store::new();
        let sub = store.subscribe(|_| {});
        drop(store);
        drop(sub);
    }

    #[test]
    fn default_device_is_none() {
        let store = Store::new();
        assert_eq!(store.device().name, "None");
        assert!(store.device().id.is_none());
        assert!(!store.status().connected);
    }

    #[tokio::test]
    async fn watch_yields_events_then_ends_with_store() {
        let store = Store::new();
        let mut events = store.watch();

        store.start_session();
        store.publish(record(0, 3.5));
        drop(store);

        assert_eq!(events.next().await, Some(StoreEvent::SessionStarted));
        assert_eq!(events.next().await, Some(StoreEvent::Latest(record(0, 3.5))));
        assert_eq!(events.next().await, Some(StoreEvent::Appended { index: 0 }));
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn dropped_watch_unsubscribes() {
        let store = Store::new();
        let events = store.watch();
        assert_eq!(store.observer_count(), 1);
        drop(events);
        assert_eq!(store.observer_count(), 0);
    }
}
