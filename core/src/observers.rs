//! Ordered list of event subscribers.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Subscribers receive every event in registration order. Delivery goes
/// through unbounded channels, so an observer reacting to an event can never
/// re-enter the notifier while it is still updating its own state.
pub struct ObserverList<E> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, mpsc::UnboundedSender<E>)>>,
}

impl<E: Clone> ObserverList<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_observer(&self) -> (ObserverId, mpsc::UnboundedReceiver<E>) {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push((id, tx));
        (id, rx)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: &E) {
        let snapshot: Vec<(ObserverId, mpsc::UnboundedSender<E>)> = self.lock().clone();
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(event.clone()).is_err() {
                gone.push(id);
            }
        }
        if !gone.is_empty() {
            self.lock().retain(|(id, _)| !gone.contains(id));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, mpsc::UnboundedSender<E>)>> {
        match self.observers.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }
}

impl<E: Clone> Default for ObserverList<E> {
    fn default() -> Self {
        Self::new()
    }
}
