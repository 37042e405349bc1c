use std::sync::{Arc, Mutex};

/// A single-writer, multi-subscriber container with synchronous
/// notification: every subscriber observes a write before the caller of
/// [`Cell::set`] regains control.
pub struct Cell<T>(Arc<Inner<T>>);

struct Inner<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    value: T,
    next_id: u64,
    subscribers: Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>,
    keep_alive: Vec<Subscription>,
}

/// RAII handle returned by [`Cell::subscribe`]. Dropping it removes the
/// listener; there is no separate `unsubscribe` call.
pub struct Subscription {
    id: u64,
    unsubscribe: Arc<dyn Fn(u64) + Send + Sync>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        (self.unsubscribe)(self.id);
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Cell(self.0.clone())
    }
}

impl<T> Cell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Cell(Arc::new(Inner {
            state: Mutex::new(State {
                value,
                next_id: 0,
                subscribers: Vec::new(),
                keep_alive: Vec::new(),
            }),
        }))
    }

    pub fn get(&self) -> T {
        self.0.state.lock().expect("cell lock poisoned").value.clone()
    }

    /// Writes unconditionally and notifies every subscriber synchronously.
    pub fn set(&self, value: T) {
        self.publish(value);
    }

    /// Writes only if the new value differs from the current one, skipping
    /// the notification pass entirely when nothing changed.
    pub fn set_if_changed(&self, value: T) {
        let unchanged = {
            let guard = self.0.state.lock().expect("cell lock poisoned");
            guard.value == value
        };
        if !unchanged {
            self.publish(value);
        }
    }

    /// Writes unconditionally, but notifies subscribers only when `notify`
    /// is true. For callers that need to fold in low-significance changes
    /// (e.g. a merge that touches existing entries) without waking
    /// subscribers unless something they actually care about happened (e.g.
    /// a new entry).
    pub fn set_notify_if(&self, value: T, notify: bool) {
        if notify {
            self.publish(value);
            return;
        }
        self.0.state.lock().expect("cell lock poisoned").value = value;
    }

    fn publish(&self, value: T) {
        let (subscribers, snapshot) = {
            let mut guard = self.0.state.lock().expect("cell lock poisoned");
            guard.value = value;
            (
                guard.subscribers.iter().map(|(_, f)| f.clone()).collect::<Vec<_>>(),
                guard.value.clone(),
            )
        };
        for listener in subscribers {
            listener(&snapshot);
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut guard = self.0.state.lock().expect("cell lock poisoned");
        let id = guard.next_id;
        guard.next_id += 1;
        guard.subscribers.push((id, Arc::new(listener)));
        drop(guard);

        let inner = self.0.clone();
        Subscription {
            id,
            unsubscribe: Arc::new(move |id| {
                let mut guard = inner.state.lock().expect("cell lock poisoned");
                guard.subscribers.retain(|(sid, _)| *sid != id);
            }),
        }
    }

    /// Derives a read-only projection that re-evaluates `f` every time this
    /// cell changes. The source subscription is kept alive for as long as
    /// the derived cell is.
    pub fn map<U, F>(&self, f: F) -> Cell<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let derived = Cell::new(f(&self.get()));
        let derived_for_listener = derived.clone();
        let sub = self.subscribe(move |v| derived_for_listener.set_if_changed(f(v)));
        derived.0.state.lock().expect("cell lock poisoned").keep_alive.push(sub);
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribers_observe_writes_synchronously() {
        let cell = Cell::new(0);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_for_listener = seen.clone();
        let _sub = cell.subscribe(move |v| seen_for_listener.store(*v, Ordering::SeqCst));

        cell.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn set_if_changed_skips_notification_when_equal() {
        let cell = Cell::new("a".to_owned());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_listener = calls.clone();
        let _sub = cell.subscribe(move |_| {
            calls_for_listener.fetch_add(1, Ordering::SeqCst);
        });

        cell.set_if_changed("a".to_owned());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cell.set_if_changed("b".to_owned());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_stops_notifications() {
        let cell = Cell::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_listener = calls.clone();
        let sub = cell.subscribe(move |_| {
            calls_for_listener.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);

        cell.set(1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn set_notify_if_writes_silently_when_told_not_to_notify() {
        let cell = Cell::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_listener = calls.clone();
        let _sub = cell.subscribe(move |_| {
            calls_for_listener.fetch_add(1, Ordering::SeqCst);
        });

        cell.set_notify_if(2, false);
        assert_eq!(cell.get(), 2, "the value still updates");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "but subscribers are not woken");

        cell.set_notify_if(3, true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn map_derives_a_live_projection() {
        let source = Cell::new(2);
        let doubled = source.map(|v| v * 2);
        assert_eq!(doubled.get(), 4);

        source.set(5);
        assert_eq!(doubled.get(), 10);
    }
}
