use crate::error::RealtimeError;
use crate::frame::{Event, ALL_TOPICS};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

pub(crate) type EventCallback = Arc<dyn Fn(Result<Event, RealtimeError>) + Send + Sync>;

struct Entry {
    topics: BTreeSet<String>,
    callback: EventCallback,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// Thread-safe table of active subscriptions. Outlives any individual
/// connection: the connection task only ever reads snapshots from it.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return its handle id, unique for the
    /// registry's lifetime.
    pub fn add(&self, topics: BTreeSet<String>, callback: EventCallback) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, Entry { topics, callback });
        id
    }

    /// Remove a subscription. Returns whether the entry was present, so an
    /// unsubscribe races to exactly one effect.
    pub fn remove(&self, id: u64) -> bool {
        self.inner.lock().unwrap().entries.remove(&id).is_some()
    }

    /// Union of all active subscriptions' topics.
    pub fn snapshot(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .flat_map(|entry| entry.topics.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    /// Deliver an event to every subscription whose topic set contains the
    /// event's topic or the `"*"` wildcard. Callbacks run outside the
    /// registry lock.
    pub fn dispatch(&self, event: &Event) {
        let targets: Vec<EventCallback> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .values()
                .filter(|entry| {
                    entry.topics.contains(event.topic.as_str())
                        || entry.topics.contains(ALL_TOPICS)
                })
                .map(|entry| entry.callback.clone())
                .collect()
        };
        for callback in targets {
            invoke(&callback, Ok(event.clone()));
        }
    }

    /// Report a connection or decode fault to every active subscription.
    pub fn broadcast_error(&self, err: RealtimeError) {
        let targets: Vec<EventCallback> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .values()
                .map(|entry| entry.callback.clone())
                .collect()
        };
        for callback in targets {
            invoke(&callback, Err(err.clone()));
        }
    }
}

/// Invoke one callback, containing any panic to that subscriber: the panic
/// is reported back to the same callback as an error value and never
/// reaches other subscribers or the dispatch task.
fn invoke(callback: &EventCallback, message: Result<Event, RealtimeError>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(message))) {
        let reason = panic_reason(payload.as_ref());
        tracing::warn!(%reason, "subscriber callback panicked");
        let _ = catch_unwind(AssertUnwindSafe(|| {
            callback(Err(RealtimeError::Callback(reason)))
        }));
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Handle returned by [`RealtimeClient::subscribe`](crate::RealtimeClient::subscribe).
///
/// Call [`unsubscribe`](Self::unsubscribe) to stop delivery; dropping the
/// handle does the same. Both are idempotent and never block.
pub struct Subscription {
    id: u64,
    registry: Arc<SubscriptionRegistry>,
    notify: Arc<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        registry: Arc<SubscriptionRegistry>,
        notify: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            id,
            registry,
            notify,
        }
    }

    /// Stop delivery to this subscription's callback. The first call takes
    /// effect; later calls are no-ops.
    pub fn unsubscribe(&self) {
        if self.registry.remove(self.id) {
            (self.notify)();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
