use crate::config::{AuthSlot, AuthTokenSource, RealtimeConfig};
use crate::connection::{Command, ConnectionManager, ConnectionState};
use crate::error::RealtimeError;
use crate::frame::Event;
use crate::subscription::{Subscription, SubscriptionRegistry};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use url::Url;

const REALTIME_PATH: &str = "api/realtime";

/// Realtime subscription client for a PulseBase backend.
///
/// One client holds at most one streaming connection, shared by all of its
/// subscriptions. The connection is opened lazily on the first subscribe,
/// survives reconnects transparently, and is torn down once no
/// subscriptions remain past a grace period. Cloning the client is cheap
/// and clones share the same connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    endpoint: Url,
    http: reqwest::Client,
    config: RealtimeConfig,
    auth: AuthSlot,
    registry: Arc<SubscriptionRegistry>,
    /// Current connection epoch, if one is running. Short-held lock.
    conn: Mutex<Option<ConnectionManager>>,
    next_epoch: AtomicU64,
    closed: AtomicBool,
}

impl RealtimeClient {
    /// Build a client against `base_url` with default configuration.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, RealtimeError> {
        Self::with_config(base_url, RealtimeConfig::default())
    }

    pub fn with_config(
        base_url: impl AsRef<str>,
        config: RealtimeConfig,
    ) -> Result<Self, RealtimeError> {
        let mut base = base_url.as_ref().trim_end_matches('/').to_string();
        base.push('/');
        let endpoint = Url::parse(&base)?.join(REALTIME_PATH)?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                endpoint,
                http: reqwest::Client::new(),
                config,
                auth: Arc::new(RwLock::new(None)),
                registry: Arc::new(SubscriptionRegistry::new()),
                conn: Mutex::new(None),
                next_epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Attach an auth token source, consulted on every stream open and
    /// topic sync.
    pub fn with_auth(self, source: impl AuthTokenSource + 'static) -> Self {
        self.set_auth(source);
        self
    }

    pub fn set_auth(&self, source: impl AuthTokenSource + 'static) {
        *self.inner.auth.write().unwrap() = Some(Arc::new(source));
    }

    pub fn clear_auth(&self) {
        *self.inner.auth.write().unwrap() = None;
    }

    /// Subscribe `callback` to change events on `topics`.
    ///
    /// A topic is a collection name, `"<collection>/<recordID>"`, or `"*"`
    /// for all topics. The callback receives `Ok(event)` per delivered
    /// change and `Err(..)` for transport, protocol and decode faults; it
    /// runs on the dispatch task and should hand long work off elsewhere.
    ///
    /// This never waits on the network. The only synchronous failure is an
    /// empty topic list; connection problems are reported through the
    /// callback while the client retries with backoff.
    pub async fn subscribe<F>(
        &self,
        topics: impl IntoIterator<Item = impl Into<String>>,
        callback: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Result<Event, RealtimeError>) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RealtimeError::Closed);
        }
        let topics: BTreeSet<String> = topics
            .into_iter()
            .map(Into::into)
            .filter(|topic| !topic.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(RealtimeError::EmptyTopics);
        }

        let id = self.inner.registry.add(topics, Arc::new(callback));

        // Never awaits the connection task. A Full channel already holds a
        // pending nudge and the debounced sync snapshots the registry when
        // it fires; a lost send means the epoch was mid-teardown, and its
        // exit hook re-checks the registry and respawns.
        match self.inner.ensure_connection() {
            Some(tx) => {
                let _ = tx.try_send(Command::TopicsChanged);
            }
            None => {
                // A concurrent close won the race after the check above.
                self.inner.registry.remove(id);
                return Err(RealtimeError::Closed);
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let notify = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.nudge();
            }
        });
        Ok(Subscription::new(id, self.inner.registry.clone(), notify))
    }

    /// Shut the client down: the connection task stops (no further
    /// reconnects), all subscriptions are removed, and later subscribe
    /// calls return [`RealtimeError::Closed`]. Terminal.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let manager = self.inner.conn.lock().unwrap().take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        self.inner.registry.clear();
    }

    /// Current connection lifecycle state. `Idle` when no subscription has
    /// started a connection yet (or after a grace teardown).
    pub fn state(&self) -> ConnectionState {
        if self.inner.closed.load(Ordering::SeqCst) {
            return ConnectionState::Closed;
        }
        self.inner
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|manager| manager.state())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == ConnectionState::Streaming
    }
}

impl ClientInner {
    /// Ensure a live connection epoch exists and return its command sender.
    /// Returns `None` once the client is closed; the flag is re-checked
    /// under the slot lock so a concurrent `close` cannot be outrun.
    fn ensure_connection(self: &Arc<Self>) -> Option<mpsc::Sender<Command>> {
        let mut slot = self.conn.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(manager) = slot.as_ref() {
            if !manager.is_closed() {
                return Some(manager.sender());
            }
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let on_exit = move || {
            if let Some(inner) = weak.upgrade() {
                inner.reap_epoch(epoch);
            }
        };
        let manager = ConnectionManager::spawn(
            epoch,
            self.endpoint.clone(),
            self.http.clone(),
            self.auth.clone(),
            self.config.clone(),
            self.registry.clone(),
            on_exit,
        );
        let tx = manager.sender();
        *slot = Some(manager);
        Some(tx)
    }

    /// Runs as the last step of an exiting epoch task. Clears the slot if
    /// it still holds that epoch, then respawns when subscriptions raced
    /// in during teardown so none are left stranded without a connection.
    fn reap_epoch(self: &Arc<Self>, epoch: u64) {
        {
            let mut slot = self.conn.lock().unwrap();
            match slot.as_ref() {
                Some(manager) if manager.epoch == epoch => {
                    slot.take();
                }
                _ => return,
            }
        }
        if !self.registry.is_empty() {
            if let Some(tx) = self.ensure_connection() {
                let _ = tx.try_send(Command::TopicsChanged);
            }
        }
    }

    fn nudge(&self) {
        if let Some(manager) = self.conn.lock().unwrap().as_ref() {
            manager.nudge();
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Best-effort: stop the background task when the last handle goes.
        if let Ok(slot) = self.conn.get_mut() {
            if let Some(manager) = slot.take() {
                manager.try_shutdown();
            }
        }
    }
}
