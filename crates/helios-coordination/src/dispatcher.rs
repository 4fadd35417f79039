//! Change dispatcher
//!
//! Turns one-shot store watches into durable registrations. When a watch
//! fires, the dispatcher re-arms it with a watched read before calling any
//! listener, and that same read is what listeners receive: a notification is
//! a hint to look again, never the new value itself.
//!
//! Watches survive a suspended connection but not a lost session. When the
//! session is replaced, every registration is re-armed against the new store
//! session and listeners get a `Resynced` notification with fresh state.
//!
//! Listeners run on the dispatcher task and must return quickly; heavy work
//! belongs on a separate task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{CoordinationError, Result};
use crate::paths::validate_path;
use crate::session::{ConnectionState, CoordinationSession, SessionStatus, WeakSession};
use crate::store::{CreateMode, EventType, Version, WatchedEvent};

/// What a registration watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// The node's payload and existence
    Data,
    /// The node's set of children
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    ChildrenChanged,
    /// State re-read after the registration was rebuilt on a new session
    Resynced,
}

impl ChangeEvent {
    fn from_store(event_type: EventType) -> Self {
        match event_type {
            EventType::NodeCreated => Self::NodeCreated,
            EventType::NodeDataChanged => Self::NodeDataChanged,
            EventType::NodeDeleted => Self::NodeDeleted,
            EventType::NodeChildrenChanged => Self::ChildrenChanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub data: Vec<u8>,
    pub version: Version,
    /// Creating transaction, distinguishes a recreated node from the old one
    pub created: u64,
}

/// State read when the watch was re-armed. `None` means the node is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Data(Option<NodeData>),
    Children(Option<Vec<String>>),
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        match self {
            Self::Data(node) => node.is_some(),
            Self::Children(children) => children.is_some(),
        }
    }

    pub fn data(&self) -> Option<&NodeData> {
        match self {
            Self::Data(node) => node.as_ref(),
            Self::Children(_) => None,
        }
    }

    /// Child names, empty for a missing node.
    pub fn children(&self) -> &[String] {
        match self {
            Self::Children(Some(children)) => children,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub path: String,
    pub kind: WatchKind,
    pub event: ChangeEvent,
    pub snapshot: Snapshot,
}

/// Receives change notifications for a registered path.
pub trait ChangeListener: Send + Sync + 'static {
    fn on_change(&self, notification: ChangeNotification);
}

/// A simple listener that invokes a closure.
pub struct FnChangeListener<F>
where
    F: Fn(ChangeNotification) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnChangeListener<F>
where
    F: Fn(ChangeNotification) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ChangeListener for FnChangeListener<F>
where
    F: Fn(ChangeNotification) + Send + Sync + 'static,
{
    fn on_change(&self, notification: ChangeNotification) {
        (self.f)(notification);
    }
}

struct WatchEntry {
    path: String,
    kind: WatchKind,
    listener: Arc<dyn ChangeListener>,
    state: Mutex<EntryState>,
}

#[derive(Default)]
struct EntryState {
    /// Last snapshot delivered (or returned at registration)
    last: Option<Snapshot>,
    /// Session generation the watch is armed in, `None` when it must be rebuilt
    armed: Option<u64>,
}

struct DispatcherInner {
    session: WeakSession,
    entries: DashMap<u64, Arc<WatchEntry>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    fn matching(&self, path: &str, kind: WatchKind) -> Vec<Arc<WatchEntry>> {
        self.entries
            .iter()
            .filter(|entry| entry.path == path && entry.kind == kind)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Re-arm the watch and read current state in one step.
    async fn refresh(&self, path: &str, kind: WatchKind) -> Result<(Snapshot, u64)> {
        let session = self.session.upgrade().ok_or(CoordinationError::Closed)?;
        match kind {
            WatchKind::Data => {
                let (node, generation) = session.read_watched(path).await?;
                let node = node.map(|(data, stat)| NodeData {
                    data,
                    version: stat.version,
                    created: stat.created,
                });
                Ok((Snapshot::Data(node), generation))
            }
            WatchKind::Children => {
                let (children, generation) = session.children_watched(path).await?;
                Ok((Snapshot::Children(children), generation))
            }
        }
    }

    fn deliver(
        &self,
        entries: &[Arc<WatchEntry>],
        event: ChangeEvent,
        snapshot: &Snapshot,
        generation: u64,
        force: bool,
    ) {
        for entry in entries {
            let fresh = {
                let mut state = entry.state.lock();
                state.armed = Some(generation);
                let fresh = force || state.last.as_ref() != Some(snapshot);
                if fresh {
                    state.last = Some(snapshot.clone());
                }
                fresh
            };
            if !fresh {
                continue;
            }
            entry.listener.on_change(ChangeNotification {
                path: entry.path.clone(),
                kind: entry.kind,
                event,
                snapshot: snapshot.clone(),
            });
        }
    }

    async fn on_event(&self, event: WatchedEvent) {
        counter!("helios_coordination_watch_notifications_total").increment(1);

        let kinds: &[WatchKind] = match event.event_type {
            EventType::NodeCreated | EventType::NodeDeleted => {
                &[WatchKind::Data, WatchKind::Children]
            }
            EventType::NodeDataChanged => &[WatchKind::Data],
            EventType::NodeChildrenChanged => &[WatchKind::Children],
        };

        for &kind in kinds {
            let entries = self.matching(&event.path, kind);
            if entries.is_empty() {
                continue;
            }
            match self.refresh(&event.path, kind).await {
                Ok((snapshot, generation)) => self.deliver(
                    &entries,
                    ChangeEvent::from_store(event.event_type),
                    &snapshot,
                    generation,
                    false,
                ),
                Err(e) => {
                    warn!(path = %event.path, kind = ?kind, error = %e, "Failed to re-arm watch");
                    for entry in &entries {
                        entry.state.lock().armed = None;
                    }
                }
            }
        }
    }

    /// Returns false once the session is closed.
    async fn on_status(&self, status: SessionStatus, seen_generation: &mut u64) -> bool {
        if status.closed {
            return false;
        }
        match status.state {
            ConnectionState::Suspended => {}
            ConnectionState::LostSession => {
                for entry in self.entries.iter() {
                    entry.state.lock().armed = None;
                }
            }
            ConnectionState::Connected => {
                let new_session = status.generation != *seen_generation;
                *seen_generation = status.generation;
                self.rebuild(status.generation, new_session).await;
            }
        }
        true
    }

    /// Re-arm every registration not armed in `generation`.
    async fn rebuild(&self, generation: u64, new_session: bool) {
        let mut groups: HashMap<(String, WatchKind), Vec<Arc<WatchEntry>>> = HashMap::new();
        for entry in self.entries.iter() {
            if entry.state.lock().armed != Some(generation) {
                groups
                    .entry((entry.path.clone(), entry.kind))
                    .or_default()
                    .push(entry.value().clone());
            }
        }
        if groups.is_empty() {
            return;
        }

        debug!(generation, count = groups.len(), "Rebuilding watch registrations");
        for ((path, kind), entries) in groups {
            match self.refresh(&path, kind).await {
                Ok((snapshot, armed_in)) => self.deliver(
                    &entries,
                    ChangeEvent::Resynced,
                    &snapshot,
                    armed_in,
                    new_session,
                ),
                Err(e) => {
                    warn!(path = %path, kind = ?kind, error = %e, "Failed to rebuild watch");
                }
            }
        }
    }
}

async fn pump(
    dispatcher: Weak<DispatcherInner>,
    mut events: mpsc::UnboundedReceiver<WatchedEvent>,
    mut status: watch::Receiver<SessionStatus>,
) {
    let mut seen_generation = status.borrow_and_update().generation;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = dispatcher.upgrade() else { break };
                inner.on_event(event).await;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                let Some(inner) = dispatcher.upgrade() else { break };
                if !inner.on_status(current, &mut seen_generation).await {
                    break;
                }
            }
        }
    }
    debug!("Change dispatcher stopped");
}

/// Keeps registrations armed and fans notifications out to listeners.
#[derive(Clone)]
pub struct ChangeDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ChangeDispatcher {
    /// Create a dispatcher fed by `session` and start its task.
    pub fn new(session: &CoordinationSession) -> Self {
        let inner = Arc::new(DispatcherInner {
            session: session.downgrade(),
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(pump(
            Arc::downgrade(&inner),
            session.subscribe_watch_events(),
            session.subscribe_status(),
        ));
        Self { inner }
    }

    /// Register `listener` for changes of `path`. The watch is armed before
    /// this returns; the state read while arming is in the registration.
    pub async fn register(
        &self,
        path: &str,
        kind: WatchKind,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<WatchRegistration> {
        validate_path(path, CreateMode::Persistent)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(WatchEntry {
            path: path.to_string(),
            kind,
            listener,
            state: Mutex::new(EntryState::default()),
        });
        self.inner.entries.insert(id, entry.clone());

        match self.inner.refresh(path, kind).await {
            Ok((snapshot, generation)) => {
                {
                    let mut state = entry.state.lock();
                    state.armed = Some(generation);
                    if state.last.is_none() {
                        state.last = Some(snapshot.clone());
                    }
                }
                debug!(id, path, kind = ?kind, "Registered watch");
                Ok(WatchRegistration {
                    id,
                    path: path.to_string(),
                    kind,
                    snapshot,
                    dispatcher: Arc::downgrade(&self.inner),
                })
            }
            Err(e) => {
                self.inner.entries.remove(&id);
                Err(e)
            }
        }
    }

    /// Register a closure; see [`ChangeDispatcher::register`].
    pub async fn register_fn<F>(&self, path: &str, kind: WatchKind, f: F) -> Result<WatchRegistration>
    where
        F: Fn(ChangeNotification) + Send + Sync + 'static,
    {
        self.register(path, kind, Arc::new(FnChangeListener::new(f)))
            .await
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.inner.entries.remove(&id).is_some()
    }

    pub fn registration_count(&self) -> usize {
        self.inner.entries.len()
    }
}

/// Handle of a live registration.
#[derive(Debug)]
pub struct WatchRegistration {
    id: u64,
    path: String,
    kind: WatchKind,
    snapshot: Snapshot,
    dispatcher: Weak<DispatcherInner>,
}

impl WatchRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// State read when the watch was first armed.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Stop delivering notifications to this registration's listener.
    pub fn cancel(self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.entries.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for DispatcherInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherInner")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::session::SessionConfig;
    use crate::operation::Operation;
    use crate::store::MemoryStore;
    use crate::transaction::Transaction;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn connect(store: &MemoryStore) -> CoordinationSession {
        let config = SessionConfig {
            session_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2.0,
                jitter: 0.0,
            },
        };
        CoordinationSession::connect(Arc::new(store.clone()), config)
            .await
            .unwrap()
    }

    fn channel_listener() -> (Arc<dyn ChangeListener>, UnboundedReceiver<ChangeNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = FnChangeListener::new(move |notification| {
            let _ = tx.send(notification);
        });
        (Arc::new(listener), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<ChangeNotification>) -> ChangeNotification {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification timed out")
            .expect("dispatcher stopped")
    }

    #[test]
    fn test_snapshot_accessors() {
        let snapshot = Snapshot::Children(Some(vec!["a".to_string()]));
        assert!(snapshot.exists());
        assert_eq!(snapshot.children(), ["a".to_string()]);
        assert!(snapshot.data().is_none());

        let snapshot = Snapshot::Data(None);
        assert!(!snapshot.exists());
        assert!(snapshot.children().is_empty());
    }

    #[tokio::test]
    async fn test_register_returns_initial_state() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/w", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (listener, _rx) = channel_listener();
        let registration = session
            .watch("/w", WatchKind::Data, listener)
            .await
            .unwrap();
        let node = registration.snapshot().data().unwrap();
        assert_eq!(node.data, b"v0");
        assert_eq!(node.version, 0);
        assert_eq!(session.dispatcher().registration_count(), 1);
    }

    #[tokio::test]
    async fn test_node_created_then_deleted() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        let (listener, mut rx) = channel_listener();
        let registration = session
            .watch("/late", WatchKind::Data, listener)
            .await
            .unwrap();
        assert!(!registration.snapshot().exists());

        session
            .create("/late", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let created = next(&mut rx).await;
        assert_eq!(created.event, ChangeEvent::NodeCreated);
        assert_eq!(created.snapshot.data().map(|n| n.data.as_slice()), Some(&b"x"[..]));

        session.delete("/late", None).await.unwrap();
        let deleted = next(&mut rx).await;
        assert_eq!(deleted.event, ChangeEvent::NodeDeleted);
        assert!(!deleted.snapshot.exists());
    }

    #[tokio::test]
    async fn test_children_changed() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session.ensure_path("/status/agents").await.unwrap();

        let (listener, mut rx) = channel_listener();
        session
            .watch("/status/agents", WatchKind::Children, listener)
            .await
            .unwrap();

        session
            .create("/status/agents/a1", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        let notification = next(&mut rx).await;
        assert_eq!(notification.event, ChangeEvent::ChildrenChanged);
        assert_eq!(notification.snapshot.children(), ["a1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancelled_registration_is_silent() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/w", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();

        let (listener, mut rx) = channel_listener();
        let registration = session
            .watch("/w", WatchKind::Data, listener)
            .await
            .unwrap();
        registration.cancel();
        assert_eq!(session.dispatcher().registration_count(), 0);

        session.set_data("/w", b"1".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recreated_node_with_same_payload() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/x", b"a".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (listener, mut rx) = channel_listener();
        let registration = session
            .watch("/x", WatchKind::Data, listener)
            .await
            .unwrap();
        let before = registration.snapshot().data().unwrap().clone();

        session
            .submit(
                Transaction::new()
                    .append(Operation::delete("/x"))
                    .append(Operation::create_with_data("/x", "a")),
            )
            .await
            .unwrap();

        let notification = next(&mut rx).await;
        let after = notification.snapshot.data().unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.version, before.version);
        assert_ne!(after.created, before.created);
    }

    #[tokio::test]
    async fn test_watch_survives_suspended_connection() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/w", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (listener, mut rx) = channel_listener();
        let registration = session
            .watch("/w", WatchKind::Data, listener)
            .await
            .unwrap();

        let mut status = session.subscribe_status();
        store.disconnect_session(session.session_id());
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.state == ConnectionState::Suspended),
        )
        .await
        .unwrap()
        .unwrap();
        store.reconnect_session(session.session_id());
        tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|s| s.state == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(session.generation(), 1);

        session.set_data("/w", b"v1".to_vec(), None).await.unwrap();
        let changed = next(&mut rx).await;
        assert_eq!(changed.event, ChangeEvent::NodeDataChanged);
        assert_eq!(
            changed.snapshot.data().map(|n| n.data.clone()),
            Some(b"v1".to_vec())
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(session.dispatcher().registration_count(), 1);
        registration.cancel();
    }

    #[tokio::test]
    async fn test_resync_after_session_loss() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/w", b"before".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        let (listener, mut rx) = channel_listener();
        session
            .watch("/w", WatchKind::Data, listener)
            .await
            .unwrap();

        store.expire_session(session.session_id());
        let resynced = next(&mut rx).await;
        assert_eq!(resynced.event, ChangeEvent::Resynced);
        assert_eq!(session.generation(), 2);

        // Armed again on the new store session
        session
            .set_data("/w", b"after".to_vec(), None)
            .await
            .unwrap();
        let changed = next(&mut rx).await;
        assert_eq!(changed.event, ChangeEvent::NodeDataChanged);
        assert_eq!(
            changed.snapshot.data().map(|n| n.data.clone()),
            Some(b"after".to_vec())
        );
    }
}
