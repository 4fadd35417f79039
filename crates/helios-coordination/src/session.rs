//! Coordination session
//!
//! Owns the connection to the store, wraps every primitive with the retry
//! policy and tracks connection state. One session is shared by every
//! component of a process; clones are cheap handles to the same connection.
//!
//! Commits are made retry-safe with commit markers: every write transaction
//! also creates an ephemeral `/coordination/commits/<id>` node in the same
//! atomic commit. When a commit fails without a definite answer, the marker
//! tells whether it was applied before the identical transaction is re-issued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{ChangeDispatcher, ChangeListener, WatchKind, WatchRegistration};
use crate::error::{CoordinationError, Outcome, Result};
use crate::operation::Operation;
use crate::paths::{self, COMMITS, PathLayout};
use crate::retry::{ErrorClass, RetryDecision, RetryPolicy};
use crate::store::{
    CoordinationStore, CreateMode, EventReceiver, NodeStat, SessionEvent, SessionId,
    StoreClient, StoreError, StoreEvent, StoreOp, StoreResult, Version, WatchedEvent,
};
use crate::transaction::{CommitResult, Transaction, marker_op};

/// Connection state as seen by the rest of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection lost but the session may still be alive; watches survive
    Suspended,
    /// The session is gone, with its ephemeral nodes and watches
    LostSession,
}

/// Connection state plus the generation of the store session it refers to.
///
/// The generation increments every time a new store session replaces an
/// expired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub generation: u64,
    /// Set once the session has been closed; no further transitions follow
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Connection {
    pub(crate) client: Arc<dyn StoreClient>,
    pub(crate) generation: u64,
}

struct SessionInner {
    store: Arc<dyn CoordinationStore>,
    config: SessionConfig,
    connection: RwLock<Connection>,
    status_tx: watch::Sender<SessionStatus>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WatchedEvent>>>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    dispatcher: OnceLock<ChangeDispatcher>,
}

impl SessionInner {
    fn update_state(&self, generation: u64, state: ConnectionState) {
        let changed = self.status_tx.send_if_modified(|status| {
            if status.closed
                || status.generation != generation
                || status.state == state
                || status.state == ConnectionState::LostSession
            {
                return false;
            }
            status.state = state;
            true
        });
        if changed {
            info!(generation, state = ?state, "Coordination connection state changed");
        }
    }

    fn publish(&self, event: WatchedEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Shared handle to the process-wide coordination session.
#[derive(Clone)]
pub struct CoordinationSession {
    inner: Arc<SessionInner>,
}

/// Non-owning session handle for background tasks.
#[derive(Clone)]
pub(crate) struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub(crate) fn upgrade(&self) -> Option<CoordinationSession> {
        self.0.upgrade().map(|inner| CoordinationSession { inner })
    }
}

async fn open(
    store: &dyn CoordinationStore,
    config: &SessionConfig,
) -> Result<(Arc<dyn StoreClient>, EventReceiver)> {
    match tokio::time::timeout(config.connect_timeout, store.connect(config.session_timeout)).await
    {
        Ok(Ok(connected)) => Ok(connected),
        Ok(Err(err)) => Err(failure(err, 1, Outcome::NotApplied)),
        Err(_) => Err(CoordinationError::CoordinationUnavailable {
            attempts: 1,
            outcome: Outcome::NotApplied,
        }),
    }
}

/// Final error for a store failure that will not be retried.
fn failure(err: StoreError, attempts: u32, outcome: Outcome) -> CoordinationError {
    match ErrorClass::of(&err) {
        ErrorClass::Connectivity => CoordinationError::CoordinationUnavailable { attempts, outcome },
        _ => err.into(),
    }
}

fn record_commit(outcome: &'static str) {
    counter!("helios_coordination_commits_total", "outcome" => outcome).increment(1);
}

impl CoordinationSession {
    /// Open a session against `store`.
    pub async fn connect(store: Arc<dyn CoordinationStore>, config: SessionConfig) -> Result<Self> {
        let (client, events) = open(store.as_ref(), &config).await?;
        let session_id = client.session_id();

        let (status_tx, _) = watch::channel(SessionStatus {
            state: ConnectionState::Connected,
            generation: 1,
            closed: false,
        });
        let shutdown = Arc::new(Notify::new());
        let inner = Arc::new(SessionInner {
            store,
            config,
            connection: RwLock::new(Connection {
                client,
                generation: 1,
            }),
            status_tx,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            dispatcher: OnceLock::new(),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), events, 1, shutdown));

        let session = Self { inner };
        session.ensure_path(COMMITS).await?;

        info!(session_id, "Coordination session established");
        Ok(session)
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub(crate) fn connection(&self) -> Result<Connection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::Closed);
        }
        Ok(self.inner.connection.read().clone())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Id of the current store session.
    pub fn session_id(&self) -> SessionId {
        self.inner.connection.read().client.session_id()
    }

    pub fn generation(&self) -> u64 {
        self.inner.status_tx.borrow().generation
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Raw watch events of every store session this handle goes through.
    pub fn subscribe_watch_events(&self) -> mpsc::UnboundedReceiver<WatchedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Wait until the session is connected, returning the connected status.
    pub async fn wait_connected(&self) -> Result<SessionStatus> {
        let mut status = self.subscribe_status();
        let reached = status
            .wait_for(|s| s.closed || s.state == ConnectionState::Connected)
            .await
            .map(|s| *s)
            .map_err(|_| CoordinationError::Closed)?;
        if reached.closed {
            return Err(CoordinationError::Closed);
        }
        Ok(reached)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn with_retry<T, F, Fut>(&self, path: &str, op: F) -> Result<T>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let policy = &self.inner.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let connection = self.connection()?;
            match op(connection).await {
                Ok(value) => return Ok(value),
                Err(err) => match policy.decide(&err, attempts) {
                    RetryDecision::Retry(delay) => {
                        counter!("helios_coordination_retries_total").increment(1);
                        debug!(path, attempts, error = %err, ?delay, "Retrying store request");
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Fail => {
                        return Err(failure(err, attempts, Outcome::NotApplied));
                    }
                },
            }
        }
    }

    /// Read a node's payload and version.
    pub async fn read(&self, path: &str) -> Result<(Vec<u8>, Version)> {
        let owned = path.to_string();
        let (data, stat) = self
            .with_retry(path, move |conn| {
                let path = owned.clone();
                async move { conn.client.get(&path, false).await }
            })
            .await?;
        Ok((data, stat.version))
    }

    pub async fn read_stat(&self, path: &str) -> Result<NodeStat> {
        self.exists(path)
            .await?
            .ok_or_else(|| CoordinationError::NodeNotFound {
                index: None,
                path: path.to_string(),
            })
    }

    pub async fn exists(&self, path: &str) -> Result<Option<NodeStat>> {
        let owned = path.to_string();
        self.with_retry(path, move |conn| {
            let path = owned.clone();
            async move { conn.client.exists(&path, false).await }
        })
        .await
    }

    /// Child names of `path`, sorted.
    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        let owned = path.to_string();
        let mut children = self
            .with_retry(path, move |conn| {
                let path = owned.clone();
                async move { conn.client.children(&path, false).await }
            })
            .await?;
        children.sort();
        Ok(children)
    }

    /// Read `path` and arm a data watch on it, whether or not it exists.
    pub(crate) async fn read_watched(
        &self,
        path: &str,
    ) -> Result<(Option<(Vec<u8>, NodeStat)>, u64)> {
        let owned = path.to_string();
        self.with_retry(path, move |conn| {
            let path = owned.clone();
            async move {
                if conn.client.exists(&path, true).await?.is_none() {
                    return Ok((None, conn.generation));
                }
                match conn.client.get(&path, true).await {
                    Ok(node) => Ok((Some(node), conn.generation)),
                    // Deleted in between; the exists watch is still armed
                    Err(StoreError::NoNode { .. }) => Ok((None, conn.generation)),
                    Err(err) => Err(err),
                }
            }
        })
        .await
    }

    /// List the children of `path` and arm a child watch on it. For a missing
    /// node a data watch is armed instead so its creation is seen.
    pub(crate) async fn children_watched(&self, path: &str) -> Result<(Option<Vec<String>>, u64)> {
        let owned = path.to_string();
        let (children, generation) = self
            .with_retry(path, move |conn| {
                let path = owned.clone();
                async move {
                    match conn.client.children(&path, true).await {
                        Ok(children) => return Ok((Some(children), conn.generation)),
                        Err(StoreError::NoNode { .. }) => {}
                        Err(err) => return Err(err),
                    }
                    if conn.client.exists(&path, true).await?.is_none() {
                        return Ok((None, conn.generation));
                    }
                    match conn.client.children(&path, true).await {
                        Ok(children) => Ok((Some(children), conn.generation)),
                        Err(StoreError::NoNode { .. }) => Ok((None, conn.generation)),
                        Err(err) => Err(err),
                    }
                }
            })
            .await?;
        Ok((
            children.map(|mut c| {
                c.sort();
                c
            }),
            generation,
        ))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Commit a transaction atomically.
    ///
    /// Connectivity failures are retried within the retry budget. A retry is
    /// only issued once the previous attempt is known not to have applied.
    pub async fn submit(&self, transaction: Transaction) -> Result<CommitResult> {
        let compiled = transaction.compile()?;
        if compiled.is_empty() {
            return Ok(CommitResult::empty());
        }

        // Pinned: the marker is ephemeral and only meaningful in this store session
        let conn = self.connection()?;
        let marker = compiled
            .has_writes()
            .then(|| PathLayout::commit_marker(Uuid::new_v4()));
        let mut ops = compiled.ops().to_vec();
        if let Some(marker) = &marker {
            ops.push(marker_op(marker));
        }

        let policy = &self.inner.config.retry;
        let mut attempts = 0;
        let mut unknown = false;
        loop {
            attempts += 1;

            if unknown && let Some(marker) = &marker {
                match marker_present(&conn, marker).await {
                    Ok(true) => {
                        info!(marker = %marker, attempts, "Commit confirmed applied after indeterminate failure");
                        remove_marker(&conn, marker).await;
                        record_commit("recovered");
                        return Ok(CommitResult {
                            results: compiled.recovered(),
                            attempts,
                            recovered: true,
                        });
                    }
                    Ok(false) => {
                        debug!(marker = %marker, attempts, "Commit not applied, re-issuing");
                        unknown = false;
                    }
                    Err(err) => match policy.decide(&err, attempts) {
                        RetryDecision::Retry(delay) => {
                            counter!("helios_coordination_retries_total").increment(1);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        RetryDecision::Fail => {
                            warn!(marker = %marker, attempts, error = %err, "Commit outcome unknown");
                            record_commit("unknown");
                            return Err(failure(err, attempts, Outcome::Unknown));
                        }
                    },
                }
            }

            match conn.client.multi(ops.clone()).await {
                Ok(results) => {
                    if let Some(marker) = &marker {
                        remove_marker(&conn, marker).await;
                    }
                    record_commit("committed");
                    return Ok(CommitResult {
                        results: compiled.collect(results),
                        attempts,
                        recovered: false,
                    });
                }
                Err(err) => {
                    let class = ErrorClass::of(&err);
                    if class == ErrorClass::NodeLevel {
                        record_commit("rejected");
                        return Err(compiled.map_error(err));
                    }
                    unknown = class == ErrorClass::Connectivity && marker.is_some();

                    match policy.decide(&err, attempts) {
                        RetryDecision::Retry(delay) => {
                            counter!("helios_coordination_retries_total").increment(1);
                            debug!(attempts, error = %err, ?delay, "Retrying commit");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Fail => {
                            let mut outcome = if unknown {
                                Outcome::Unknown
                            } else {
                                Outcome::NotApplied
                            };
                            // Settle the final attempt before giving up
                            if unknown && let Some(marker) = &marker {
                                match marker_present(&conn, marker).await {
                                    Ok(true) => {
                                        info!(marker = %marker, attempts, "Final commit attempt confirmed applied");
                                        remove_marker(&conn, marker).await;
                                        record_commit("recovered");
                                        return Ok(CommitResult {
                                            results: compiled.recovered(),
                                            attempts,
                                            recovered: true,
                                        });
                                    }
                                    Ok(false) => outcome = Outcome::NotApplied,
                                    Err(e) => {
                                        debug!(marker = %marker, error = %e, "Commit marker check failed")
                                    }
                                }
                            }
                            warn!(attempts, error = %err, %outcome, "Commit failed");
                            record_commit(match class {
                                ErrorClass::Connectivity => "unavailable",
                                _ => "expired",
                            });
                            return Err(failure(err, attempts, outcome));
                        }
                    }
                }
            }
        }
    }

    pub async fn create(&self, path: &str, data: impl Into<Vec<u8>>, mode: CreateMode) -> Result<()> {
        self.submit(Transaction::new().append(Operation::create_with_data(path, data).with_mode(mode)))
            .await
            .map(|_| ())
    }

    /// Write a payload, guarded by `version` when given. Returns the new version
    /// when it is known.
    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        version: Option<Version>,
    ) -> Result<Option<Version>> {
        let operation = match version {
            Some(version) => Operation::set_data_with_version(path, data, version),
            None => Operation::set_data(path, data),
        };
        let result = self.submit(Transaction::new().append(operation)).await?;
        Ok(result.updated_version(0))
    }

    pub async fn delete(&self, path: &str, version: Option<Version>) -> Result<()> {
        let operation = match version {
            Some(version) => Operation::delete_with_version(path, version),
            None => Operation::delete(path),
        };
        self.submit(Transaction::new().append(operation))
            .await
            .map(|_| ())
    }

    pub async fn check_version(&self, path: &str, version: Version) -> Result<()> {
        self.submit(Transaction::new().append(Operation::check_version(path, version)))
            .await
            .map(|_| ())
    }

    /// Create `path` and any missing ancestors as empty persistent nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        paths::validate_path(path, CreateMode::Persistent)?;
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            let owned = prefix.clone();
            self.with_retry(&prefix, move |conn| {
                let path = owned.clone();
                async move {
                    let create = StoreOp::Create {
                        path,
                        data: Vec::new(),
                        mode: CreateMode::Persistent,
                    };
                    match conn.client.multi(vec![create]).await {
                        Ok(_) => Ok(()),
                        Err(err) => match err.into_indexed().1 {
                            StoreError::NodeExists { .. } => Ok(()),
                            err => Err(err),
                        },
                    }
                }
            })
            .await?;
        }
        Ok(())
    }

    // ========================================================================
    // Watches
    // ========================================================================

    /// The session's own change dispatcher.
    pub fn dispatcher(&self) -> &ChangeDispatcher {
        self.inner
            .dispatcher
            .get_or_init(|| ChangeDispatcher::new(self))
    }

    /// Register `listener` for changes of `path`.
    pub async fn watch(
        &self,
        path: &str,
        kind: WatchKind,
        listener: Arc<dyn ChangeListener>,
    ) -> Result<WatchRegistration> {
        self.dispatcher().register(path, kind, listener).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the session. Ephemeral nodes are removed at once and no new
    /// store session is established afterwards.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.notify_one();

        let conn = self.inner.connection.read().clone();
        let result = conn.client.close().await;

        self.inner.status_tx.send_modify(|status| {
            status.state = ConnectionState::LostSession;
            status.closed = true;
        });
        self.inner.subscribers.lock().clear();

        info!(session_id = conn.client.session_id(), "Coordination session closed");
        result.map_err(CoordinationError::from)
    }
}

async fn marker_present(conn: &Connection, marker: &str) -> StoreResult<bool> {
    conn.client.sync(COMMITS).await?;
    Ok(conn.client.exists(marker, false).await?.is_some())
}

async fn remove_marker(conn: &Connection, marker: &str) {
    let delete = StoreOp::Delete {
        path: marker.to_string(),
        version: None,
    };
    if let Err(e) = conn.client.multi(vec![delete]).await {
        debug!(marker, error = %e, "Failed to remove commit marker");
    }
}

/// Pump store events of the current store session, replacing it when it expires.
async fn run_events(
    session: Weak<SessionInner>,
    mut events: EventReceiver,
    mut generation: u64,
    shutdown: Arc<Notify>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.notified() => return,
            event = events.recv() => event,
        };
        let Some(inner) = session.upgrade() else {
            return;
        };

        match event {
            Some(StoreEvent::Watch(event)) => inner.publish(event),
            Some(StoreEvent::Session(SessionEvent::Connected)) => {
                inner.update_state(generation, ConnectionState::Connected)
            }
            Some(StoreEvent::Session(SessionEvent::Disconnected)) => {
                inner.update_state(generation, ConnectionState::Suspended)
            }
            Some(StoreEvent::Session(SessionEvent::Expired)) | None => {
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                warn!(generation, "Coordination session lost");
                inner.update_state(generation, ConnectionState::LostSession);
                drop(inner);

                match reestablish(&session, generation, &shutdown).await {
                    Some(next) => {
                        events = next;
                        generation += 1;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn reestablish(
    session: &Weak<SessionInner>,
    generation: u64,
    shutdown: &Notify,
) -> Option<EventReceiver> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let inner = session.upgrade()?;
        if inner.closed.load(Ordering::Acquire) {
            return None;
        }

        match open(inner.store.as_ref(), &inner.config).await {
            Ok((client, events)) => {
                let next = generation + 1;
                let session_id = client.session_id();
                *inner.connection.write() = Connection {
                    client: client.clone(),
                    generation: next,
                };
                if inner.closed.load(Ordering::Acquire) {
                    let _ = client.close().await;
                    return None;
                }

                let handle = CoordinationSession {
                    inner: inner.clone(),
                };
                if let Err(e) = handle.ensure_path(COMMITS).await {
                    warn!(error = %e, "Failed to prepare commit marker path");
                }

                inner.status_tx.send_modify(|status| {
                    status.state = ConnectionState::Connected;
                    status.generation = next;
                });
                info!(session_id, generation = next, "Coordination session re-established");
                return Some(events);
            }
            Err(e) => {
                let delay = inner.config.retry.calculate_delay(attempt);
                warn!(attempt, error = %e, ?delay, "Failed to re-establish coordination session");
                drop(inner);
                tokio::select! {
                    _ = shutdown.notified() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryStore};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            session_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    async fn connect(store: &MemoryStore) -> CoordinationSession {
        CoordinationSession::connect(Arc::new(store.clone()), fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_prepares_marker_root() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        assert!(store.node(COMMITS).is_some());
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert_eq!(session.generation(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_node() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        let err = session.read("/missing").await.unwrap_err();
        assert!(matches!(err, CoordinationError::NodeNotFound { index: None, .. }));
    }

    #[tokio::test]
    async fn test_create_read_and_versioned_set() {
        let store = MemoryStore::new();
        let session = connect(&store).await;

        session
            .create("/jobs", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        session
            .create("/jobs/foo:1", b"v0".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(session.read("/jobs/foo:1").await.unwrap(), (b"v0".to_vec(), 0));

        let version = session
            .set_data("/jobs/foo:1", b"v1".to_vec(), Some(0))
            .await
            .unwrap();
        assert_eq!(version, Some(1));

        let err = session
            .set_data("/jobs/foo:1", b"v2".to_vec(), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::VersionMismatch {
                index: Some(0),
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_commit_markers_are_removed() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        assert!(store.child_names(COMMITS).is_empty());
    }

    #[tokio::test]
    async fn test_empty_transaction_is_noop() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        let before = store.node_count();
        let result = session.submit(Transaction::new()).await.unwrap();
        assert!(result.results.is_empty());
        assert_eq!(result.attempts, 0);
        assert_eq!(store.node_count(), before);
    }

    #[tokio::test]
    async fn test_drop_request_is_retried() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        store.inject_fault(session.session_id(), Fault::DropRequest);

        let result = session
            .submit(Transaction::new().append(Operation::create("/x")))
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert!(!result.recovered);
        assert!(store.node("/x").is_some());
    }

    #[tokio::test]
    async fn test_drop_response_is_recovered_by_marker() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session.ensure_path("/history/jobs/foo").await.unwrap();
        store.inject_fault(session.session_id(), Fault::DropResponse);

        let result = session
            .submit(
                Transaction::new()
                    .append(Operation::create("/y"))
                    .append(Operation::create_with_data("/history/jobs/foo/", "e").sequential()),
            )
            .await
            .unwrap();

        assert!(result.recovered);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.created_path(0), Some("/y"));
        assert_eq!(result.results[1], crate::OperationResult::Applied);

        // Applied exactly once
        assert_eq!(store.child_names("/history/jobs/foo").len(), 1);
        assert!(store.child_names(COMMITS).is_empty());
    }

    #[tokio::test]
    async fn test_last_attempt_applied_is_recovered() {
        let store = MemoryStore::new();
        let config = SessionConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                ..fast_config().retry
            },
            ..fast_config()
        };
        let session = CoordinationSession::connect(Arc::new(store.clone()), config)
            .await
            .unwrap();
        store.inject_fault(session.session_id(), Fault::DropRequest);
        store.inject_fault(session.session_id(), Fault::DropResponse);

        let result = session
            .submit(Transaction::new().append(Operation::create("/y")))
            .await
            .unwrap();
        assert!(result.recovered);
        assert_eq!(result.attempts, 2);
        assert!(store.node("/y").is_some());
        assert!(store.child_names(COMMITS).is_empty());
    }

    #[tokio::test]
    async fn test_last_attempt_dropped_is_not_applied() {
        let store = MemoryStore::new();
        let config = SessionConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                ..fast_config().retry
            },
            ..fast_config()
        };
        let session = CoordinationSession::connect(Arc::new(store.clone()), config)
            .await
            .unwrap();
        store.inject_fault(session.session_id(), Fault::DropRequest);
        store.inject_fault(session.session_id(), Fault::DropRequest);

        let err = session
            .submit(Transaction::new().append(Operation::create("/y")))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::CoordinationUnavailable {
                attempts: 2,
                outcome: Outcome::NotApplied
            }
        );
        assert!(store.node("/y").is_none());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        store.disconnect_session(session.session_id());

        let err = session.read("/").await.unwrap_err();
        assert_eq!(
            err,
            CoordinationError::CoordinationUnavailable {
                attempts: 3,
                outcome: Outcome::NotApplied
            }
        );

        let err = session
            .submit(Transaction::new().append(Operation::create("/z")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::CoordinationUnavailable {
                outcome: Outcome::Unknown,
                ..
            }
        ));
        assert!(store.node("/z").is_none());
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session.ensure_path("/status/agents").await.unwrap();
        session.ensure_path("/status/agents").await.unwrap();
        assert!(store.node("/status").is_some());
        assert!(store.node("/status/agents").is_some());
    }

    #[tokio::test]
    async fn test_expiry_bumps_generation() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        let mut status = session.subscribe_status();
        let first = session.session_id();

        store.expire_session(first);

        let reconnected = tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.generation == 2 && s.state == ConnectionState::Connected),
        )
        .await
        .unwrap()
        .map(|status| *status)
        .unwrap();
        assert_eq!(reconnected.generation, 2);
        assert_ne!(session.session_id(), first);
        assert!(session.exists("/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_suspended_then_connected() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
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
            status.wait_for(|s| s.state == ConnectionState::Connected && s.generation == 1),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_removes_ephemerals() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        session
            .create("/e", Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        session.close().await.unwrap();

        assert!(store.node("/e").is_none());
        assert!(session.status().closed);
        assert_eq!(session.read("/").await.unwrap_err(), CoordinationError::Closed);
        assert_eq!(
            session.wait_connected().await.unwrap_err(),
            CoordinationError::Closed
        );
    }
}
