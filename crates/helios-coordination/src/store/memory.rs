//! In-memory coordination store
//!
//! A single-process stand-in for the external ensemble, used by the standalone
//! server and by tests. Node semantics follow the usual hierarchical store
//! rules:
//! - a node can only be created under an existing, non-ephemeral parent
//! - a node with children cannot be deleted
//! - every data write bumps the node version, every child create/delete bumps
//!   the parent's child version (which also numbers sequential nodes)
//! - watches are one-shot and are dropped once fired
//!
//! Faults can be injected per session to exercise retry paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    CoordinationStore, CreateMode, EventReceiver, EventType, NodeStat, OpResult, SessionEvent,
    SessionId, StoreClient, StoreError, StoreEvent, StoreOp, StoreResult, Version, WatchedEvent,
};

/// Injectable failure for the next multi commit of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with connection loss before the commit reaches the store
    DropRequest,
    /// Apply the commit, then lose the acknowledgement
    DropResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct SessionEntry {
    events: mpsc::UnboundedSender<StoreEvent>,
    liveness: Liveness,
    timeout: Duration,
    faults: VecDeque<Fault>,
}

#[derive(Clone)]
struct StoredNode {
    data: Vec<u8>,
    stat: NodeStat,
    children: BTreeSet<String>,
}

impl StoredNode {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>, created: u64) -> Self {
        Self {
            data,
            stat: NodeStat {
                ephemeral_owner,
                created,
                ..Default::default()
            },
            children: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchTarget {
    Data,
    Child,
}

struct Trigger {
    target: WatchTarget,
    path: String,
    event_type: EventType,
}

struct Ensemble {
    nodes: BTreeMap<String, StoredNode>,
    sessions: HashMap<SessionId, SessionEntry>,
    data_watches: HashMap<String, HashSet<SessionId>>,
    child_watches: HashMap<String, HashSet<SessionId>>,
    next_session_id: SessionId,
    last_txid: u64,
}

impl Ensemble {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), StoredNode::new(Vec::new(), None, 0));
        Self {
            nodes,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            next_session_id: 0x1000,
            last_txid: 0,
        }
    }

    fn check_session(&self, session: SessionId) -> StoreResult<()> {
        match self.sessions.get(&session).map(|s| s.liveness) {
            Some(Liveness::Connected) => Ok(()),
            Some(Liveness::Disconnected) => Err(StoreError::ConnectionLoss),
            Some(Liveness::Closed) => Err(StoreError::Closed),
            Some(Liveness::Expired) | None => Err(StoreError::SessionExpired),
        }
    }

    fn send(&self, session: SessionId, event: StoreEvent) {
        if let Some(entry) = self.sessions.get(&session)
            && matches!(entry.liveness, Liveness::Connected | Liveness::Disconnected)
        {
            let _ = entry.events.send(event);
        }
    }

    fn fire(&mut self, triggers: Vec<Trigger>) {
        for trigger in triggers {
            let watchers = match trigger.target {
                WatchTarget::Data => self.data_watches.remove(&trigger.path),
                WatchTarget::Child => self.child_watches.remove(&trigger.path),
            };
            for session in watchers.into_iter().flatten() {
                self.send(
                    session,
                    StoreEvent::Watch(WatchedEvent {
                        event_type: trigger.event_type,
                        path: trigger.path.clone(),
                    }),
                );
            }
        }
    }

    /// Connection dropped and re-established on the same session.
    fn bounce(&self, session: SessionId) {
        self.send(session, StoreEvent::Session(SessionEvent::Disconnected));
        self.send(session, StoreEvent::Session(SessionEvent::Connected));
    }

    fn end_session(&mut self, session: SessionId, liveness: Liveness) {
        let Some(entry) = self.sessions.get(&session) else {
            return;
        };
        if matches!(entry.liveness, Liveness::Expired | Liveness::Closed) {
            return;
        }

        for watchers in self.data_watches.values_mut() {
            watchers.remove(&session);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.remove(&session);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        let mut triggers = Vec::new();
        for path in &owned {
            if let Err(e) = apply_delete(&mut self.nodes, path, None, &mut triggers) {
                debug!(session, path = %path, error = %e, "Failed to remove ephemeral node");
            }
        }

        if liveness == Liveness::Expired {
            self.send(session, StoreEvent::Session(SessionEvent::Expired));
        }
        if let Some(entry) = self.sessions.get_mut(&session) {
            entry.liveness = liveness;
        }
        self.fire(triggers);

        info!(
            session,
            ephemeral_nodes = owned.len(),
            state = ?liveness,
            "Store session ended"
        );
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    let invalid = || StoreError::InvalidPath {
        path: path.to_string(),
    };
    if !path.starts_with('/') {
        return Err(invalid());
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid());
    }
    if path[1..]
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

/// Split at the last separator: `/a/b` -> (`/a`, `b`), `/a` -> (`/`, `a`).
fn split_parent(path: &str) -> Option<(&str, &str)> {
    let index = path.rfind('/')?;
    let parent = if index == 0 { "/" } else { &path[..index] };
    if path == "/" {
        return None;
    }
    Some((parent, &path[index + 1..]))
}

fn apply_create(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    data: Vec<u8>,
    mode: CreateMode,
    session: SessionId,
    txid: u64,
    triggers: &mut Vec<Trigger>,
) -> StoreResult<OpResult> {
    if !mode.is_sequential() {
        validate_path(path)?;
    }
    let (parent, _) = split_parent(path).ok_or_else(|| StoreError::NodeExists {
        path: path.to_string(),
    })?;
    let parent = parent.to_string();

    let actual = {
        let parent_node = nodes.get(&parent).ok_or_else(|| StoreError::NoNode {
            path: path.to_string(),
        })?;
        if parent_node.stat.ephemeral_owner.is_some() {
            return Err(StoreError::NoChildrenForEphemerals { path: parent });
        }
        if mode.is_sequential() {
            format!("{}{:010}", path, parent_node.stat.child_version)
        } else {
            path.to_string()
        }
    };
    validate_path(&actual)?;
    if nodes.contains_key(&actual) {
        return Err(StoreError::NodeExists { path: actual });
    }

    if let Some(parent_node) = nodes.get_mut(&parent) {
        let name = actual[actual.rfind('/').map_or(0, |i| i + 1)..].to_string();
        parent_node.children.insert(name);
        parent_node.stat.child_version += 1;
        parent_node.stat.num_children = parent_node.children.len() as u32;
    }
    let owner = mode.is_ephemeral().then_some(session);
    nodes.insert(actual.clone(), StoredNode::new(data, owner, txid));

    triggers.push(Trigger {
        target: WatchTarget::Data,
        path: actual.clone(),
        event_type: EventType::NodeCreated,
    });
    triggers.push(Trigger {
        target: WatchTarget::Child,
        path: parent,
        event_type: EventType::NodeChildrenChanged,
    });

    Ok(OpResult::Created { path: actual })
}

fn check_version(path: &str, expected: Option<Version>, actual: Version) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn apply_set(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    data: Vec<u8>,
    version: Option<Version>,
    triggers: &mut Vec<Trigger>,
) -> StoreResult<OpResult> {
    validate_path(path)?;
    let node = nodes.get_mut(path).ok_or_else(|| StoreError::NoNode {
        path: path.to_string(),
    })?;
    check_version(path, version, node.stat.version)?;
    node.data = data;
    node.stat.version += 1;
    triggers.push(Trigger {
        target: WatchTarget::Data,
        path: path.to_string(),
        event_type: EventType::NodeDataChanged,
    });
    Ok(OpResult::SetData { stat: node.stat })
}

fn apply_delete(
    nodes: &mut BTreeMap<String, StoredNode>,
    path: &str,
    version: Option<Version>,
    triggers: &mut Vec<Trigger>,
) -> StoreResult<OpResult> {
    validate_path(path)?;
    let (parent, name) = split_parent(path).ok_or_else(|| StoreError::InvalidPath {
        path: path.to_string(),
    })?;
    let node = nodes.get(path).ok_or_else(|| StoreError::NoNode {
        path: path.to_string(),
    })?;
    check_version(path, version, node.stat.version)?;
    if !node.children.is_empty() {
        return Err(StoreError::NotEmpty {
            path: path.to_string(),
        });
    }

    nodes.remove(path);
    if let Some(parent_node) = nodes.get_mut(parent) {
        parent_node.children.remove(name);
        parent_node.stat.child_version += 1;
        parent_node.stat.num_children = parent_node.children.len() as u32;
    }

    for target in [WatchTarget::Data, WatchTarget::Child] {
        triggers.push(Trigger {
            target,
            path: path.to_string(),
            event_type: EventType::NodeDeleted,
        });
    }
    triggers.push(Trigger {
        target: WatchTarget::Child,
        path: parent.to_string(),
        event_type: EventType::NodeChildrenChanged,
    });
    Ok(OpResult::Deleted)
}

fn apply_op(
    nodes: &mut BTreeMap<String, StoredNode>,
    op: StoreOp,
    session: SessionId,
    txid: u64,
    triggers: &mut Vec<Trigger>,
) -> StoreResult<OpResult> {
    match op {
        StoreOp::Create { path, data, mode } => {
            apply_create(nodes, &path, data, mode, session, txid, triggers)
        }
        StoreOp::SetData {
            path,
            data,
            version,
        } => apply_set(nodes, &path, data, version, triggers),
        StoreOp::Delete { path, version } => apply_delete(nodes, &path, version, triggers),
        StoreOp::Check { path, version } => {
            validate_path(&path)?;
            let node = nodes
                .get(&path)
                .ok_or_else(|| StoreError::NoNode { path: path.clone() })?;
            check_version(&path, Some(version), node.stat.version)?;
            Ok(OpResult::Checked)
        }
    }
}

/// In-process coordination store shared by every session connected to it.
#[derive(Clone)]
pub struct MemoryStore {
    ensemble: Arc<Mutex<Ensemble>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            ensemble: Arc::new(Mutex::new(Ensemble::new())),
        }
    }

    /// Expire a session now: its ephemeral nodes and watches are removed and
    /// the owner receives `SessionEvent::Expired`.
    pub fn expire_session(&self, session: SessionId) {
        self.ensemble.lock().end_session(session, Liveness::Expired);
    }

    /// Drop the session's connection; requests fail with connection loss
    /// until [`MemoryStore::reconnect_session`].
    pub fn disconnect_session(&self, session: SessionId) {
        let mut ensemble = self.ensemble.lock();
        if let Some(entry) = ensemble.sessions.get_mut(&session)
            && entry.liveness == Liveness::Connected
        {
            entry.liveness = Liveness::Disconnected;
            let _ = entry
                .events
                .send(StoreEvent::Session(SessionEvent::Disconnected));
        }
    }

    pub fn reconnect_session(&self, session: SessionId) {
        let mut ensemble = self.ensemble.lock();
        if let Some(entry) = ensemble.sessions.get_mut(&session)
            && entry.liveness == Liveness::Disconnected
        {
            entry.liveness = Liveness::Connected;
            let _ = entry
                .events
                .send(StoreEvent::Session(SessionEvent::Connected));
        }
    }

    /// Simulate the owning process dying without closing its session: the
    /// session stops heartbeating and expires once its timeout elapses.
    pub fn abandon_session(&self, session: SessionId) {
        let timeout = {
            let mut ensemble = self.ensemble.lock();
            let Some(entry) = ensemble.sessions.get_mut(&session) else {
                return;
            };
            entry.liveness = Liveness::Disconnected;
            entry.timeout
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    store.expire_session(session);
                });
            }
            Err(_) => self.expire_session(session),
        }
    }

    /// Queue a fault for the session's next multi commit.
    pub fn inject_fault(&self, session: SessionId, fault: Fault) {
        if let Some(entry) = self.ensemble.lock().sessions.get_mut(&session) {
            entry.faults.push_back(fault);
        }
    }

    /// Sessions that have not expired or been closed.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let ensemble = self.ensemble.lock();
        let mut ids: Vec<SessionId> = ensemble
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.liveness, Liveness::Connected | Liveness::Disconnected))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Out-of-band read, bypassing sessions and watches.
    pub fn node(&self, path: &str) -> Option<(Vec<u8>, NodeStat)> {
        self.ensemble
            .lock()
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat))
    }

    /// Out-of-band child listing, bypassing sessions and watches.
    pub fn child_names(&self, path: &str) -> Vec<String> {
        self.ensemble
            .lock()
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node_count(&self) -> usize {
        self.ensemble.lock().nodes.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> StoreResult<(Arc<dyn StoreClient>, EventReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = {
            let mut ensemble = self.ensemble.lock();
            ensemble.next_session_id += 1;
            let session = ensemble.next_session_id;
            let _ = tx.send(StoreEvent::Session(SessionEvent::Connected));
            ensemble.sessions.insert(
                session,
                SessionEntry {
                    events: tx,
                    liveness: Liveness::Connected,
                    timeout: session_timeout,
                    faults: VecDeque::new(),
                },
            );
            session
        };

        debug!(session, "Opened in-memory store session");

        let client = MemoryClient {
            ensemble: self.ensemble.clone(),
            session,
        };
        Ok((Arc::new(client), rx))
    }
}

struct MemoryClient {
    ensemble: Arc<Mutex<Ensemble>>,
    session: SessionId,
}

#[async_trait]
impl StoreClient for MemoryClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    async fn get(&self, path: &str, watch: bool) -> StoreResult<(Vec<u8>, NodeStat)> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check_session(self.session)?;
        validate_path(path)?;
        let (data, stat) = ensemble
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat))
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })?;
        if watch {
            ensemble
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session);
        }
        Ok((data, stat))
    }

    async fn exists(&self, path: &str, watch: bool) -> StoreResult<Option<NodeStat>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check_session(self.session)?;
        validate_path(path)?;
        if watch {
            ensemble
                .data_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session);
        }
        Ok(ensemble.nodes.get(path).map(|node| node.stat))
    }

    async fn children(&self, path: &str, watch: bool) -> StoreResult<Vec<String>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check_session(self.session)?;
        validate_path(path)?;
        let children: Vec<String> = ensemble
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| StoreError::NoNode {
                path: path.to_string(),
            })?;
        if watch {
            ensemble
                .child_watches
                .entry(path.to_string())
                .or_default()
                .insert(self.session);
        }
        Ok(children)
    }

    async fn multi(&self, ops: Vec<StoreOp>) -> StoreResult<Vec<OpResult>> {
        let mut ensemble = self.ensemble.lock();
        ensemble.check_session(self.session)?;

        let fault = ensemble
            .sessions
            .get_mut(&self.session)
            .and_then(|entry| entry.faults.pop_front());
        if fault == Some(Fault::DropRequest) {
            ensemble.bounce(self.session);
            return Err(StoreError::ConnectionLoss);
        }

        let txid = ensemble.last_txid + 1;
        let mut staged = ensemble.nodes.clone();
        let mut triggers = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            match apply_op(&mut staged, op, self.session, txid, &mut triggers) {
                Ok(result) => results.push(result),
                Err(e) => {
                    return Err(StoreError::Multi {
                        index,
                        source: Box::new(e),
                    });
                }
            }
        }
        ensemble.nodes = staged;
        ensemble.last_txid = txid;
        ensemble.fire(triggers);

        if fault == Some(Fault::DropResponse) {
            ensemble.bounce(self.session);
            return Err(StoreError::ConnectionLoss);
        }
        Ok(results)
    }

    async fn sync(&self, _path: &str) -> StoreResult<()> {
        self.ensemble.lock().check_session(self.session)
    }

    async fn close(&self) -> StoreResult<()> {
        self.ensemble
            .lock()
            .end_session(self.session, Liveness::Closed);
        Ok(())
    }
}
