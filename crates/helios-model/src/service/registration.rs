//! Self-healing ephemeral registrations
//!
//! An ephemeral node disappears with the session that created it. A
//! registration watches its own nodes and creates them again whenever they
//! are gone: after the session is lost and replaced, or when another process
//! deletes them.

use std::sync::Arc;

use helios_coordination::paths;
use helios_coordination::{CoordinationError, CoordinationSession, CreateMode, WatchKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

struct RegistrationInner {
    session: CoordinationSession,
    nodes: Vec<(String, Vec<u8>)>,
}

impl RegistrationInner {
    async fn create_missing(&self) -> std::result::Result<(), CoordinationError> {
        for (path, data) in &self.nodes {
            if let Some(parent) = paths::parent(path) {
                self.session.ensure_path(parent).await?;
            }
            match self
                .session
                .create(path, data.clone(), CreateMode::Ephemeral)
                .await
            {
                Ok(()) => info!(path = %path, "Registered ephemeral node"),
                Err(CoordinationError::NodeExists { .. }) => {
                    // A node left by an earlier session is removed when that
                    // session expires, which fires the watch again
                    if let Some(stat) = self.session.exists(path).await?
                        && stat.ephemeral_owner != Some(self.session.session_id())
                    {
                        debug!(path = %path, owner = ?stat.ephemeral_owner, "Node held by another session");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// A set of ephemeral nodes kept present for the lifetime of the registration.
pub struct EphemeralRegistration {
    inner: Arc<RegistrationInner>,
    watches: Vec<u64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EphemeralRegistration {
    /// Create the nodes (and any missing parents) and start maintaining them.
    pub async fn register(
        session: &CoordinationSession,
        nodes: Vec<(String, Vec<u8>)>,
    ) -> Result<Self> {
        let inner = Arc::new(RegistrationInner {
            session: session.clone(),
            nodes,
        });
        inner.create_missing().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watches = Vec::with_capacity(inner.nodes.len());
        for (path, _) in &inner.nodes {
            let notify = tx.clone();
            let registration = session
                .dispatcher()
                .register_fn(path, WatchKind::Data, move |notification| {
                    if !notification.snapshot.exists() {
                        let _ = notify.send(());
                    }
                })
                .await?;
            if !registration.snapshot().exists() {
                let _ = tx.send(());
            }
            watches.push(registration.id());
        }

        let task = tokio::spawn(maintain(inner.clone(), rx));
        Ok(Self {
            inner,
            watches,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.inner.nodes.iter().map(|(path, _)| path.as_str())
    }

    /// Stop maintaining the nodes and delete them.
    pub async fn deregister(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let dispatcher = self.inner.session.dispatcher();
        for id in &self.watches {
            dispatcher.unregister(*id);
        }
        for (path, _) in &self.inner.nodes {
            match self.inner.session.delete(path, None).await {
                Ok(()) | Err(CoordinationError::NodeNotFound { .. }) => {}
                Err(CoordinationError::Closed | CoordinationError::SessionExpired) => break,
                Err(e) => return Err(e.into()),
            }
            info!(path = %path, "Deregistered ephemeral node");
        }
        Ok(())
    }
}

impl Drop for EphemeralRegistration {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        let dispatcher = self.inner.session.dispatcher();
        for id in &self.watches {
            dispatcher.unregister(*id);
        }
    }
}

async fn maintain(inner: Arc<RegistrationInner>, mut missing: mpsc::UnboundedReceiver<()>) {
    while missing.recv().await.is_some() {
        while missing.try_recv().is_ok() {}

        let mut attempt = 0;
        loop {
            match inner.create_missing().await {
                Ok(()) => break,
                Err(CoordinationError::Closed) => return,
                Err(e) => {
                    attempt += 1;
                    let delay = inner.session.config().retry.calculate_delay(attempt);
                    warn!(error = %e, attempt, ?delay, "Failed to restore ephemeral nodes");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
