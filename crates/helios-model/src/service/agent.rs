//! Agent-side coordination

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use helios_coordination::{
    AgentId, CoordinationError, CoordinationSession, CreateMode, PathLayout, TaskId, WatchKind,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registration::EphemeralRegistration;
use super::{read_assignments, read_record};
use crate::error::Result;
use crate::model::{AgentCapabilities, AgentRegistration, Task, TaskStatus, Versioned, encode};

/// Keeps an agent's status and config nodes present while it runs.
pub struct AgentRegistrar {
    agent: AgentId,
    registration: EphemeralRegistration,
}

impl AgentRegistrar {
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Remove the agent's nodes; the agent is reported down at once.
    pub async fn deregister(&self) -> Result<()> {
        self.registration.deregister().await?;
        info!(agent = %self.agent, "Agent deregistered");
        Ok(())
    }
}

/// An agent's view of its own subtree.
#[derive(Clone)]
pub struct AgentModel {
    session: CoordinationSession,
    agent: AgentId,
}

impl AgentModel {
    pub fn new(session: CoordinationSession, agent: AgentId) -> Self {
        Self { session, agent }
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Publish the agent's status and capabilities. Both nodes are restored
    /// automatically after the session is replaced.
    pub async fn register(
        &self,
        registration: &AgentRegistration,
        capabilities: &AgentCapabilities,
    ) -> Result<AgentRegistrar> {
        let status = PathLayout::agent_status(&self.agent);
        let config = PathLayout::agent_config(&self.agent);
        let nodes = vec![
            (status.clone(), encode(&status, registration)?),
            (config.clone(), encode(&config, capabilities)?),
        ];
        let registration = EphemeralRegistration::register(&self.session, nodes).await?;
        info!(agent = %self.agent, "Agent registered");
        Ok(AgentRegistrar {
            agent: self.agent.clone(),
            registration,
        })
    }

    pub async fn assigned_tasks(&self) -> Result<BTreeMap<TaskId, Versioned<Task>>> {
        read_assignments(&self.session, &self.agent).await
    }

    /// Call `callback` with the full desired state once now and again after
    /// every change to it. The callback runs on its own task.
    pub async fn watch_assignments<F>(&self, callback: F) -> Result<AssignmentWatch>
    where
        F: Fn(BTreeMap<TaskId, Task>) + Send + Sync + 'static,
    {
        let root = PathLayout::agent_assignments(&self.agent);
        self.session.ensure_path(&root).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let notify = tx.clone();
        let registration = self
            .session
            .dispatcher()
            .register_fn(&root, WatchKind::Children, move |_| {
                let _ = notify.send(());
            })
            .await?;

        let watcher = Arc::new(AssignmentWatcher {
            session: self.session.clone(),
            agent: self.agent.clone(),
            signal: tx,
            children_watch: registration.id(),
            task_watches: Mutex::new(HashMap::new()),
        });
        let _ = watcher.signal.send(());
        let task = tokio::spawn(run_assignment_watch(watcher.clone(), rx, callback));

        Ok(AssignmentWatch {
            watcher,
            task: Mutex::new(Some(task)),
        })
    }

    /// Create or update `/status/tasks/<agent>/<task>`.
    pub async fn report_task_status(&self, task: &TaskId, status: &TaskStatus) -> Result<()> {
        let path = PathLayout::task_status(&self.agent, task);
        let data = encode(&path, status)?;

        match self.session.set_data(&path, data.clone(), None).await {
            Ok(_) => {}
            Err(CoordinationError::NodeNotFound { .. }) => {
                self.session
                    .ensure_path(&PathLayout::agent_task_statuses(&self.agent))
                    .await?;
                match self
                    .session
                    .create(&path, data.clone(), CreateMode::Persistent)
                    .await
                {
                    Ok(()) => {}
                    Err(CoordinationError::NodeExists { .. }) => {
                        self.session.set_data(&path, data, None).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
        debug!(agent = %self.agent, task = %task, state = ?status.state, "Reported task status");
        Ok(())
    }

    pub async fn task_status(&self, task: &TaskId) -> Result<Option<TaskStatus>> {
        let path = PathLayout::task_status(&self.agent, task);
        Ok(read_record(&self.session, &path)
            .await?
            .map(|record: Versioned<TaskStatus>| record.value))
    }
}

struct AssignmentWatcher {
    session: CoordinationSession,
    agent: AgentId,
    signal: mpsc::UnboundedSender<()>,
    children_watch: u64,
    task_watches: Mutex<HashMap<TaskId, u64>>,
}

impl AssignmentWatcher {
    /// Keep one data watch per assigned task.
    async fn sync_task_watches(&self, tasks: &BTreeMap<TaskId, Versioned<Task>>) {
        let dispatcher = self.session.dispatcher();
        let added: Vec<TaskId> = {
            let mut watches = self.task_watches.lock();
            watches.retain(|task, id| {
                let keep = tasks.contains_key(task);
                if !keep {
                    dispatcher.unregister(*id);
                }
                keep
            });
            tasks
                .keys()
                .filter(|task| !watches.contains_key(*task))
                .cloned()
                .collect()
        };

        for task in added {
            let path = PathLayout::assignment(&self.agent, &task);
            let notify = self.signal.clone();
            match dispatcher
                .register_fn(&path, WatchKind::Data, move |_| {
                    let _ = notify.send(());
                })
                .await
            {
                Ok(registration) => {
                    let seen = tasks.get(&task).map(|record| record.version);
                    if registration.snapshot().data().map(|node| node.version) != seen {
                        let _ = self.signal.send(());
                    }
                    self.task_watches.lock().insert(task, registration.id());
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to watch assignment");
                    let _ = self.signal.send(());
                }
            }
        }
    }

    fn unregister_all(&self) {
        let dispatcher = self.session.dispatcher();
        dispatcher.unregister(self.children_watch);
        for (_, id) in self.task_watches.lock().drain() {
            dispatcher.unregister(id);
        }
    }
}

async fn run_assignment_watch<F>(
    watcher: Arc<AssignmentWatcher>,
    mut changed: mpsc::UnboundedReceiver<()>,
    callback: F,
) where
    F: Fn(BTreeMap<TaskId, Task>) + Send + Sync + 'static,
{
    let mut last: Option<BTreeMap<TaskId, Task>> = None;
    let mut failures = 0;
    while changed.recv().await.is_some() {
        while changed.try_recv().is_ok() {}

        let tasks = match read_assignments(&watcher.session, &watcher.agent).await {
            Ok(tasks) => tasks,
            Err(e) => {
                failures += 1;
                let delay = watcher.session.config().retry.calculate_delay(failures);
                warn!(agent = %watcher.agent, error = %e, ?delay, "Failed to read assignments");
                if watcher.session.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
                let _ = watcher.signal.send(());
                continue;
            }
        };
        failures = 0;
        watcher.sync_task_watches(&tasks).await;

        let desired: BTreeMap<TaskId, Task> = tasks
            .into_iter()
            .map(|(task, record)| (task, record.value))
            .collect();
        if last.as_ref() != Some(&desired) {
            debug!(agent = %watcher.agent, tasks = desired.len(), "Assignments changed");
            callback(desired.clone());
            last = Some(desired);
        }
    }
}

/// Handle of a running assignment watch; dropping it stops the watch.
pub struct AssignmentWatch {
    watcher: Arc<AssignmentWatcher>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AssignmentWatch {
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.watcher.unregister_all();
    }
}

impl Drop for AssignmentWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}
