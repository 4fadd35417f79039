//! Agent process: registration and desired-state tracking

use std::collections::BTreeMap;
use std::sync::Arc;

use helios_coordination::{AgentId, CoordinationSession, TaskId};
use helios_model::{
    AgentCapabilities, AgentModel, AgentRegistrar, AgentRegistration, AssignmentWatch, Result,
    Task,
};
use parking_lot::Mutex;
use tracing::info;

use crate::config::local_hostname;
use crate::metrics;

pub struct AgentNode {
    model: AgentModel,
    registrar: AgentRegistrar,
    watch: AssignmentWatch,
    desired: Arc<Mutex<BTreeMap<TaskId, Task>>>,
}

impl AgentNode {
    /// Publish the agent's status and capabilities and follow its assignments.
    pub async fn start(
        session: CoordinationSession,
        id: AgentId,
        capabilities: AgentCapabilities,
    ) -> Result<Self> {
        let model = AgentModel::new(session, id.clone());
        let registration = AgentRegistration {
            hostname: local_hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
        };
        let registrar = model.register(&registration, &capabilities).await?;

        let desired = Arc::new(Mutex::new(BTreeMap::new()));
        let watch = model
            .watch_assignments({
                let desired = desired.clone();
                move |tasks| {
                    let mut current = desired.lock();
                    log_assignment_changes(&id, &current, &tasks);
                    metrics::record_assignment_update();
                    *current = tasks;
                }
            })
            .await?;

        info!(agent = %model.agent(), "Agent started");
        Ok(Self {
            model,
            registrar,
            watch,
            desired,
        })
    }

    pub fn id(&self) -> &AgentId {
        self.model.agent()
    }

    pub fn model(&self) -> &AgentModel {
        &self.model
    }

    /// Desired state as last delivered by the assignment watch.
    pub fn desired_tasks(&self) -> BTreeMap<TaskId, Task> {
        self.desired.lock().clone()
    }

    /// Stop following assignments and remove the registration.
    pub async fn stop(self) -> Result<()> {
        self.watch.cancel();
        self.registrar.deregister().await?;
        info!(agent = %self.model.agent(), "Agent stopped");
        Ok(())
    }
}

fn log_assignment_changes(
    agent: &AgentId,
    previous: &BTreeMap<TaskId, Task>,
    current: &BTreeMap<TaskId, Task>,
) {
    for (task, assignment) in current {
        match previous.get(task) {
            None => info!(
                agent = %agent,
                task = %task,
                job = %assignment.job,
                goal = %assignment.goal,
                "Task assigned"
            ),
            Some(before) if before.goal != assignment.goal => info!(
                agent = %agent,
                task = %task,
                from = %before.goal,
                to = %assignment.goal,
                "Task goal changed"
            ),
            Some(_) => {}
        }
    }
    for task in previous.keys().filter(|task| !current.contains_key(*task)) {
        info!(agent = %agent, task = %task, "Task unassigned");
    }
}
