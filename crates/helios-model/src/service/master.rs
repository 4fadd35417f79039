//! Master-side coordination
//!
//! Job lifecycle, deployments and cluster views. Every multi-node change is a
//! single transaction, guarded by the versions it was computed from.

use std::collections::{BTreeMap, BTreeSet};

use helios_coordination::paths::{self, AGENT_STATUS, ASSIGNMENTS, JOBS};
use helios_coordination::{
    AgentId, CoordinationError, CoordinationSession, EventSeq, JobId, MasterId, Operation,
    PathLayout, TaskId, Transaction, Version,
};
use tracing::{debug, info, warn};

use super::registration::EphemeralRegistration;
use super::{children_or_empty, read_assignments, read_record};
use crate::error::{ModelError, Result};
use crate::model::{
    AgentCapabilities, AgentRegistration, AgentState, Goal, HistoryEntry, Job, JobEvent,
    JobEventKind, MasterRegistration, Task, TaskStatus, Versioned, decode, encode, now_millis,
};

/// Attempts for actions that re-read and recompute after a concurrent change
const CONFLICT_ATTEMPTS: usize = 3;

fn history_op(job: &JobId, kind: JobEventKind) -> Result<Operation> {
    let prefix = PathLayout::job_event_prefix(job);
    let data = encode(&prefix, &JobEvent::new(kind))?;
    Ok(Operation::create_with_data(prefix, data).sequential())
}

/// Master view of the cluster.
#[derive(Clone)]
pub struct MasterModel {
    session: CoordinationSession,
}

impl MasterModel {
    pub fn new(session: CoordinationSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &CoordinationSession {
        &self.session
    }

    /// Create the persistent roots of the namespace.
    pub async fn init(&self) -> Result<()> {
        for root in PathLayout::ROOTS {
            self.session.ensure_path(root).await?;
        }
        Ok(())
    }

    /// Announce this master under `/status/masters`.
    pub async fn register_master(
        &self,
        name: &MasterId,
        registration: &MasterRegistration,
    ) -> Result<EphemeralRegistration> {
        let path = PathLayout::master_status(name);
        let data = encode(&path, registration)?;
        EphemeralRegistration::register(&self.session, vec![(path, data)]).await
    }

    /// Names of the registered masters.
    pub async fn list_masters(&self) -> Result<Vec<MasterId>> {
        let names = children_or_empty(&self.session, paths::MASTER_STATUS).await?;
        Ok(names
            .into_iter()
            .filter_map(|name| MasterId::new(name).ok())
            .collect())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn add_job(&self, mut job: Job) -> Result<()> {
        job.validate()?;
        job.created.get_or_insert_with(now_millis);

        let path = PathLayout::job(&job.id);
        let data = encode(&path, &job)?;
        let result = Transaction::new()
            .append(Operation::create_with_data(path, data))
            .append(Operation::create(PathLayout::job_hosts(&job.id)))
            .append(Operation::create(PathLayout::job_history(&job.id)))
            .append(history_op(&job.id, JobEventKind::Created)?)
            .commit(&self.session)
            .await;

        match result {
            Ok(_) => {
                info!(job = %job.id, image = %job.image, "Added job");
                Ok(())
            }
            Err(CoordinationError::NodeExists { index: Some(0), .. }) => {
                Err(ModelError::JobExists(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Versioned<Job>> {
        read_record(&self.session, &PathLayout::job(id))
            .await?
            .ok_or_else(|| ModelError::JobNotFound(id.clone()))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobId>> {
        let mut jobs = Vec::new();
        for name in children_or_empty(&self.session, JOBS).await? {
            match JobId::new(name.as_str()) {
                Ok(id) => jobs.push(id),
                Err(_) => warn!(name = %name, "Ignoring malformed job node"),
            }
        }
        Ok(jobs)
    }

    /// Agents the job is deployed on.
    pub async fn job_hosts(&self, id: &JobId) -> Result<Vec<AgentId>> {
        match self.session.children(&PathLayout::job_hosts(id)).await {
            Ok(names) => Ok(names
                .into_iter()
                .filter_map(|name| AgentId::new(name).ok())
                .collect()),
            Err(CoordinationError::NodeNotFound { .. }) => Err(ModelError::JobNotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a job that is no longer deployed anywhere, together with its
    /// history.
    pub async fn remove_job(&self, id: &JobId) -> Result<()> {
        let mut last = None;
        for _ in 0..CONFLICT_ATTEMPTS {
            let job = self.get_job(id).await?;
            let history = PathLayout::job_history(id);
            let events = children_or_empty(&self.session, &history).await?;

            let mut transaction =
                Transaction::new().append(Operation::delete(PathLayout::job_hosts(id)));
            for event in &events {
                transaction.push(Operation::delete(paths::join(&history, event)));
            }
            transaction.push(Operation::delete(history));
            transaction.push(Operation::delete_with_version(PathLayout::job(id), job.version));
            let job_index = transaction.len() - 1;

            match transaction.commit(&self.session).await {
                Ok(_) => {
                    info!(job = %id, events = events.len(), "Removed job");
                    return Ok(());
                }
                Err(CoordinationError::NotEmpty { index: Some(0), .. }) => {
                    return Err(ModelError::JobStillDeployed {
                        job: id.clone(),
                        agents: self.job_hosts(id).await?,
                    });
                }
                Err(CoordinationError::NodeNotFound { index: Some(i), .. }) if i == job_index => {
                    return Err(ModelError::JobNotFound(id.clone()));
                }
                Err(e) if e.is_conflict() => {
                    debug!(job = %id, error = %e, "Job changed during removal, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last.map_or_else(|| ModelError::JobNotFound(id.clone()), Into::into))
    }

    // ========================================================================
    // Deployments
    // ========================================================================

    /// Deploy `job` to `agent` at the job's current version. The task id is
    /// the job id; a job runs at most once per agent.
    pub async fn deploy_job(&self, agent: &AgentId, job: &JobId, goal: Goal) -> Result<TaskId> {
        let version = self.get_job(job).await?.version;
        self.deploy_job_at(agent, job, goal, version).await
    }

    /// Deploy `job` to `agent` only while the job definition is still at
    /// `job_version`.
    pub async fn deploy_job_at(
        &self,
        agent: &AgentId,
        job: &JobId,
        goal: Goal,
        job_version: Version,
    ) -> Result<TaskId> {
        let task = TaskId::new(job.as_str())?;
        let assignments = PathLayout::agent_assignments(agent);
        let assignment = PathLayout::assignment(agent, &task);
        let data = encode(&assignment, &Task::new(job.clone(), goal))?;

        let mut create_parent = self.session.exists(&assignments).await?.is_none();
        loop {
            let mut transaction = Transaction::new()
                .append(Operation::check_version(PathLayout::job(job), job_version));
            if create_parent {
                transaction.push(Operation::create(assignments.clone()));
            }
            let assignment_index = transaction.len();
            transaction.push(Operation::create_with_data(assignment.clone(), data.clone()));
            transaction.push(Operation::create(PathLayout::job_host(job, agent)));
            transaction.push(history_op(
                job,
                JobEventKind::Deployed {
                    agent: agent.clone(),
                    task: task.clone(),
                    goal,
                },
            )?);

            match transaction.commit(&self.session).await {
                Ok(_) => {
                    info!(job = %job, agent = %agent, %goal, "Deployed job");
                    return Ok(task);
                }
                Err(CoordinationError::NodeNotFound { index: Some(0), .. }) => {
                    return Err(ModelError::JobNotFound(job.clone()));
                }
                // Another master created the agent's assignment root first
                Err(CoordinationError::NodeExists { index: Some(1), .. }) if create_parent => {
                    create_parent = false;
                }
                Err(CoordinationError::NodeExists { index: Some(i), .. })
                    if i == assignment_index || i == assignment_index + 1 =>
                {
                    return Err(ModelError::TaskAlreadyAssigned {
                        agent: agent.clone(),
                        task,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Change the goal of an assigned task, guarded by the assignment version.
    /// Returns the new assignment version.
    pub async fn set_goal(
        &self,
        agent: &AgentId,
        task: &TaskId,
        goal: Goal,
        version: Version,
    ) -> Result<Version> {
        let path = PathLayout::assignment(agent, task);
        let current = read_record::<Task>(&self.session, &path)
            .await?
            .ok_or_else(|| not_assigned(agent, task))?;

        let updated = Task::new(current.value.job.clone(), goal);
        let data = encode(&path, &updated)?;
        let result = Transaction::new()
            .append(Operation::set_data_with_version(path, data, version))
            .append(history_op(
                &updated.job,
                JobEventKind::GoalChanged {
                    agent: agent.clone(),
                    task: task.clone(),
                    goal,
                },
            )?)
            .commit(&self.session)
            .await
            .map_err(|e| match e {
                CoordinationError::NodeNotFound { index: Some(0), .. } => not_assigned(agent, task),
                e => e.into(),
            })?;

        info!(agent = %agent, task = %task, %goal, "Changed task goal");
        Ok(result.updated_version(0).unwrap_or(version + 1))
    }

    /// Remove an assignment. Returns the removed task.
    pub async fn undeploy(&self, agent: &AgentId, task: &TaskId) -> Result<Task> {
        let path = PathLayout::assignment(agent, task);
        let mut last = None;
        for _ in 0..CONFLICT_ATTEMPTS {
            let current = read_record::<Task>(&self.session, &path)
                .await?
                .ok_or_else(|| not_assigned(agent, task))?;
            let job = &current.value.job;

            let result = Transaction::new()
                .append(Operation::delete_with_version(path.clone(), current.version))
                .append(Operation::delete(PathLayout::job_host(job, agent)))
                .append(history_op(
                    job,
                    JobEventKind::Undeployed {
                        agent: agent.clone(),
                        task: task.clone(),
                    },
                )?)
                .commit(&self.session)
                .await;

            match result {
                Ok(_) => {
                    info!(agent = %agent, task = %task, job = %job, "Undeployed task");
                    return Ok(current.value);
                }
                Err(CoordinationError::NodeNotFound { index: Some(0), .. }) => {
                    return Err(not_assigned(agent, task));
                }
                Err(e @ CoordinationError::VersionMismatch { index: Some(0), .. }) => {
                    debug!(agent = %agent, task = %task, "Assignment changed during undeploy, retrying");
                    last = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last.map_or_else(|| not_assigned(agent, task), Into::into))
    }

    pub async fn assigned_tasks(&self, agent: &AgentId) -> Result<BTreeMap<TaskId, Versioned<Task>>> {
        read_assignments(&self.session, agent).await
    }

    // ========================================================================
    // Agents
    // ========================================================================

    /// Agents that are up or still have assignments.
    pub async fn list_agents(&self) -> Result<Vec<AgentId>> {
        let mut agents = BTreeSet::new();
        for root in [AGENT_STATUS, ASSIGNMENTS] {
            for name in children_or_empty(&self.session, root).await? {
                if let Ok(agent) = AgentId::new(name) {
                    agents.insert(agent);
                }
            }
        }
        Ok(agents.into_iter().collect())
    }

    pub async fn agent_status(&self, agent: &AgentId) -> Result<AgentState> {
        if self
            .session
            .exists(&PathLayout::agent_status(agent))
            .await?
            .is_some()
        {
            return Ok(AgentState::Up);
        }
        if self
            .session
            .exists(&PathLayout::agent_assignments(agent))
            .await?
            .is_some()
        {
            return Ok(AgentState::Down);
        }
        Err(ModelError::AgentNotFound(agent.clone()))
    }

    /// Registration payload of an agent that is up.
    pub async fn agent_registration(&self, agent: &AgentId) -> Result<AgentRegistration> {
        read_record(&self.session, &PathLayout::agent_status(agent))
            .await?
            .map(|record: Versioned<AgentRegistration>| record.value)
            .ok_or_else(|| ModelError::AgentNotFound(agent.clone()))
    }

    pub async fn agent_config(&self, agent: &AgentId) -> Result<AgentCapabilities> {
        read_record(&self.session, &PathLayout::agent_config(agent))
            .await?
            .map(|record: Versioned<AgentCapabilities>| record.value)
            .ok_or_else(|| ModelError::AgentNotFound(agent.clone()))
    }

    /// Task statuses reported by an agent.
    pub async fn task_statuses(&self, agent: &AgentId) -> Result<BTreeMap<TaskId, TaskStatus>> {
        let root = PathLayout::agent_task_statuses(agent);
        let mut statuses = BTreeMap::new();
        for name in children_or_empty(&self.session, &root).await? {
            let Ok(task) = TaskId::new(name.as_str()) else {
                continue;
            };
            if let Some(record) =
                read_record::<TaskStatus>(&self.session, &PathLayout::task_status(agent, &task))
                    .await?
            {
                statuses.insert(task, record.value);
            }
        }
        Ok(statuses)
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Append an event to the job's history. The sequence is `None` when the
    /// commit was only confirmed after its acknowledgement was lost.
    pub async fn append_history(&self, job: &JobId, kind: JobEventKind) -> Result<Option<EventSeq>> {
        let result = Transaction::new()
            .append(history_op(job, kind)?)
            .commit(&self.session)
            .await
            .map_err(|e| match e {
                CoordinationError::NodeNotFound { .. } => ModelError::JobNotFound(job.clone()),
                e => e.into(),
            })?;

        Ok(result
            .created_path(0)
            .and_then(|path| path.rsplit('/').next())
            .and_then(|name| name.parse().ok()))
    }

    /// Job history, oldest first.
    pub async fn job_history(&self, job: &JobId) -> Result<Vec<HistoryEntry>> {
        let root = PathLayout::job_history(job);
        let names = match self.session.children(&root).await {
            Ok(names) => names,
            Err(CoordinationError::NodeNotFound { .. }) => {
                return Err(ModelError::JobNotFound(job.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Ok(seq) = name.parse::<EventSeq>() else {
                warn!(job = %job, name = %name, "Ignoring malformed history node");
                continue;
            };
            let path = paths::join(&root, &name);
            match self.session.read(&path).await {
                Ok((data, _)) => entries.push(HistoryEntry {
                    seq,
                    event: decode(&path, &data)?,
                }),
                Err(CoordinationError::NodeNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        entries.sort_by_key(|entry| entry.seq);
        Ok(entries)
    }
}

fn not_assigned(agent: &AgentId, task: &TaskId) -> ModelError {
    ModelError::TaskNotAssigned {
        agent: agent.clone(),
        task: task.clone(),
    }
}
