//! Helios model scenario tests
//!
//! Master and agent models driven together against the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use helios_coordination::store::MemoryStore;
use helios_coordination::{
    AgentId, CoordinationError, CoordinationSession, ErrorKind, JobId, MasterId, PathLayout,
    RetryPolicy, SessionConfig, TaskId,
};
use helios_model::{
    AgentCapabilities, AgentModel, AgentRegistration, AgentState, Goal, Job, JobEventKind,
    MasterModel, MasterRegistration, ModelError, Task, TaskState, TaskStatus,
};
use tokio::sync::mpsc;

fn config() -> SessionConfig {
    SessionConfig {
        session_timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 5,
            max_delay_ms: 40,
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

async fn connect(store: &MemoryStore) -> CoordinationSession {
    CoordinationSession::connect(Arc::new(store.clone()), config())
        .await
        .unwrap()
}

async fn master(store: &MemoryStore) -> MasterModel {
    let master = MasterModel::new(connect(store).await);
    master.init().await.unwrap();
    master
}

fn job_id(id: &str) -> JobId {
    JobId::new(id).unwrap()
}

fn agent_id(id: &str) -> AgentId {
    AgentId::new(id).unwrap()
}

fn registration() -> AgentRegistration {
    AgentRegistration {
        hostname: "host-1".to_string(),
        version: "0.1.0".to_string(),
        started_at: 1,
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

// ============== Job Tests ==============

#[tokio::test]
async fn test_add_and_get_job() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");

    master
        .add_job(Job::new(id.clone(), "busybox:latest").with_command(["sleep", "10"]))
        .await
        .unwrap();

    let job = master.get_job(&id).await.unwrap();
    assert_eq!(job.version, 0);
    assert_eq!(job.value.image, "busybox:latest");
    assert!(job.value.created.is_some());
    assert_eq!(master.list_jobs().await.unwrap(), vec![id.clone()]);
    assert!(master.job_hosts(&id).await.unwrap().is_empty());

    let history = master.job_history(&id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event.kind, JobEventKind::Created);

    let err = master
        .add_job(Job::new(id.clone(), "busybox:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::JobExists(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_invalid_and_missing_jobs() {
    let store = MemoryStore::new();
    let master = master(&store).await;

    let err = master
        .add_job(Job::new(job_id("foo"), "busybox"))
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::InvalidJob(_)));
    assert!(store.node("/jobs/foo").is_none());

    let err = master.get_job(&job_id("nope:1")).await.unwrap_err();
    assert!(matches!(err, ModelError::JobNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============== Deployment Tests ==============

#[tokio::test]
async fn test_deploy_job() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();

    let task = master.deploy_job(&agent, &id, Goal::Start).await.unwrap();
    assert_eq!(task.as_str(), "foo:123");

    let (data, _) = store.node("/assignments/agent-1/foo:123").unwrap();
    assert_eq!(data, br#"{"job":"foo:123","goal":"START"}"#.to_vec());
    assert_eq!(master.job_hosts(&id).await.unwrap(), vec![agent.clone()]);

    let history = master.job_history(&id).await.unwrap();
    assert!(matches!(
        history.last().map(|entry| &entry.event.kind),
        Some(JobEventKind::Deployed {
            goal: Goal::Start,
            ..
        })
    ));

    let err = master.deploy_job(&agent, &id, Goal::Start).await.unwrap_err();
    assert!(matches!(err, ModelError::TaskAlreadyAssigned { .. }));
}

#[tokio::test]
async fn test_deploy_guarded_by_job_version() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();

    let err = master
        .deploy_job_at(&agent, &id, Goal::Start, 3)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModelError::Coordination(CoordinationError::VersionMismatch {
            index: Some(0),
            expected: 3,
            actual: 0,
            ..
        })
    ));
    assert!(err.is_conflict());
    assert!(store.node("/assignments/agent-1/foo:123").is_none());
    assert!(store.node("/jobs/foo:123/hosts/agent-1").is_none());

    master.deploy_job_at(&agent, &id, Goal::Start, 0).await.unwrap();
}

#[tokio::test]
async fn test_remove_job_requires_undeploy() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();
    let task = master.deploy_job(&agent, &id, Goal::Start).await.unwrap();

    let err = master.remove_job(&id).await.unwrap_err();
    match err {
        ModelError::JobStillDeployed { agents, .. } => assert_eq!(agents, vec![agent.clone()]),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(store.node("/jobs/foo:123").is_some());

    let removed = master.undeploy(&agent, &task).await.unwrap();
    assert_eq!(removed, Task::new(id.clone(), Goal::Start));
    assert!(master.assigned_tasks(&agent).await.unwrap().is_empty());

    master.remove_job(&id).await.unwrap();
    assert!(matches!(
        master.get_job(&id).await,
        Err(ModelError::JobNotFound(_))
    ));
    assert!(matches!(
        master.job_history(&id).await,
        Err(ModelError::JobNotFound(_))
    ));
    assert!(store.node("/history/jobs/foo:123").is_none());
}

#[tokio::test]
async fn test_set_goal_and_undeploy() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();
    let task = master.deploy_job(&agent, &id, Goal::Start).await.unwrap();

    let version = master.set_goal(&agent, &task, Goal::Stop, 0).await.unwrap();
    assert_eq!(version, 1);
    let tasks = master.assigned_tasks(&agent).await.unwrap();
    assert_eq!(tasks[&task].value.goal, Goal::Stop);

    let err = master
        .set_goal(&agent, &task, Goal::Start, 0)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    master.undeploy(&agent, &task).await.unwrap();
    let err = master.undeploy(&agent, &task).await.unwrap_err();
    assert!(matches!(err, ModelError::TaskNotAssigned { .. }));

    let kinds: Vec<JobEventKind> = master
        .job_history(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.event.kind)
        .collect();
    assert_eq!(kinds.len(), 4);
    assert!(matches!(kinds[2], JobEventKind::GoalChanged { goal: Goal::Stop, .. }));
    assert!(matches!(kinds[3], JobEventKind::Undeployed { .. }));
}

#[tokio::test]
async fn test_append_history() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();

    let agent = agent_id("agent-1");
    let task = TaskId::new("foo:1").unwrap();
    let first = master
        .append_history(
            &id,
            JobEventKind::TaskStateChanged {
                agent: agent.clone(),
                task: task.clone(),
                state: TaskState::Pulling,
            },
        )
        .await
        .unwrap()
        .unwrap();
    let second = master
        .append_history(
            &id,
            JobEventKind::TaskStateChanged {
                agent,
                task,
                state: TaskState::Running,
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert!(second > first);

    let history = master.job_history(&id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].seq, second);

    let err = master
        .append_history(&job_id("missing:1"), JobEventKind::Created)
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::JobNotFound(_)));
}

// ============== Agent Tests ==============

#[tokio::test]
async fn test_agent_registration() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let agent = agent_id("agent-1");
    let model = AgentModel::new(connect(&store).await, agent.clone());

    let capabilities = AgentCapabilities {
        labels: BTreeMap::from([("zone".to_string(), "a".to_string())]),
        cpus: Some(4),
        memory_mb: None,
    };
    let registrar = model.register(&registration(), &capabilities).await.unwrap();

    assert_eq!(master.agent_status(&agent).await.unwrap(), AgentState::Up);
    assert_eq!(master.list_agents().await.unwrap(), vec![agent.clone()]);
    assert_eq!(master.agent_config(&agent).await.unwrap(), capabilities);
    assert_eq!(
        master.agent_registration(&agent).await.unwrap().hostname,
        "host-1"
    );

    registrar.deregister().await.unwrap();
    assert!(matches!(
        master.agent_status(&agent).await,
        Err(ModelError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_agent_reregisters_after_session_loss() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let agent = agent_id("agent-1");
    let session = connect(&store).await;
    let model = AgentModel::new(session.clone(), agent.clone());
    let _registrar = model
        .register(&registration(), &AgentCapabilities::default())
        .await
        .unwrap();

    let first = session.session_id();
    store.expire_session(first);

    let status = PathLayout::agent_status(&agent);
    eventually(|| {
        let store = store.clone();
        let status = status.clone();
        let session = session.clone();
        async move {
            let owner = store
                .node(&status)
                .and_then(|(_, stat)| stat.ephemeral_owner);
            owner.is_some() && owner == Some(session.session_id()) && owner != Some(first)
        }
    })
    .await;
    assert_eq!(master.agent_status(&agent).await.unwrap(), AgentState::Up);
    assert!(store.node(&PathLayout::agent_config(&agent)).is_some());
}

#[tokio::test]
async fn test_agent_down_when_process_dies() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:1");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();
    master.deploy_job(&agent, &id, Goal::Start).await.unwrap();

    let session = connect(&store).await;
    let model = AgentModel::new(session.clone(), agent.clone());
    let registrar = model
        .register(&registration(), &AgentCapabilities::default())
        .await
        .unwrap();
    assert_eq!(master.agent_status(&agent).await.unwrap(), AgentState::Up);

    // A dead process stops maintaining its nodes
    drop(registrar);
    store.abandon_session(session.session_id());

    let (master_ref, agent_ref) = (&master, &agent);
    eventually(move || async move {
        master_ref.agent_status(agent_ref).await.ok() == Some(AgentState::Down)
    })
    .await;
    assert_eq!(master.list_agents().await.unwrap(), vec![agent]);
}

#[tokio::test]
async fn test_watch_assignments() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let id = job_id("foo:123");
    let agent = agent_id("agent-1");
    master.add_job(Job::new(id.clone(), "busybox")).await.unwrap();

    let model = AgentModel::new(connect(&store).await, agent.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = model
        .watch_assignments(move |tasks| {
            let _ = tx.send(tasks);
        })
        .await
        .unwrap();

    assert!(next(&mut rx).await.is_empty());

    let task = master.deploy_job(&agent, &id, Goal::Start).await.unwrap();
    let tasks = next(&mut rx).await;
    assert_eq!(tasks.get(&task), Some(&Task::new(id.clone(), Goal::Start)));

    master.set_goal(&agent, &task, Goal::Stop, 0).await.unwrap();
    let tasks = next(&mut rx).await;
    assert_eq!(tasks[&task].goal, Goal::Stop);

    master.undeploy(&agent, &task).await.unwrap();
    assert!(next(&mut rx).await.is_empty());
}

#[tokio::test]
async fn test_report_task_status() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let agent = agent_id("agent-1");
    let task = TaskId::new("foo:1").unwrap();
    let model = AgentModel::new(connect(&store).await, agent.clone());

    let mut status = TaskStatus {
        job: job_id("foo:1"),
        goal: Goal::Start,
        state: TaskState::Pulling,
        container_id: None,
        message: None,
        updated: 1,
    };
    model.report_task_status(&task, &status).await.unwrap();

    status.state = TaskState::Running;
    status.container_id = Some("c0ffee".to_string());
    status.updated = 2;
    model.report_task_status(&task, &status).await.unwrap();

    assert_eq!(model.task_status(&task).await.unwrap(), Some(status.clone()));
    let statuses = master.task_statuses(&agent).await.unwrap();
    assert_eq!(statuses.get(&task), Some(&status));
    assert_eq!(
        store.node("/status/tasks/agent-1/foo:1").map(|(_, stat)| stat.version),
        Some(1)
    );
}

// ============== Master Registration Tests ==============

#[tokio::test]
async fn test_register_master() {
    let store = MemoryStore::new();
    let master = master(&store).await;
    let name = MasterId::new("master-1").unwrap();

    let registration = master
        .register_master(
            &name,
            &MasterRegistration {
                hostname: "host-1".to_string(),
                version: "0.1.0".to_string(),
                started_at: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(master.list_masters().await.unwrap(), vec![name.clone()]);
    assert_eq!(
        registration.paths().collect::<Vec<_>>(),
        vec!["/status/masters/master-1"]
    );

    registration.deregister().await.unwrap();
    assert!(master.list_masters().await.unwrap().is_empty());
}
