//! Store namespace layout
//!
//! Maps domain identifiers to store paths and back:
//!
//! ```text
//! /jobs/<job-id>                              job definition
//! /jobs/<job-id>/hosts/<agent-id>             deployment reference
//! /history/jobs/<job-id>/<event-seq>          append-only job history
//! /status/agents/<agent-id>                   agent status (ephemeral)
//! /status/tasks/<agent-id>/<task-id>          reported task status
//! /status/masters/<master-id>                 master registration (ephemeral)
//! /assignments/<agent-id>/<task-id>           desired task state
//! /config/agents/<agent-id>                   agent capabilities (ephemeral)
//! /election/masters/n_<seq>                   election candidates
//! /coordination/commits/<transaction-id>      commit markers
//! ```
//!
//! Parsing is the exact inverse of formatting; any path that does not match a
//! template, or that is not in canonical form, is rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordinationError, Result};
use crate::store::CreateMode;

pub const JOBS: &str = "/jobs";
pub const JOB_HISTORY: &str = "/history/jobs";
pub const AGENT_STATUS: &str = "/status/agents";
pub const TASK_STATUS: &str = "/status/tasks";
pub const MASTER_STATUS: &str = "/status/masters";
pub const ASSIGNMENTS: &str = "/assignments";
pub const AGENT_CONFIG: &str = "/config/agents";
pub const ELECTION: &str = "/election/masters";
pub const COMMITS: &str = "/coordination/commits";

const HOSTS: &str = "hosts";

/// Name prefix of election candidate nodes
pub const CANDIDATE_PREFIX: &str = "n_";

const SEQUENCE_DIGITS: usize = 10;

/// Syntactic path check: absolute, no empty or relative segments.
///
/// Sequential creates may name a prefix ending in `/`, the store appends the
/// sequence number to it.
pub fn validate_path(path: &str, mode: CreateMode) -> Result<()> {
    let invalid = || CoordinationError::InvalidPath {
        index: None,
        path: path.to_string(),
    };
    if !path.starts_with('/') {
        return Err(invalid());
    }
    if path == "/" {
        return Ok(());
    }
    let body = match path.strip_suffix('/') {
        Some(body) if mode.is_sequential() => body,
        Some(_) => return Err(invalid()),
        None => path,
    };
    if body.len() > 1
        && body[1..]
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid());
    }
    Ok(())
}

/// Parent of an absolute path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

/// Join a parent path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn check_segment(kind: &'static str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(CoordinationError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                check_segment($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoordinationError;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = CoordinationError;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

define_id!(
    /// Job identifier, `name:version[:hash]` by convention
    JobId,
    "job id"
);
define_id!(AgentId, "agent id");
define_id!(TaskId, "task id");
define_id!(MasterId, "master id");

/// Position of an event in a job's history, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventSeq(pub u64);

impl fmt::Display for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = SEQUENCE_DIGITS)
    }
}

impl FromStr for EventSeq {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        parse_sequence(s)
            .map(EventSeq)
            .ok_or_else(|| CoordinationError::InvalidIdentifier {
                kind: "event sequence",
                value: s.to_string(),
            })
    }
}

/// Parse a canonical store sequence suffix (exactly ten digits).
pub fn parse_sequence(s: &str) -> Option<u64> {
    if s.len() != SEQUENCE_DIGITS || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Sequence number of an election candidate node name (`n_0000000007`).
pub fn candidate_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(CANDIDATE_PREFIX).and_then(parse_sequence)
}

/// A path of the managed namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManagedPath {
    Jobs,
    Job(JobId),
    JobHosts(JobId),
    JobHost(JobId, AgentId),
    JobHistories,
    JobHistory(JobId),
    JobEvent(JobId, EventSeq),
    AgentStatuses,
    AgentStatus(AgentId),
    TaskStatuses,
    AgentTaskStatuses(AgentId),
    TaskStatus(AgentId, TaskId),
    MasterStatuses,
    MasterStatus(MasterId),
    Assignments,
    AgentAssignments(AgentId),
    Assignment(AgentId, TaskId),
    AgentConfigs,
    AgentConfig(AgentId),
    Election,
    ElectionCandidate(u64),
    Commits,
    CommitMarker(Uuid),
}

impl ManagedPath {
    pub fn to_path(&self) -> String {
        match self {
            Self::Jobs => JOBS.to_string(),
            Self::Job(job) => format!("{}/{}", JOBS, job),
            Self::JobHosts(job) => format!("{}/{}/{}", JOBS, job, HOSTS),
            Self::JobHost(job, agent) => format!("{}/{}/{}/{}", JOBS, job, HOSTS, agent),
            Self::JobHistories => JOB_HISTORY.to_string(),
            Self::JobHistory(job) => format!("{}/{}", JOB_HISTORY, job),
            Self::JobEvent(job, seq) => format!("{}/{}/{}", JOB_HISTORY, job, seq),
            Self::AgentStatuses => AGENT_STATUS.to_string(),
            Self::AgentStatus(agent) => format!("{}/{}", AGENT_STATUS, agent),
            Self::TaskStatuses => TASK_STATUS.to_string(),
            Self::AgentTaskStatuses(agent) => format!("{}/{}", TASK_STATUS, agent),
            Self::TaskStatus(agent, task) => format!("{}/{}/{}", TASK_STATUS, agent, task),
            Self::MasterStatuses => MASTER_STATUS.to_string(),
            Self::MasterStatus(master) => format!("{}/{}", MASTER_STATUS, master),
            Self::Assignments => ASSIGNMENTS.to_string(),
            Self::AgentAssignments(agent) => format!("{}/{}", ASSIGNMENTS, agent),
            Self::Assignment(agent, task) => format!("{}/{}/{}", ASSIGNMENTS, agent, task),
            Self::AgentConfigs => AGENT_CONFIG.to_string(),
            Self::AgentConfig(agent) => format!("{}/{}", AGENT_CONFIG, agent),
            Self::Election => ELECTION.to_string(),
            Self::ElectionCandidate(seq) => format!(
                "{}/{}{:0width$}",
                ELECTION,
                CANDIDATE_PREFIX,
                seq,
                width = SEQUENCE_DIGITS
            ),
            Self::Commits => COMMITS.to_string(),
            Self::CommitMarker(id) => format!("{}/{}", COMMITS, id.as_hyphenated()),
        }
    }

    pub fn parse(path: &str) -> Result<Self> {
        let invalid = || CoordinationError::InvalidPath {
            index: None,
            path: path.to_string(),
        };
        let body = path.strip_prefix('/').ok_or_else(invalid)?;
        let segments: Vec<&str> = body.split('/').collect();

        let parsed = match segments.as_slice() {
            ["jobs"] => Self::Jobs,
            ["jobs", job] => Self::Job(job.parse()?),
            ["jobs", job, "hosts"] => Self::JobHosts(job.parse()?),
            ["jobs", job, "hosts", agent] => Self::JobHost(job.parse()?, agent.parse()?),
            ["history", "jobs"] => Self::JobHistories,
            ["history", "jobs", job] => Self::JobHistory(job.parse()?),
            ["history", "jobs", job, seq] => Self::JobEvent(job.parse()?, seq.parse()?),
            ["status", "agents"] => Self::AgentStatuses,
            ["status", "agents", agent] => Self::AgentStatus(agent.parse()?),
            ["status", "tasks"] => Self::TaskStatuses,
            ["status", "tasks", agent] => Self::AgentTaskStatuses(agent.parse()?),
            ["status", "tasks", agent, task] => Self::TaskStatus(agent.parse()?, task.parse()?),
            ["status", "masters"] => Self::MasterStatuses,
            ["status", "masters", master] => Self::MasterStatus(master.parse()?),
            ["assignments"] => Self::Assignments,
            ["assignments", agent] => Self::AgentAssignments(agent.parse()?),
            ["assignments", agent, task] => Self::Assignment(agent.parse()?, task.parse()?),
            ["config", "agents"] => Self::AgentConfigs,
            ["config", "agents", agent] => Self::AgentConfig(agent.parse()?),
            ["election", "masters"] => Self::Election,
            ["election", "masters", name] => {
                Self::ElectionCandidate(candidate_sequence(name).ok_or_else(invalid)?)
            }
            ["coordination", "commits"] => Self::Commits,
            ["coordination", "commits", id] => {
                let uuid = Uuid::parse_str(id).map_err(|_| invalid())?;
                // Only the lowercase hyphenated form round-trips
                if uuid.as_hyphenated().to_string() != *id {
                    return Err(invalid());
                }
                Self::CommitMarker(uuid)
            }
            _ => return Err(invalid()),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ManagedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

impl FromStr for ManagedPath {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Path shortcuts used throughout masters and agents
pub struct PathLayout;

impl PathLayout {
    /// Persistent roots created at startup
    pub const ROOTS: [&'static str; 9] = [
        JOBS,
        JOB_HISTORY,
        AGENT_STATUS,
        TASK_STATUS,
        MASTER_STATUS,
        ASSIGNMENTS,
        AGENT_CONFIG,
        ELECTION,
        COMMITS,
    ];

    pub fn job(job: &JobId) -> String {
        ManagedPath::Job(job.clone()).to_path()
    }

    /// Parent of the job's deployment references; non-empty while deployed
    pub fn job_hosts(job: &JobId) -> String {
        ManagedPath::JobHosts(job.clone()).to_path()
    }

    pub fn job_host(job: &JobId, agent: &AgentId) -> String {
        ManagedPath::JobHost(job.clone(), agent.clone()).to_path()
    }

    pub fn job_history(job: &JobId) -> String {
        ManagedPath::JobHistory(job.clone()).to_path()
    }

    /// Prefix for sequential history event nodes
    pub fn job_event_prefix(job: &JobId) -> String {
        format!("{}/", Self::job_history(job))
    }

    pub fn agent_status(agent: &AgentId) -> String {
        ManagedPath::AgentStatus(agent.clone()).to_path()
    }

    pub fn agent_task_statuses(agent: &AgentId) -> String {
        ManagedPath::AgentTaskStatuses(agent.clone()).to_path()
    }

    pub fn task_status(agent: &AgentId, task: &TaskId) -> String {
        ManagedPath::TaskStatus(agent.clone(), task.clone()).to_path()
    }

    pub fn master_status(master: &MasterId) -> String {
        ManagedPath::MasterStatus(master.clone()).to_path()
    }

    pub fn agent_assignments(agent: &AgentId) -> String {
        ManagedPath::AgentAssignments(agent.clone()).to_path()
    }

    pub fn assignment(agent: &AgentId, task: &TaskId) -> String {
        ManagedPath::Assignment(agent.clone(), task.clone()).to_path()
    }

    pub fn agent_config(agent: &AgentId) -> String {
        ManagedPath::AgentConfig(agent.clone()).to_path()
    }

    /// Prefix for ephemeral-sequential candidate nodes
    pub fn candidate_prefix() -> String {
        format!("{}/{}", ELECTION, CANDIDATE_PREFIX)
    }

    pub fn commit_marker(id: Uuid) -> String {
        ManagedPath::CommitMarker(id).to_path()
    }

    pub fn parse(path: &str) -> Result<ManagedPath> {
        ManagedPath::parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    #[test]
    fn test_layout_paths() {
        let task = TaskId::new("task-7").unwrap();
        assert_eq!(PathLayout::job(&job("foo:123")), "/jobs/foo:123");
        assert_eq!(
            PathLayout::assignment(&agent("agent-1"), &task),
            "/assignments/agent-1/task-7"
        );
        assert_eq!(
            PathLayout::agent_status(&agent("agent-1")),
            "/status/agents/agent-1"
        );
        assert_eq!(
            PathLayout::agent_config(&agent("agent-1")),
            "/config/agents/agent-1"
        );
        assert_eq!(
            PathLayout::job_event_prefix(&job("foo:123")),
            "/history/jobs/foo:123/"
        );
        assert_eq!(PathLayout::candidate_prefix(), "/election/masters/n_");
    }

    #[test]
    fn test_parse_known_paths() {
        assert_eq!(
            ManagedPath::parse("/history/jobs/foo:123/0000000004").unwrap(),
            ManagedPath::JobEvent(job("foo:123"), EventSeq(4))
        );
        assert_eq!(
            ManagedPath::parse("/jobs/foo:123/hosts/agent-1").unwrap(),
            ManagedPath::JobHost(job("foo:123"), agent("agent-1"))
        );
        assert_eq!(
            ManagedPath::parse("/assignments/agent-1").unwrap(),
            ManagedPath::AgentAssignments(agent("agent-1"))
        );
        assert_eq!(
            ManagedPath::parse("/election/masters/n_0000000012").unwrap(),
            ManagedPath::ElectionCandidate(12)
        );
        assert_eq!(
            "/status/agents".parse::<ManagedPath>().unwrap(),
            ManagedPath::AgentStatuses
        );
    }

    #[test]
    fn test_parse_rejects_unmanaged_paths() {
        for path in [
            "",
            "/",
            "jobs/foo",
            "/jobs/",
            "/jobs/foo/bar",
            "/jobs/..",
            "/history/jobs/foo/12",
            "/election/masters/x_0000000001",
            "/coordination/commits/not-a-uuid",
            "/unknown",
        ] {
            assert!(ManagedPath::parse(path).is_err(), "accepted {:?}", path);
        }
    }

    #[test]
    fn test_commit_marker_must_be_canonical() {
        let id = Uuid::new_v4();
        let path = PathLayout::commit_marker(id);
        assert_eq!(
            ManagedPath::parse(&path).unwrap(),
            ManagedPath::CommitMarker(id)
        );

        let simple = format!("{}/{}", COMMITS, id.simple());
        assert!(ManagedPath::parse(&simple).is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(JobId::new("foo:123").is_ok());
        assert!(JobId::new("").is_err());
        assert!(AgentId::new("a/b").is_err());
        assert!(TaskId::new("..").is_err());

        let err = MasterId::new(".").unwrap_err();
        assert!(matches!(
            err,
            CoordinationError::InvalidIdentifier {
                kind: "master id",
                ..
            }
        ));
    }

    #[test]
    fn test_id_serde() {
        let id: JobId = serde_json::from_str("\"foo:123\"").unwrap();
        assert_eq!(id.as_str(), "foo:123");
        assert!(serde_json::from_str::<JobId>("\"a/b\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"foo:123\"");
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/jobs/foo", CreateMode::Persistent).is_ok());
        assert!(validate_path("/jobs/", CreateMode::Persistent).is_err());
        assert!(validate_path("/history/jobs/foo/", CreateMode::PersistentSequential).is_ok());
        assert!(validate_path("/a//b", CreateMode::Persistent).is_err());
        assert!(validate_path("relative", CreateMode::Persistent).is_err());
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/jobs"), Some("/"));
        assert_eq!(parent("/status/agents/a1"), Some("/status/agents"));
        assert_eq!(join("/", "jobs"), "/jobs");
        assert_eq!(join("/status/agents", "a1"), "/status/agents/a1");
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_:.-]{1,12}".prop_filter("relative segment", |s| s != "." && s != "..")
    }

    fn managed_path() -> impl Strategy<Value = ManagedPath> {
        prop_oneof![
            Just(ManagedPath::Jobs),
            Just(ManagedPath::AgentStatuses),
            Just(ManagedPath::Election),
            segment().prop_map(|s| ManagedPath::Job(JobId::new(s).unwrap())),
            segment().prop_map(|s| ManagedPath::JobHosts(JobId::new(s).unwrap())),
            (segment(), segment()).prop_map(|(j, a)| ManagedPath::JobHost(
                JobId::new(j).unwrap(),
                AgentId::new(a).unwrap()
            )),
            segment().prop_map(|s| ManagedPath::JobHistory(JobId::new(s).unwrap())),
            (segment(), 0u64..10_000_000_000u64).prop_map(|(s, n)| ManagedPath::JobEvent(
                JobId::new(s).unwrap(),
                EventSeq(n)
            )),
            segment().prop_map(|s| ManagedPath::AgentStatus(AgentId::new(s).unwrap())),
            segment().prop_map(|s| ManagedPath::AgentConfig(AgentId::new(s).unwrap())),
            segment().prop_map(|s| ManagedPath::MasterStatus(MasterId::new(s).unwrap())),
            segment().prop_map(|s| ManagedPath::AgentAssignments(AgentId::new(s).unwrap())),
            (segment(), segment()).prop_map(|(a, t)| ManagedPath::Assignment(
                AgentId::new(a).unwrap(),
                TaskId::new(t).unwrap()
            )),
            (segment(), segment()).prop_map(|(a, t)| ManagedPath::TaskStatus(
                AgentId::new(a).unwrap(),
                TaskId::new(t).unwrap()
            )),
            (0u64..10_000_000_000u64).prop_map(ManagedPath::ElectionCandidate),
            any::<u128>().prop_map(|n| ManagedPath::CommitMarker(Uuid::from_u128(n))),
        ]
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_to_path(path in managed_path()) {
            prop_assert_eq!(ManagedPath::parse(&path.to_path()).unwrap(), path);
        }

        #[test]
        fn prop_distinct_paths_for_distinct_values(a in managed_path(), b in managed_path()) {
            prop_assert_eq!(a == b, a.to_path() == b.to_path());
        }
    }
}
