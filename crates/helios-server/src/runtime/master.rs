//! Master process: registration, leader election and agent tracking

use std::collections::BTreeSet;
use std::sync::Arc;

use helios_coordination::{
    CoordinationSession, ElectionState, LeaderElector, MasterId, WatchKind, paths,
};
use helios_model::{EphemeralRegistration, MasterModel, MasterRegistration, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::local_hostname;
use crate::metrics;

pub struct MasterNode {
    id: MasterId,
    model: MasterModel,
    elector: LeaderElector,
    registration: EphemeralRegistration,
    agents_watch: u64,
    agents: Arc<Mutex<BTreeSet<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterNode {
    /// Register the master, enter the election and start watching agents.
    pub async fn start(
        session: CoordinationSession,
        id: MasterId,
        election_path: &str,
    ) -> Result<Self> {
        let model = MasterModel::new(session.clone());
        model.init().await?;

        let registration = model
            .register_master(
                &id,
                &MasterRegistration {
                    hostname: local_hostname(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    started_at: chrono::Utc::now().timestamp_millis(),
                },
            )
            .await?;

        let elector = LeaderElector::with_election_path(session.clone(), id.as_str(), election_path);
        let leadership = tokio::spawn(log_leadership(id.clone(), elector.subscribe()));
        elector.start();

        let (tx, rx) = mpsc::unbounded_channel();
        let registration_watch = session
            .dispatcher()
            .register_fn(paths::AGENT_STATUS, WatchKind::Children, move |notification| {
                let _ = tx.send(notification.snapshot.children().to_vec());
            })
            .await?;

        let agents = Arc::new(Mutex::new(BTreeSet::new()));
        apply_agents(&id, &agents, registration_watch.snapshot().children());
        let tracker = tokio::spawn(track_agents(id.clone(), agents.clone(), rx));

        info!(master = %id, election = %election_path, "Master started");
        Ok(Self {
            id,
            model,
            elector,
            registration,
            agents_watch: registration_watch.id(),
            agents,
            tasks: vec![leadership, tracker],
        })
    }

    pub fn id(&self) -> &MasterId {
        &self.id
    }

    pub fn model(&self) -> &MasterModel {
        &self.model
    }

    pub fn elector(&self) -> &LeaderElector {
        &self.elector
    }

    pub fn is_leader(&self) -> bool {
        self.elector.is_leader()
    }

    /// Agents currently holding a status node, as last observed.
    pub fn agents_up(&self) -> BTreeSet<String> {
        self.agents.lock().clone()
    }

    /// Leave the election and remove the master's registration.
    pub async fn stop(self) -> Result<()> {
        self.model.session().dispatcher().unregister(self.agents_watch);
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.elector.stop().await {
            warn!(master = %self.id, error = %e, "Failed to leave election cleanly");
        }
        self.registration.deregister().await?;
        info!(master = %self.id, "Master stopped");
        Ok(())
    }
}

async fn log_leadership(master: MasterId, mut states: watch::Receiver<ElectionState>) {
    let mut previous = *states.borrow_and_update();
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        match (previous, state) {
            (ElectionState::Leader, ElectionState::Leader) => {}
            (_, ElectionState::Leader) => info!(master = %master, "Acquired master leadership"),
            (ElectionState::Leader, _) => {
                warn!(master = %master, state = ?state, "Lost master leadership")
            }
            _ => debug!(master = %master, state = ?state, "Election state changed"),
        }
        previous = state;
    }
}

async fn track_agents(
    master: MasterId,
    agents: Arc<Mutex<BTreeSet<String>>>,
    mut updates: mpsc::UnboundedReceiver<Vec<String>>,
) {
    while let Some(current) = updates.recv().await {
        apply_agents(&master, &agents, &current);
    }
}

fn apply_agents(master: &MasterId, agents: &Mutex<BTreeSet<String>>, current: &[String]) {
    let current: BTreeSet<String> = current.iter().cloned().collect();
    let mut known = agents.lock();
    let (up, down) = diff_agents(&known, &current);
    for agent in up {
        info!(master = %master, agent = %agent, "Agent up");
    }
    for agent in down {
        warn!(master = %master, agent = %agent, "Agent down");
    }
    metrics::set_agents_up(current.len());
    *known = current;
}

/// Agents that appeared and disappeared between two observations.
fn diff_agents<'a>(
    previous: &'a BTreeSet<String>,
    current: &'a BTreeSet<String>,
) -> (Vec<&'a String>, Vec<&'a String>) {
    (
        current.difference(previous).collect(),
        previous.difference(current).collect(),
    )
}
