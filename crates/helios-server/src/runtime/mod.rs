//! Master and agent runtime
//!
//! Every node gets its own coordination session. In standalone mode the master
//! and the agent share one embedded [`MemoryStore`].

mod agent;
mod master;

pub use agent::AgentNode;
pub use master::MasterNode;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use helios_coordination::store::{CoordinationStore, MemoryStore};
use helios_coordination::{AgentId, CoordinationSession, MasterId, SessionConfig};
use helios_model::AgentCapabilities;
use tracing::{error, info, warn};

use crate::config::{Configuration, Mode};
use crate::startup::ShutdownSignal;

/// Everything the runtime needs from the configuration.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub mode: Mode,
    pub master: MasterId,
    pub agent: AgentId,
    pub election_path: String,
    pub session: SessionConfig,
    pub capabilities: AgentCapabilities,
    pub shutdown_timeout: Duration,
}

impl RuntimeSettings {
    pub fn from_config(config: &Configuration) -> anyhow::Result<Self> {
        Ok(Self {
            mode: config.mode()?,
            master: config.master_id()?,
            agent: config.agent_id()?,
            election_path: config.election_path()?,
            session: config.session_config()?,
            capabilities: config.agent_capabilities()?,
            shutdown_timeout: config.shutdown_timeout()?,
        })
    }
}

/// Running master and/or agent.
pub struct Runtime {
    settings: RuntimeSettings,
    master: Option<MasterNode>,
    agent: Option<AgentNode>,
    sessions: Vec<CoordinationSession>,
}

impl Runtime {
    /// Start the nodes selected by the mode against `store`.
    pub async fn start(
        settings: RuntimeSettings,
        store: Arc<dyn CoordinationStore>,
    ) -> anyhow::Result<Self> {
        let mut runtime = Self {
            settings,
            master: None,
            agent: None,
            sessions: Vec::new(),
        };
        let mode = runtime.settings.mode;

        if matches!(mode, Mode::Master | Mode::Standalone)
            && let Err(e) = runtime.start_master(&store).await
        {
            runtime.shutdown().await;
            return Err(e);
        }
        if matches!(mode, Mode::Agent | Mode::Standalone)
            && let Err(e) = runtime.start_agent(&store).await
        {
            runtime.shutdown().await;
            return Err(e);
        }

        info!(mode = %mode, "Helios runtime started");
        Ok(runtime)
    }

    async fn connect(
        &mut self,
        store: &Arc<dyn CoordinationStore>,
    ) -> anyhow::Result<CoordinationSession> {
        let session = CoordinationSession::connect(store.clone(), self.settings.session.clone())
            .await
            .context("Failed to connect to the coordination store")?;
        self.sessions.push(session.clone());
        Ok(session)
    }

    async fn start_master(&mut self, store: &Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
        let session = self.connect(store).await?;
        let master = MasterNode::start(
            session,
            self.settings.master.clone(),
            &self.settings.election_path,
        )
        .await
        .context("Failed to start master")?;
        self.master = Some(master);
        Ok(())
    }

    async fn start_agent(&mut self, store: &Arc<dyn CoordinationStore>) -> anyhow::Result<()> {
        let session = self.connect(store).await?;
        let agent = AgentNode::start(
            session,
            self.settings.agent.clone(),
            self.settings.capabilities.clone(),
        )
        .await
        .context("Failed to start agent")?;
        self.agent = Some(agent);
        Ok(())
    }

    pub fn master(&self) -> Option<&MasterNode> {
        self.master.as_ref()
    }

    pub fn agent(&self) -> Option<&AgentNode> {
        self.agent.as_ref()
    }

    /// Stop the agent, then the master (leaving the election), then close
    /// every session. Bounded by the configured shutdown timeout.
    pub async fn shutdown(mut self) {
        let timeout = self.settings.shutdown_timeout;
        let agent = self.agent.take();
        let master = self.master.take();

        let stop_nodes = async {
            if let Some(agent) = agent
                && let Err(e) = agent.stop().await
            {
                warn!(error = %e, "Agent did not stop cleanly");
            }
            if let Some(master) = master
                && let Err(e) = master.stop().await
            {
                warn!(error = %e, "Master did not stop cleanly");
            }
        };
        if tokio::time::timeout(timeout, stop_nodes).await.is_err() {
            warn!(?timeout, "Timed out stopping nodes, closing sessions");
        }

        for session in self.sessions.drain(..) {
            if let Err(e) = session.close().await {
                error!(session = session.session_id(), error = %e, "Failed to close session");
            }
        }
        info!("Helios runtime stopped");
    }
}

/// Whether the mode expects peers in other processes. The embedded store is
/// private to this process, so such peers are never seen.
fn isolated_without_shared_store(mode: Mode) -> bool {
    mode != Mode::Standalone
}

/// Run until `shutdown` fires.
pub async fn run(settings: RuntimeSettings, shutdown: ShutdownSignal) -> anyhow::Result<()> {
    if isolated_without_shared_store(settings.mode) {
        warn!(
            mode = %settings.mode,
            "Coordination store is embedded in this process; nodes started elsewhere will not be visible"
        );
    }
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let runtime = Runtime::start(settings, store).await?;
    shutdown.wait().await;
    runtime.shutdown().await;
    Ok(())
}
