//! Leader election
//!
//! Each candidate creates an ephemeral-sequential node under the election
//! path; the lowest live sequence number leads. Everyone else watches only
//! its immediate predecessor, so a departure wakes a single candidate.
//!
//! Candidacy is bound to the store session: when the session is lost the
//! elector moves to `Defeated` and starts a fresh attempt with a new node once
//! a new session is up. Use one elector per session.

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{FnChangeListener, WatchKind};
use crate::error::{CoordinationError, Result};
use crate::operation::Operation;
use crate::paths::{self, CANDIDATE_PREFIX, ELECTION, candidate_sequence};
use crate::session::{ConnectionState, CoordinationSession};
use crate::store::CreateMode;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    NotCandidate,
    Pending,
    Leader,
    Defeated,
}

/// Identity of one leadership attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipToken {
    /// Candidate node path
    pub path: String,
    pub sequence: u64,
    /// Session generation the candidate node lives in
    pub generation: u64,
}

struct ElectorInner {
    session: CoordinationSession,
    candidate: String,
    election_path: String,
    state_tx: watch::Sender<ElectionState>,
    token: Mutex<Option<LeadershipToken>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ElectorInner {
    fn set_state(&self, state: ElectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            gauge!("helios_election_is_leader").set(if state == ElectionState::Leader {
                1.0
            } else {
                0.0
            });
            info!(
                candidate = %self.candidate,
                from = ?previous,
                to = ?state,
                "Election state changed"
            );
        }
    }

    /// Candidate nodes of this elector: owned by the current store session
    /// and carrying our candidate id. Sorted by sequence.
    async fn own_candidates(&self) -> Result<Vec<(u64, String)>> {
        let session_id = self.session.session_id();
        let mut own = Vec::new();
        for name in self.session.children(&self.election_path).await? {
            let Some(sequence) = candidate_sequence(&name) else {
                continue;
            };
            let path = paths::join(&self.election_path, &name);
            let Some(stat) = self.session.exists(&path).await? else {
                continue;
            };
            if stat.ephemeral_owner != Some(session_id) {
                continue;
            }
            match self.session.read(&path).await {
                Ok((data, _)) if data == self.candidate.as_bytes() => own.push((sequence, path)),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        own.sort();
        Ok(own)
    }

    async fn remove_own_candidates(&self) -> Result<()> {
        for (_, path) in self.own_candidates().await? {
            match self.session.delete(&path, None).await {
                Ok(()) => debug!(path = %path, "Removed leftover candidate node"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Join the election and follow it until this attempt is over.
    async fn campaign(&self) -> Result<()> {
        let generation = self.session.wait_connected().await?.generation;
        self.session.ensure_path(&self.election_path).await?;
        self.remove_own_candidates().await?;
        self.set_state(ElectionState::Pending);

        let prefix = paths::join(&self.election_path, CANDIDATE_PREFIX);
        let result = self
            .session
            .submit(Transaction::new().append(
                Operation::create_with_data(prefix, self.candidate.as_bytes())
                    .with_mode(CreateMode::EphemeralSequential),
            ))
            .await?;
        let path = match result.created_path(0) {
            Some(path) => path.to_string(),
            // Recovered commit: the store-assigned name was not acknowledged
            None => self
                .own_candidates()
                .await?
                .pop()
                .map(|(_, path)| path)
                .ok_or_else(|| CoordinationError::NodeNotFound {
                    index: None,
                    path: self.election_path.clone(),
                })?,
        };
        let sequence = path
            .rsplit('/')
            .next()
            .and_then(candidate_sequence)
            .ok_or_else(|| CoordinationError::InvalidPath {
                index: None,
                path: path.clone(),
            })?;
        let token = LeadershipToken {
            path: path.clone(),
            sequence,
            generation,
        };
        *self.token.lock() = Some(token.clone());
        info!(candidate = %self.candidate, path = %path, "Joined leader election");

        let mut status = self.session.subscribe_status();
        loop {
            let mut candidates: Vec<(u64, String)> = self
                .session
                .children(&self.election_path)
                .await?
                .into_iter()
                .filter_map(|name| candidate_sequence(&name).map(|seq| (seq, name)))
                .collect();
            candidates.sort();

            if !candidates.iter().any(|(seq, _)| *seq == sequence) {
                warn!(path = %path, "Candidate node disappeared");
                return Ok(());
            }

            // Leader watches its own node, everyone else its predecessor
            let predecessor = candidates
                .iter()
                .rev()
                .find(|(seq, _)| *seq < sequence)
                .map(|(_, name)| paths::join(&self.election_path, name));
            let watched = predecessor.clone().unwrap_or_else(|| path.clone());

            let wake = Arc::new(Notify::new());
            let notifier = wake.clone();
            let registration = self
                .session
                .dispatcher()
                .register(
                    &watched,
                    WatchKind::Data,
                    Arc::new(FnChangeListener::new(move |_| notifier.notify_one())),
                )
                .await?;

            match &predecessor {
                None => self.set_state(ElectionState::Leader),
                Some(_) if !registration.snapshot().exists() => {
                    registration.cancel();
                    continue;
                }
                Some(predecessor) => {
                    debug!(path = %path, predecessor = %predecessor, "Waiting for predecessor")
                }
            }

            let lost = tokio::select! {
                _ = wake.notified() => false,
                _ = status.wait_for(|s| {
                    s.closed || s.generation != generation || s.state == ConnectionState::LostSession
                }) => true,
            };
            registration.cancel();
            if lost {
                info!(candidate = %self.candidate, "Election session lost");
                return Ok(());
            }
        }
    }
}

async fn run(inner: Arc<ElectorInner>, mut stop: watch::Receiver<bool>) {
    let mut failures = 0;
    loop {
        if *stop.borrow() {
            break;
        }
        let result = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            result = inner.campaign() => result,
        };

        *inner.token.lock() = None;
        inner.set_state(ElectionState::Defeated);

        match result {
            Ok(()) => failures = 0,
            Err(CoordinationError::Closed) => break,
            Err(e) => {
                failures += 1;
                let delay = inner.session.config().retry.calculate_delay(failures);
                warn!(candidate = %inner.candidate, error = %e, ?delay, "Election attempt failed");
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    debug!(candidate = %inner.candidate, "Election task stopped");
}

/// Elects one leader among the processes sharing an election path.
pub struct LeaderElector {
    inner: Arc<ElectorInner>,
}

impl LeaderElector {
    pub fn new(session: CoordinationSession, candidate: impl Into<String>) -> Self {
        Self::with_election_path(session, candidate, ELECTION)
    }

    pub fn with_election_path(
        session: CoordinationSession,
        candidate: impl Into<String>,
        election_path: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ElectionState::NotCandidate);
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ElectorInner {
                session,
                candidate: candidate.into(),
                election_path: election_path.into(),
                state_tx,
                token: Mutex::new(None),
                stop_tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn candidate(&self) -> &str {
        &self.inner.candidate
    }

    /// Enter the election. No effect while an election task is running.
    pub fn start(&self) {
        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.inner.stop_tx.send_replace(false);
        let stop = self.inner.stop_tx.subscribe();
        *task = Some(tokio::spawn(run(self.inner.clone(), stop)));
    }

    /// Start and wait up to `timeout` for leadership.
    pub async fn elect_leadership(&self, timeout: Duration) -> Option<LeadershipToken> {
        self.start();
        self.await_leadership(timeout).await
    }

    pub async fn await_leadership(&self, timeout: Duration) -> Option<LeadershipToken> {
        let mut state = self.inner.state_tx.subscribe();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == ElectionState::Leader))
            .await
            .ok()?
            .ok()?;
        self.token()
    }

    /// Leave the election and delete the candidate node.
    pub async fn stop(&self) -> Result<()> {
        self.inner.stop_tx.send_replace(true);
        let task = self.inner.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(candidate = %self.inner.candidate, error = %e, "Election task failed");
        }

        *self.inner.token.lock() = None;
        let result = if self.inner.session.is_closed() {
            Ok(())
        } else {
            self.inner.remove_own_candidates().await
        };
        self.inner.set_state(ElectionState::Defeated);
        info!(candidate = %self.inner.candidate, "Left leader election");
        result
    }

    pub fn state(&self) -> ElectionState {
        *self.inner.state_tx.borrow()
    }

    /// Leader and currently connected. A leader whose connection is
    /// suspended cannot tell whether it still holds leadership.
    pub fn is_leader(&self) -> bool {
        self.state() == ElectionState::Leader
            && self.inner.session.connection_state() == ConnectionState::Connected
    }

    pub fn token(&self) -> Option<LeadershipToken> {
        self.inner.token.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.inner.state_tx.subscribe()
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        self.inner.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::session::SessionConfig;
    use crate::store::MemoryStore;

    async fn connect(store: &MemoryStore) -> CoordinationSession {
        let config = SessionConfig {
            session_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2.0,
                jitter: 0.0,
            },
        };
        CoordinationSession::connect(Arc::new(store.clone()), config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_single_candidate_leads() {
        let store = MemoryStore::new();
        let elector = LeaderElector::new(connect(&store).await, "master-1");
        assert_eq!(elector.state(), ElectionState::NotCandidate);

        let token = elector
            .elect_leadership(Duration::from_secs(2))
            .await
            .unwrap();
        assert!(elector.is_leader());
        assert_eq!(token.generation, 1);
        assert!(token.path.starts_with("/election/masters/n_"));
        assert_eq!(
            store.node(&token.path).map(|(data, _)| data),
            Some(b"master-1".to_vec())
        );
    }

    #[tokio::test]
    async fn test_stop_hands_over() {
        let store = MemoryStore::new();
        let first = LeaderElector::new(connect(&store).await, "master-1");
        let second = LeaderElector::new(connect(&store).await, "master-2");

        first
            .elect_leadership(Duration::from_secs(2))
            .await
            .unwrap();
        second.start();
        let mut states = second.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ElectionState::Pending),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!second.is_leader());

        first.stop().await.unwrap();
        assert_eq!(first.state(), ElectionState::Defeated);

        let token = second
            .await_leadership(Duration::from_secs(2))
            .await
            .unwrap();
        let name = token.path.rsplit('/').next().unwrap().to_string();
        assert_eq!(store.child_names(ELECTION), vec![name]);
    }

    #[tokio::test]
    async fn test_stop_after_task_panic() {
        let store = MemoryStore::new();
        let elector = LeaderElector::new(connect(&store).await, "master-1");
        elector
            .elect_leadership(Duration::from_secs(2))
            .await
            .unwrap();

        let failing: JoinHandle<()> = tokio::spawn(async {
            panic!("election task crashed");
        });
        if let Some(running) = elector.inner.task.lock().replace(failing) {
            running.abort();
        }

        elector.stop().await.unwrap();
        assert_eq!(elector.state(), ElectionState::Defeated);
        assert!(store.child_names(ELECTION).is_empty());
    }

    #[tokio::test]
    async fn test_session_loss_defeats_and_rejoins() {
        let store = MemoryStore::new();
        let session = connect(&store).await;
        let elector = LeaderElector::new(session.clone(), "master-1");
        let first = elector
            .elect_leadership(Duration::from_secs(2))
            .await
            .unwrap();

        store.expire_session(session.session_id());

        let second = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(token) = elector.token()
                    && token.generation == 2
                    && elector.state() == ElectionState::Leader
                {
                    return token;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(store.node(&first.path).is_none());
        assert_eq!(second.generation, 2);
        assert!(second.sequence > first.sequence);
    }
}
