use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::command::CommandEntry;
use crate::leadership::LeaderHandle;
use crate::telemetry::replication as replication_metrics;

pub mod transport;

/// Replica-set configuration. An empty peer map is a single-node deployment:
/// the node is always leader and every append commits locally.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub node_id: u64,
    pub listen_addr: Option<SocketAddr>,
    /// Peer id to base URL, excluding this node.
    pub peers: HashMap<u64, String>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl ConsensusConfig {
    pub fn single_node(node_id: u64) -> Self {
        Self {
            node_id,
            listen_addr: None,
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("this node is not the leader")]
    NotLeader { leader_hint: Option<u64> },
    #[error("replication quorum not reached")]
    QuorumTimeout,
    #[error("replica append failed: {0}")]
    ReplicaAppend(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: u64,
    pub last_sequence: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: u64,
    pub entries: Vec<CommandEntry>,
    pub commit_sequence: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    pub last_sequence: u64,
}

/// Leadership confirmation for a linearizable read fence. Carries no entries;
/// a follower acknowledging it only attests that the sender is still the
/// leader of the current term.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadIndexRequest {
    pub term: u64,
    pub leader_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadIndexResponse {
    pub term: u64,
    pub ok: bool,
    pub commit_sequence: u64,
}

/// Entries a follower must persist before acknowledging, plus the commit
/// position it may apply through. The receiver answers with its new log tail.
pub struct ReplicaBatch {
    pub entries: Vec<CommandEntry>,
    pub commit_sequence: u64,
    pub respond: oneshot::Sender<Result<u64, String>>,
}

/// Read access to the committed log tail, used to repair a follower that
/// acknowledged behind the leader's append position.
#[async_trait]
pub trait LogReader: Send + Sync + 'static {
    async fn entries_after(&self, sequence: u64) -> Vec<CommandEntry>;
}

/// Reader for deployments with nothing to repair from (tests, single node).
pub struct NoLogReader;

#[async_trait]
impl LogReader for NoLogReader {
    async fn entries_after(&self, _sequence: u64) -> Vec<CommandEntry> {
        Vec::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct ConsensusState {
    term: u64,
    voted_for: Option<u64>,
    role: Role,
    leader_hint: Option<u64>,
    last_heartbeat: Instant,
    last_sequence: u64,
    commit_sequence: u64,
}

struct CoordinatorInner {
    config: ConsensusConfig,
    state: Mutex<ConsensusState>,
    leader: LeaderHandle,
    leadership_tx: watch::Sender<bool>,
    client: reqwest::Client,
    replica_sink: mpsc::Sender<ReplicaBatch>,
    log_reader: Arc<dyn LogReader>,
    shutdown_tx: watch::Sender<bool>,
}

/// Term-based leader election plus majority-ack replication of command
/// entries. A single leader accepts writes; an entry is committed once a
/// majority of replicas has durably appended it, and only committed entries
/// reach the state machine.
#[derive(Clone)]
pub struct ConsensusCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ConsensusCoordinator {
    pub async fn start(
        config: ConsensusConfig,
        replica_sink: mpsc::Sender<ReplicaBatch>,
        log_reader: Arc<dyn LogReader>,
    ) -> anyhow::Result<(Self, LeaderHandle, Vec<JoinHandle<()>>)> {
        let coordinator = Self::detached(config, replica_sink, log_reader);
        let mut tasks = Vec::new();

        if coordinator.inner.config.peers.is_empty() {
            // Single node: trivially leader, commits are local.
            let mut state = coordinator.inner.state.lock().await;
            state.term = 1;
            state.role = Role::Leader;
            state.leader_hint = Some(coordinator.inner.config.node_id);
            drop(state);
            coordinator.inner.leader.set_leader(true);
            let _ = coordinator.inner.leadership_tx.send(true);
            info!(node_id = coordinator.inner.config.node_id, "single-node consensus, assuming leadership");
        } else {
            let listen_addr = coordinator
                .inner
                .config
                .listen_addr
                .ok_or_else(|| anyhow::anyhow!("listen_addr is required with peers configured"))?;
            let listener = tokio::net::TcpListener::bind(listen_addr).await?;
            tasks.push(transport::spawn_server(
                coordinator.clone(),
                listener,
                coordinator.inner.shutdown_tx.subscribe(),
            ));
            tasks.push(coordinator.clone().spawn_election_loop());
            tasks.push(coordinator.clone().spawn_heartbeat_loop());
        }

        let handle = coordinator.inner.leader.clone();
        Ok((coordinator, handle, tasks))
    }

    fn detached(
        config: ConsensusConfig,
        replica_sink: mpsc::Sender<ReplicaBatch>,
        log_reader: Arc<dyn LogReader>,
    ) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (leadership_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                state: Mutex::new(ConsensusState {
                    term: 0,
                    voted_for: None,
                    role: Role::Follower,
                    leader_hint: None,
                    last_heartbeat: Instant::now(),
                    last_sequence: 0,
                    commit_sequence: 0,
                }),
                leader: LeaderHandle::new(leader_tx),
                leadership_tx,
                client: reqwest::Client::new(),
                replica_sink,
                log_reader,
                shutdown_tx,
            }),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.inner.config.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.is_leader()
    }

    /// Observe leadership transitions (gain and loss); the kernel rebuilds
    /// the wheel and resumes firing when this flips to true.
    pub fn leadership_watch(&self) -> watch::Receiver<bool> {
        self.inner.leadership_tx.subscribe()
    }

    pub async fn leader_hint(&self) -> Option<u64> {
        self.inner.state.lock().await.leader_hint
    }

    pub async fn ensure_leader(&self) -> Result<(), ConsensusError> {
        let state = self.inner.state.lock().await;
        if state.role == Role::Leader {
            Ok(())
        } else {
            Err(ConsensusError::NotLeader {
                leader_hint: state.leader_hint,
            })
        }
    }

    /// The leader appended an entry to its own log.
    pub async fn record_appended(&self, sequence: u64) {
        let mut state = self.inner.state.lock().await;
        state.last_sequence = state.last_sequence.max(sequence);
    }

    pub async fn commit_sequence(&self) -> u64 {
        self.inner.state.lock().await.commit_sequence
    }

    fn majority(&self) -> usize {
        (self.inner.config.peers.len() + 1) / 2 + 1
    }

    /// Replicate one appended entry to the peer set and wait for a majority
    /// of durable acknowledgements. On success the entry is committed.
    pub async fn replicate(&self, entry: &CommandEntry) -> Result<(), ConsensusError> {
        let (term, commit) = {
            let mut state = self.inner.state.lock().await;
            if state.role != Role::Leader {
                return Err(ConsensusError::NotLeader {
                    leader_hint: state.leader_hint,
                });
            }
            state.last_sequence = state.last_sequence.max(entry.sequence);
            if self.inner.config.peers.is_empty() {
                state.commit_sequence = state.commit_sequence.max(entry.sequence);
                return Ok(());
            }
            (state.term, state.commit_sequence)
        };

        let request = AppendRequest {
            term,
            leader_id: self.inner.config.node_id,
            entries: vec![entry.clone()],
            commit_sequence: commit,
        };

        let mut acks = 1usize; // our own durable append
        let mut set = JoinSet::new();
        for (peer_id, base_url) in self.inner.config.peers.clone() {
            let coordinator = self.clone();
            let request = request.clone();
            set.spawn(async move {
                (
                    peer_id,
                    coordinator.append_with_repair(&base_url, request).await,
                )
            });
        }

        let mut stale_term: Option<u64> = None;
        while let Some(joined) = set.join_next().await {
            let Ok((peer_id, outcome)) = joined else {
                continue;
            };
            match outcome {
                Some(response) if response.term > term => {
                    stale_term = Some(response.term);
                }
                Some(response) if response.success => {
                    acks += 1;
                }
                Some(response) => {
                    debug!(
                        peer_id,
                        peer_tail = response.last_sequence,
                        sequence = entry.sequence,
                        "peer rejected append"
                    );
                }
                None => {
                    debug!(peer_id, sequence = entry.sequence, "peer unreachable during replication");
                }
            }
        }

        if let Some(new_term) = stale_term {
            self.step_down(new_term).await;
            let state = self.inner.state.lock().await;
            return Err(ConsensusError::NotLeader {
                leader_hint: state.leader_hint,
            });
        }

        if acks >= self.majority() {
            let mut state = self.inner.state.lock().await;
            state.commit_sequence = state.commit_sequence.max(entry.sequence);
            Ok(())
        } else {
            warn!(
                sequence = entry.sequence,
                acks,
                needed = self.majority(),
                "replication quorum not reached"
            );
            Err(ConsensusError::QuorumTimeout)
        }
    }

    /// Append to one peer, repairing its log tail once if it reports being
    /// behind the entry we just sent.
    async fn append_with_repair(
        &self,
        base_url: &str,
        request: AppendRequest,
    ) -> Option<AppendResponse> {
        let first_sequence = request
            .entries
            .first()
            .map(|entry| entry.sequence)
            .unwrap_or(0);
        let response =
            transport::post_append(&self.inner.client, base_url, &request).await?;
        if response.success || response.term > request.term || first_sequence == 0 {
            return Some(response);
        }
        if response.last_sequence + 1 >= first_sequence {
            return Some(response);
        }

        let mut entries = self
            .inner
            .log_reader
            .entries_after(response.last_sequence)
            .await;
        if entries.is_empty() {
            return Some(response);
        }
        entries.retain(|entry| entry.sequence < first_sequence);
        entries.extend(request.entries.iter().cloned());
        let repair = AppendRequest {
            entries,
            ..request.clone()
        };
        transport::post_append(&self.inner.client, base_url, &repair).await
    }

    /// Linearizable read fence: confirm leadership against a majority and
    /// return the commit position a read must reflect.
    pub async fn read_index(&self) -> Result<u64, ConsensusError> {
        let (term, commit) = {
            let state = self.inner.state.lock().await;
            if state.role != Role::Leader {
                return Err(ConsensusError::NotLeader {
                    leader_hint: state.leader_hint,
                });
            }
            (state.term, state.commit_sequence)
        };
        if self.inner.config.peers.is_empty() {
            return Ok(commit);
        }

        let request = ReadIndexRequest {
            term,
            leader_id: self.inner.config.node_id,
        };
        let mut confirmations = 1usize;
        let mut set = JoinSet::new();
        for (_, base_url) in self.inner.config.peers.clone() {
            let client = self.inner.client.clone();
            let request = request.clone();
            set.spawn(async move { transport::post_read_index(&client, &base_url, &request).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(response)) = joined {
                if response.term > term {
                    self.step_down(response.term).await;
                    let state = self.inner.state.lock().await;
                    return Err(ConsensusError::NotLeader {
                        leader_hint: state.leader_hint,
                    });
                }
                if response.ok {
                    confirmations += 1;
                }
            }
        }
        if confirmations >= self.majority() {
            Ok(commit)
        } else {
            Err(ConsensusError::QuorumTimeout)
        }
    }

    async fn step_down(&self, new_term: u64) {
        let was_leader = {
            let mut state = self.inner.state.lock().await;
            let was_leader = state.role == Role::Leader;
            if new_term > state.term {
                state.term = new_term;
                state.voted_for = None;
            }
            state.role = Role::Follower;
            state.last_heartbeat = Instant::now();
            was_leader
        };
        if was_leader {
            self.inner.leader.set_leader(false);
            let _ = self.inner.leadership_tx.send(false);
            replication_metrics::record_leadership_transition(
                self.inner.config.node_id,
                replication_metrics::LeadershipState::Follower,
            );
            info!(node_id = self.inner.config.node_id, term = new_term, "stepped down");
        }
    }

    /// Vote handler: grant at most one vote per term, and only to candidates
    /// whose log is at least as long as ours.
    pub(crate) async fn handle_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.inner.state.lock().await;
        if request.term < state.term {
            return VoteResponse {
                term: state.term,
                granted: false,
            };
        }
        if request.term > state.term {
            state.term = request.term;
            state.voted_for = None;
            if state.role == Role::Leader {
                drop(state);
                self.step_down(request.term).await;
                state = self.inner.state.lock().await;
            } else {
                state.role = Role::Follower;
            }
        }

        let up_to_date = request.last_sequence >= state.last_sequence;
        let granted = up_to_date
            && state
                .voted_for
                .map(|candidate| candidate == request.candidate_id)
                .unwrap_or(true);
        if granted {
            state.voted_for = Some(request.candidate_id);
            state.last_heartbeat = Instant::now();
        }
        VoteResponse {
            term: state.term,
            granted,
        }
    }

    /// Read-fence handler: acknowledge the sender's leadership for its term.
    /// No entries travel here; commit propagation stays on the append path.
    pub(crate) async fn handle_read_index(&self, request: ReadIndexRequest) -> ReadIndexResponse {
        let mut state = self.inner.state.lock().await;
        if request.term < state.term {
            return ReadIndexResponse {
                term: state.term,
                ok: false,
                commit_sequence: state.commit_sequence,
            };
        }
        if request.term > state.term {
            state.term = request.term;
            state.voted_for = None;
        }
        if state.role == Role::Leader && request.leader_id != self.inner.config.node_id {
            drop(state);
            self.step_down(request.term).await;
            state = self.inner.state.lock().await;
        }
        state.role = Role::Follower;
        state.leader_hint = Some(request.leader_id);
        state.last_heartbeat = Instant::now();
        ReadIndexResponse {
            term: state.term,
            ok: true,
            commit_sequence: state.commit_sequence,
        }
    }

    /// Append handler (also the heartbeat path). Entries are durably
    /// persisted through the replica sink before they are acknowledged.
    pub(crate) async fn handle_append(&self, request: AppendRequest) -> AppendResponse {
        let (reject, last_sequence) = {
            let mut state = self.inner.state.lock().await;
            if request.term < state.term {
                (Some(state.term), state.last_sequence)
            } else {
                if request.term > state.term {
                    state.term = request.term;
                    state.voted_for = None;
                }
                if state.role == Role::Leader && request.leader_id != self.inner.config.node_id {
                    drop(state);
                    self.step_down(request.term).await;
                    state = self.inner.state.lock().await;
                }
                state.role = Role::Follower;
                state.leader_hint = Some(request.leader_id);
                state.last_heartbeat = Instant::now();
                (None, state.last_sequence)
            }
        };
        if let Some(term) = reject {
            return AppendResponse {
                term,
                success: false,
                last_sequence,
            };
        }

        let fresh: Vec<CommandEntry> = request
            .entries
            .into_iter()
            .filter(|entry| entry.sequence > last_sequence)
            .collect();

        if let Some(first) = fresh.first() {
            if first.sequence != last_sequence + 1 {
                // Gap: the leader repairs by resending from our tail.
                return AppendResponse {
                    term: request.term,
                    success: false,
                    last_sequence,
                };
            }
        }

        let commit = request.commit_sequence;
        let (respond_tx, respond_rx) = oneshot::channel();
        let batch = ReplicaBatch {
            entries: fresh,
            commit_sequence: commit,
            respond: respond_tx,
        };
        if self.inner.replica_sink.send(batch).await.is_err() {
            return AppendResponse {
                term: request.term,
                success: false,
                last_sequence,
            };
        }
        match respond_rx.await {
            Ok(Ok(new_tail)) => {
                let mut state = self.inner.state.lock().await;
                state.last_sequence = state.last_sequence.max(new_tail);
                state.commit_sequence = state.commit_sequence.max(commit.min(new_tail));
                AppendResponse {
                    term: request.term,
                    success: true,
                    last_sequence: state.last_sequence,
                }
            }
            Ok(Err(error)) => {
                warn!(%error, "replica append failed");
                AppendResponse {
                    term: request.term,
                    success: false,
                    last_sequence,
                }
            }
            Err(_) => AppendResponse {
                term: request.term,
                success: false,
                last_sequence,
            },
        }
    }

    fn spawn_election_loop(self) -> JoinHandle<()> {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let timeout = jittered_interval(
                    self.inner.config.election_timeout_min,
                    self.inner.config.election_timeout_max,
                );
                tokio::select! {
                    _ = sleep(timeout) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let should_run = {
                    let state = self.inner.state.lock().await;
                    state.role != Role::Leader
                        && state.last_heartbeat.elapsed() >= self.inner.config.election_timeout_min
                };
                if should_run {
                    self.run_election_round().await;
                }
            }
        })
    }

    async fn run_election_round(&self) {
        let node_id = self.inner.config.node_id;
        replication_metrics::record_election_attempt(node_id);

        let (term, last_sequence) = {
            let mut state = self.inner.state.lock().await;
            state.term += 1;
            state.voted_for = Some(node_id);
            state.role = Role::Candidate;
            (state.term, state.last_sequence)
        };

        let request = VoteRequest {
            term,
            candidate_id: node_id,
            last_sequence,
        };
        let mut votes = 1usize;
        let mut set = JoinSet::new();
        for (_, base_url) in self.inner.config.peers.clone() {
            let client = self.inner.client.clone();
            let request = request.clone();
            set.spawn(async move { transport::post_vote(&client, &base_url, &request).await });
        }
        let mut stale_term = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(response)) = joined {
                if response.term > term {
                    stale_term = Some(response.term);
                } else if response.granted {
                    votes += 1;
                }
            }
        }

        if let Some(new_term) = stale_term {
            self.step_down(new_term).await;
            replication_metrics::record_election_result(
                node_id,
                replication_metrics::ElectionResult::Contended,
            );
            return;
        }

        let mut state = self.inner.state.lock().await;
        if state.term != term || state.role != Role::Candidate {
            replication_metrics::record_election_result(
                node_id,
                replication_metrics::ElectionResult::Contended,
            );
            return;
        }
        if votes >= self.majority() {
            state.role = Role::Leader;
            state.leader_hint = Some(node_id);
            drop(state);
            self.inner.leader.set_leader(true);
            let _ = self.inner.leadership_tx.send(true);
            replication_metrics::record_election_result(
                node_id,
                replication_metrics::ElectionResult::Won,
            );
            replication_metrics::record_leadership_transition(
                node_id,
                replication_metrics::LeadershipState::Leader,
            );
            info!(node_id, term, "won election");
        } else {
            state.role = Role::Follower;
            replication_metrics::record_election_result(
                node_id,
                replication_metrics::ElectionResult::Contended,
            );
            debug!(node_id, term, votes, "election did not reach a majority");
        }
    }

    fn spawn_heartbeat_loop(self) -> JoinHandle<()> {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(self.inner.config.heartbeat_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let (term, commit, is_leader) = {
                    let state = self.inner.state.lock().await;
                    (
                        state.term,
                        state.commit_sequence,
                        state.role == Role::Leader,
                    )
                };
                if !is_leader {
                    continue;
                }

                let request = AppendRequest {
                    term,
                    leader_id: self.inner.config.node_id,
                    entries: Vec::new(),
                    commit_sequence: commit,
                };
                let mut set = JoinSet::new();
                for (_, base_url) in self.inner.config.peers.clone() {
                    let client = self.inner.client.clone();
                    let request = request.clone();
                    set.spawn(
                        async move { transport::post_append(&client, &base_url, &request).await },
                    );
                }
                while let Some(joined) = set.join_next().await {
                    if let Ok(Some(response)) = joined {
                        if response.term > term {
                            self.step_down(response.term).await;
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.leader.set_leader(false);
        let _ = self.inner.leadership_tx.send(false);
    }
}

fn jittered_interval(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    let jitter = thread_rng().gen_range(0..=span);
    min + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_timer, schedule_entry};

    fn sink() -> (mpsc::Sender<ReplicaBatch>, mpsc::Receiver<ReplicaBatch>) {
        mpsc::channel(16)
    }

    /// Drain replica batches the way the kernel apply task would: accept
    /// everything and report the new tail.
    fn drain_sink(mut rx: mpsc::Receiver<ReplicaBatch>) -> JoinHandle<Vec<CommandEntry>> {
        tokio::spawn(async move {
            let mut appended = Vec::new();
            let mut tail = 0u64;
            while let Some(batch) = rx.recv().await {
                for entry in batch.entries {
                    tail = tail.max(entry.sequence);
                    appended.push(entry);
                }
                let _ = batch.respond.send(Ok(tail));
            }
            appended
        })
    }

    #[tokio::test]
    async fn single_node_is_leader_and_commits_locally() {
        let (tx, _rx) = sink();
        let (coordinator, handle, _tasks) =
            ConsensusCoordinator::start(ConsensusConfig::single_node(1), tx, Arc::new(NoLogReader))
                .await
                .expect("start single node");
        assert!(handle.is_leader());
        coordinator.ensure_leader().await.expect("leader");

        let entry = schedule_entry(1, sample_timer("tenant-a"));
        coordinator.record_appended(1).await;
        coordinator.replicate(&entry).await.expect("local commit");
        assert_eq!(coordinator.commit_sequence().await, 1);
        assert_eq!(coordinator.read_index().await.expect("read index"), 1);
    }

    #[tokio::test]
    async fn votes_are_granted_once_per_term() {
        let (tx, _rx) = sink();
        let coordinator = ConsensusCoordinator::detached(
            ConsensusConfig {
                peers: HashMap::from([(2, "http://127.0.0.1:1".into())]),
                ..ConsensusConfig::single_node(1)
            },
            tx,
            Arc::new(NoLogReader),
        );

        let granted = coordinator
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: 2,
                last_sequence: 0,
            })
            .await;
        assert!(granted.granted);
        assert_eq!(granted.term, 3);

        // A different candidate in the same term is refused.
        let refused = coordinator
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: 9,
                last_sequence: 10,
            })
            .await;
        assert!(!refused.granted);

        // The same candidate asking again keeps its vote.
        let repeated = coordinator
            .handle_vote(VoteRequest {
                term: 3,
                candidate_id: 2,
                last_sequence: 0,
            })
            .await;
        assert!(repeated.granted);
    }

    #[tokio::test]
    async fn stale_terms_and_stale_logs_are_refused() {
        let (tx, _rx) = sink();
        let coordinator = ConsensusCoordinator::detached(
            ConsensusConfig {
                peers: HashMap::from([(2, "http://127.0.0.1:1".into())]),
                ..ConsensusConfig::single_node(1)
            },
            tx,
            Arc::new(NoLogReader),
        );
        coordinator.record_appended(5).await;

        let stale_term = coordinator
            .handle_vote(VoteRequest {
                term: 0,
                candidate_id: 2,
                last_sequence: 99,
            })
            .await;
        assert!(!stale_term.granted);

        let stale_log = coordinator
            .handle_vote(VoteRequest {
                term: 4,
                candidate_id: 2,
                last_sequence: 3,
            })
            .await;
        assert!(!stale_log.granted, "candidate with a shorter log is refused");
    }

    #[tokio::test]
    async fn read_index_confirmations_follow_term_rules() {
        let (tx, _rx) = sink();
        let coordinator = ConsensusCoordinator::detached(
            ConsensusConfig {
                peers: HashMap::from([(2, "http://127.0.0.1:1".into())]),
                ..ConsensusConfig::single_node(1)
            },
            tx,
            Arc::new(NoLogReader),
        );

        // A current-term leader is confirmed and refreshes the heartbeat.
        let confirmed = coordinator
            .handle_read_index(ReadIndexRequest {
                term: 3,
                leader_id: 7,
            })
            .await;
        assert!(confirmed.ok);
        assert_eq!(confirmed.term, 3);
        assert_eq!(coordinator.leader_hint().await, Some(7));

        // A deposed leader's fence is refused with the newer term.
        let stale = coordinator
            .handle_read_index(ReadIndexRequest {
                term: 2,
                leader_id: 9,
            })
            .await;
        assert!(!stale.ok);
        assert_eq!(stale.term, 3);
    }

    #[tokio::test]
    async fn followers_persist_appends_in_order_and_reject_gaps() {
        let (tx, rx) = sink();
        let coordinator = ConsensusCoordinator::detached(
            ConsensusConfig {
                peers: HashMap::from([(2, "http://127.0.0.1:1".into())]),
                ..ConsensusConfig::single_node(1)
            },
            tx,
            Arc::new(NoLogReader),
        );
        let drained = drain_sink(rx);

        let timer = sample_timer("tenant-a");
        let accepted = coordinator
            .handle_append(AppendRequest {
                term: 2,
                leader_id: 7,
                entries: vec![schedule_entry(1, timer.clone())],
                commit_sequence: 0,
            })
            .await;
        assert!(accepted.success);
        assert_eq!(accepted.last_sequence, 1);

        // A gap (sequence 3 after 1) is refused with the current tail so the
        // leader can repair.
        let gap = coordinator
            .handle_append(AppendRequest {
                term: 2,
                leader_id: 7,
                entries: vec![schedule_entry(3, sample_timer("tenant-a"))],
                commit_sequence: 1,
            })
            .await;
        assert!(!gap.success);
        assert_eq!(gap.last_sequence, 1);

        // Stale leader terms are refused outright.
        let stale = coordinator
            .handle_append(AppendRequest {
                term: 1,
                leader_id: 9,
                entries: Vec::new(),
                commit_sequence: 0,
            })
            .await;
        assert!(!stale.success);
        assert_eq!(stale.term, 2);

        coordinator.shutdown().await;
        drop(coordinator);
        let appended = drained.await.expect("sink task");
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].sequence, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_nodes_elect_a_single_leader_and_replicate() {
        let port_a = allocate_port();
        let port_b = allocate_port();
        let url_a = format!("http://127.0.0.1:{port_a}");
        let url_b = format!("http://127.0.0.1:{port_b}");

        let (tx_a, rx_a) = sink();
        let (tx_b, rx_b) = sink();
        let _drain_a = drain_sink(rx_a);
        let drain_b = drain_sink(rx_b);

        let (node_a, handle_a, _tasks_a) = ConsensusCoordinator::start(
            ConsensusConfig {
                node_id: 1,
                listen_addr: Some(format!("127.0.0.1:{port_a}").parse().expect("addr")),
                peers: HashMap::from([(2, url_b.clone())]),
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
            },
            tx_a,
            Arc::new(NoLogReader),
        )
        .await
        .expect("start node a");

        let (node_b, handle_b, _tasks_b) = ConsensusCoordinator::start(
            ConsensusConfig {
                node_id: 2,
                listen_addr: Some(format!("127.0.0.1:{port_b}").parse().expect("addr")),
                peers: HashMap::from([(1, url_a.clone())]),
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
            },
            tx_b,
            Arc::new(NoLogReader),
        )
        .await
        .expect("start node b");

        let elected = wait_for(Duration::from_secs(5), || {
            handle_a.is_leader() ^ handle_b.is_leader()
        })
        .await;
        assert!(elected, "exactly one node should hold leadership");

        let (leader, follower_sink) = if handle_a.is_leader() {
            (node_a.clone(), drain_b)
        } else {
            (node_b.clone(), _drain_a)
        };

        let entry = schedule_entry(1, sample_timer("tenant-a"));
        leader.record_appended(1).await;
        leader.replicate(&entry).await.expect("majority commit");
        assert_eq!(leader.commit_sequence().await, 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
        drop(node_a);
        drop(node_b);
        let replicated = follower_sink.await.expect("follower sink");
        assert_eq!(replicated.len(), 1);
        assert_eq!(replicated[0].sequence, 1);
    }

    async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    fn allocate_port() -> u16 {
        std::net::TcpListener::bind(("127.0.0.1", 0))
            .expect("bind ephemeral port")
            .local_addr()
            .expect("read ephemeral addr")
            .port()
    }
}
