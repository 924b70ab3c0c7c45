use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod admission;
pub mod clock;
pub mod command;
pub mod consensus;
pub mod events;
pub mod grpc;
pub mod jitter;
pub mod leadership;
pub mod persistence;
pub mod policy;
pub mod signing;
pub mod state_machine;
pub mod telemetry;
pub mod temporal_graph;
pub mod test_support;
pub mod wheel;

pub mod pb {
    tonic::include_proto!("minoots.timer.v1");
}

pub use admission::{AdmissionGate, SignedCommand};
pub use command::{SettleOutcome, TimerCommand};
pub use events::{EventEnvelope, TimerEvent};
pub use jitter::JitterPolicy;
pub use pb::horology_kernel_server::HorologyKernelServer;
pub use policy::{PolicyStore, Principal, TenantPolicy};
pub use signing::EventSigner;
pub use temporal_graph::TemporalGraphSpec;

use clock::KernelClock;
use command::CommandEntry;
use consensus::{ConsensusConfig, ConsensusCoordinator, ConsensusError, LogReader, ReplicaBatch};
use events::EventBus;
use jitter::JitterMonitor;
use leadership::LeaderHandle;
use persistence::{CommandWal, PersistDir, PersistenceError, SnapshotPayload, SnapshotStore};
use state_machine::{Applied, ApplyError, StateMachine};
use telemetry::scheduling as scheduling_metrics;
use temporal_graph::TemporalGraphExecutor;
use wheel::{ArmDecision, TimerWheel};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_duration_ms: Option<u64>,
    /// Deadlines beyond this horizon wait in the cold store instead of the
    /// wheel.
    pub arm_ahead_horizon: Duration,
    pub max_fires_per_tick: usize,
    /// Snapshot every N applied log entries.
    pub snapshot_interval: u64,
    /// Envelopes retained for stream resume.
    pub event_retention: usize,
    /// Server-side deadline for Schedule/Cancel/Settle.
    pub mutation_deadline: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_duration_ms: Some(1000 * 60 * 60 * 24 * 30), // 30 days
            arm_ahead_horizon: Duration::from_secs(60),
            max_fires_per_tick: 256,
            snapshot_interval: 512,
            event_retention: 4096,
            mutation_deadline: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{0}")]
    Validation(String),
    #[error("api key could not be authenticated")]
    Unauthenticated,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("timer id already exists with a different payload")]
    Conflict,
    #[error("timer not found")]
    NotFound,
    #[error("timer already settled")]
    AlreadySettled,
    #[error("kernel unavailable: {0}")]
    Unavailable(String),
    #[error("request deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("internal kernel failure: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ApplyError> for KernelError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Conflict => KernelError::Conflict,
            ApplyError::NotFound => KernelError::NotFound,
            ApplyError::AlreadySettled => KernelError::AlreadySettled,
        }
    }
}

impl From<ConsensusError> for KernelError {
    fn from(err: ConsensusError) -> Self {
        match err {
            ConsensusError::NotLeader { leader_hint } => KernelError::Unavailable(match leader_hint
            {
                Some(id) => format!("not the leader; current leader is node {id}"),
                None => "not the leader; no leader elected".to_string(),
            }),
            ConsensusError::QuorumTimeout => {
                KernelError::Unavailable("replication quorum not reached".into())
            }
            ConsensusError::ReplicaAppend(reason) => {
                KernelError::Unavailable(format!("replica append failed: {reason}"))
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Scheduled,
    Armed,
    Fired,
    Cancelled,
    Failed,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::Scheduled => "scheduled",
            TimerStatus::Armed => "armed",
            TimerStatus::Fired => "fired",
            TimerStatus::Cancelled => "cancelled",
            TimerStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(TimerStatus::Scheduled),
            "armed" => Some(TimerStatus::Armed),
            "fired" => Some(TimerStatus::Fired),
            "cancelled" => Some(TimerStatus::Cancelled),
            "failed" => Some(TimerStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TimerStatus::Fired | TimerStatus::Cancelled | TimerStatus::Failed
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Escalation {
    pub after_attempts: u32,
    pub escalates_to: Option<Box<TimerAction>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerAction {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub escalation: Option<Box<Escalation>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerActionBundle {
    pub actions: Vec<TimerAction>,
    pub concurrency: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub adapter: String,
    pub target: String,
    #[serde(default)]
    pub payload_template: serde_json::Value,
    pub acknowledgement_timeout_ms: u64,
}

/// Client-facing schedule request, after duration normalisation by the RPC
/// layer. `fire_at` is only set when the caller supplied an absolute instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSpec {
    pub tenant_id: String,
    pub requested_by: String,
    pub name: Option<String>,
    pub duration_ms: u64,
    pub fire_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub action_bundle: Option<TimerActionBundle>,
    pub agent_binding: Option<AgentBinding>,
    #[serde(default)]
    pub jitter_policy: Option<JitterPolicy>,
    #[serde(default)]
    pub temporal_graph: Option<TemporalGraphSpec>,
    #[serde(default)]
    pub client_timer_id: Option<String>,
    #[serde(default)]
    pub graph_root_id: Option<Uuid>,
    #[serde(default)]
    pub graph_node_id: Option<String>,
}

impl TimerSpec {
    pub fn new(tenant_id: &str, requested_by: &str, duration_ms: u64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            requested_by: requested_by.to_string(),
            name: None,
            duration_ms,
            fire_at: None,
            metadata: None,
            labels: HashMap::new(),
            action_bundle: None,
            agent_binding: None,
            jitter_policy: None,
            temporal_graph: None,
            client_timer_id: None,
            graph_root_id: None,
            graph_node_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerInstance {
    pub id: Uuid,
    pub tenant_id: String,
    pub requested_by: String,
    pub name: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub action_bundle: Option<TimerActionBundle>,
    pub agent_binding: Option<AgentBinding>,
    #[serde(default)]
    pub jitter_policy: Option<JitterPolicy>,
    #[serde(default)]
    pub jitter_offset_ms: i64,
    #[serde(default)]
    pub temporal_graph: Option<TemporalGraphSpec>,
    #[serde(default)]
    pub graph_root_id: Option<Uuid>,
    #[serde(default)]
    pub graph_node_id: Option<String>,
    #[serde(default)]
    pub client_timer_id: Option<String>,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default)]
    pub state_version: u64,
    pub fired_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl TimerInstance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The jitter-perturbed deadline, before drift compensation.
    pub fn perturbed_fire_at(&self) -> DateTime<Utc> {
        self.fire_at + chrono::Duration::milliseconds(self.jitter_offset_ms)
    }
}

/// Runtime wiring for a full kernel: policies, signing secret, durable
/// directory and the replica-set configuration.
pub struct KernelRuntimeOptions {
    pub policies: Arc<PolicyStore>,
    pub signer: Arc<EventSigner>,
    pub persist_dir: Option<PathBuf>,
    pub consensus: Option<ConsensusConfig>,
}

impl KernelRuntimeOptions {
    /// In-memory, single-node, permissive-auth kernel for development and
    /// tests.
    pub fn in_memory() -> Self {
        Self {
            policies: Arc::new(PolicyStore::permissive_dev()),
            signer: Arc::new(EventSigner::insecure_dev()),
            persist_dir: None,
            consensus: None,
        }
    }
}

enum KernelRequest {
    Command {
        signed: SignedCommand,
        respond: Option<oneshot::Sender<Result<AppliedOutcome, KernelError>>>,
    },
    Arm {
        tenant_id: String,
        timer_id: Uuid,
    },
    LeadershipGained,
}

#[derive(Debug)]
struct AppliedOutcome {
    timer: TimerInstance,
    replayed: bool,
}

struct KernelInner {
    config: SchedulerConfig,
    gate: AdmissionGate,
    policies: Arc<PolicyStore>,
    signer: Arc<EventSigner>,
    bus: EventBus,
    clock: KernelClock,
    wheel: TimerWheel,
    jitter: JitterMonitor,
    graphs: TemporalGraphExecutor,
    state: RwLock<StateMachine>,
    pipeline_tx: mpsc::UnboundedSender<KernelRequest>,
    leader: LeaderHandle,
    coordinator: Option<ConsensusCoordinator>,
    shutdown_tx: watch::Sender<bool>,
}

/// The horology kernel: admission gate in front, write-ahead log and replica
/// set underneath, one apply task owning the state machine and the wheel
/// feeding the firing loop.
#[derive(Clone)]
pub struct HorologyKernel {
    inner: Arc<KernelInner>,
}

impl std::fmt::Debug for HorologyKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HorologyKernel").finish()
    }
}

struct WalLogReader {
    path: PathBuf,
}

#[async_trait::async_trait]
impl LogReader for WalLogReader {
    async fn entries_after(&self, sequence: u64) -> Vec<CommandEntry> {
        match CommandWal::read_entries(&self.path).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| entry.sequence > sequence)
                .collect(),
            Err(error) => {
                warn!(?error, "failed to read log tail for follower repair");
                Vec::new()
            }
        }
    }
}

impl HorologyKernel {
    /// In-memory development kernel: single node, permissive policies.
    pub fn new(config: SchedulerConfig) -> Self {
        let options = KernelRuntimeOptions::in_memory();
        let (replica_tx, replica_rx) = mpsc::channel(64);
        drop(replica_tx);
        Self::build(
            config,
            options.policies,
            options.signer,
            StateMachine::new(),
            0,
            None,
            None,
            None,
            LeaderHandle::standalone(),
            replica_rx,
        )
    }

    /// Full runtime: recover durable state, join the replica set, resume
    /// firing. Corrupted durable state is fatal here by design.
    pub async fn with_runtime(
        config: SchedulerConfig,
        options: KernelRuntimeOptions,
    ) -> anyhow::Result<Self> {
        let mut machine = StateMachine::new();
        let mut wal = None;
        let mut snapshots = None;
        let mut next_sequence = 0u64;
        let mut wal_path = None;

        if let Some(dir) = &options.persist_dir {
            let dir = PersistDir::prepare(dir.clone()).await?;
            let snapshot_store = SnapshotStore::new(dir.snapshot_path());
            let snapshot = snapshot_store.load().await.map_err(|err| {
                error!(%err, "fatal: snapshot unreadable, refusing to serve");
                err
            })?;
            if let Some(snapshot) = &snapshot {
                machine.restore(snapshot.applied_sequence, snapshot.timers.clone());
            }

            let (command_wal, entries) = CommandWal::open(dir.wal_path()).await.map_err(|err| {
                error!(%err, "fatal: command log unreadable, refusing to serve");
                err
            })?;
            let snapshot_floor = snapshot.map(|s| s.applied_sequence).unwrap_or(0);
            for entry in entries
                .iter()
                .filter(|entry| entry.sequence > snapshot_floor)
            {
                // Rejections are part of the deterministic history.
                if let Err(err) = machine.apply(entry) {
                    debug!(sequence = entry.sequence, %err, "replayed command was rejected");
                }
            }
            next_sequence = command_wal.last_sequence().max(snapshot_floor);
            wal_path = Some(dir.wal_path());
            wal = Some(command_wal);
            snapshots = Some(snapshot_store);

            // Active-timer accounting restarts with the process; seed it from
            // the recovered state so max_active_timers stays enforceable.
            for timer in machine.non_terminal() {
                options.policies.note_active(&timer.tenant_id);
            }
            info!(
                applied_sequence = machine.applied_sequence(),
                timers = machine.len(),
                "recovered durable state"
            );
        }

        let (replica_tx, replica_rx) = mpsc::channel(64);
        let (coordinator, leader) = match &options.consensus {
            Some(consensus_config) => {
                let reader: Arc<dyn LogReader> = match &wal_path {
                    Some(path) => Arc::new(WalLogReader { path: path.clone() }),
                    None => Arc::new(consensus::NoLogReader),
                };
                let (coordinator, leader, _tasks) =
                    ConsensusCoordinator::start(consensus_config.clone(), replica_tx, reader)
                        .await?;
                coordinator.record_appended(next_sequence).await;
                (Some(coordinator), leader)
            }
            None => {
                drop(replica_tx);
                (None, LeaderHandle::standalone())
            }
        };

        Ok(Self::build(
            config,
            options.policies,
            options.signer,
            machine,
            next_sequence,
            wal,
            snapshots,
            coordinator,
            leader,
            replica_rx,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        config: SchedulerConfig,
        policies: Arc<PolicyStore>,
        signer: Arc<EventSigner>,
        machine: StateMachine,
        next_sequence: u64,
        wal: Option<CommandWal>,
        snapshots: Option<SnapshotStore>,
        coordinator: Option<ConsensusCoordinator>,
        leader: LeaderHandle,
        replica_rx: mpsc::Receiver<ReplicaBatch>,
    ) -> Self {
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(KernelInner {
            gate: AdmissionGate::new(policies.clone(), signer.clone(), config.max_duration_ms),
            bus: EventBus::new(signer.clone(), config.event_retention),
            wheel: TimerWheel::new(config.arm_ahead_horizon),
            clock: KernelClock::new(),
            jitter: JitterMonitor::new(),
            graphs: TemporalGraphExecutor::new(),
            state: RwLock::new(machine),
            pipeline_tx,
            leader,
            coordinator,
            shutdown_tx,
            policies,
            signer,
            config,
        });

        let kernel = Self { inner };
        kernel.rebuild_wheel_blocking();

        let worker = ApplyWorker {
            inner: kernel.inner.clone(),
            wal,
            snapshots,
            next_sequence,
            pending: BTreeMap::new(),
        };
        tokio::spawn(worker.run(pipeline_rx, replica_rx, kernel.inner.shutdown_tx.subscribe()));
        tokio::spawn(run_firing_loop(
            kernel.inner.clone(),
            kernel.inner.shutdown_tx.subscribe(),
        ));
        if let Some(coordinator) = &kernel.inner.coordinator {
            tokio::spawn(watch_leadership(
                kernel.inner.clone(),
                coordinator.leadership_watch(),
                kernel.inner.shutdown_tx.subscribe(),
            ));
        }

        kernel
    }

    /// Arm every non-terminal timer into the wheel without emitting events;
    /// used on startup and on leadership changes. Overdue timers become due
    /// immediately (at-least-once firing).
    fn rebuild_wheel_blocking(&self) {
        let inner = &self.inner;
        inner.wheel.clear();
        let timers = match inner.state.try_read() {
            Ok(state) => state.non_terminal(),
            Err(_) => return,
        };
        let now = inner.clock.now();
        let mut armed = 0usize;
        for timer in &timers {
            if inner.wheel.insert(
                &inner.clock,
                now,
                &timer.tenant_id,
                timer.id,
                timer.perturbed_fire_at(),
            ) == ArmDecision::Armed
            {
                armed += 1;
                if let Ok(mut state) = inner.state.try_write() {
                    // Silent arm: recovery re-derives volatile state.
                    let _ = state.arm(&timer.tenant_id, timer.id);
                }
            }
        }
        if !timers.is_empty() {
            info!(
                total = timers.len(),
                armed,
                cold = inner.wheel.cold_len(),
                "rebuilt the timer wheel"
            );
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.inner.gate
    }

    pub fn signer(&self) -> Arc<EventSigner> {
        self.inner.signer.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader.is_leader()
    }

    pub fn authenticate(&self, tenant_id: &str, api_key: &str) -> Result<Principal, KernelError> {
        self.inner.gate.authenticate(tenant_id, api_key)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.inner.bus.subscribe()
    }

    pub fn replay_events_after(&self, tenant_id: &str, after_bus_sequence: u64) -> Vec<EventEnvelope> {
        self.inner.bus.replay_after(tenant_id, after_bus_sequence)
    }

    pub async fn schedule(
        &self,
        principal: &Principal,
        spec: TimerSpec,
    ) -> Result<TimerInstance, KernelError> {
        let now = self.inner.clock.now();
        let signed = self.inner.gate.admit_schedule(principal, &spec, now)?;
        match self.submit(signed).await {
            Ok(outcome) => {
                if outcome.replayed {
                    // Idempotent retry: hand the reserved quota back.
                    self.inner.gate.release_reservation(&spec.tenant_id);
                }
                Ok(outcome.timer)
            }
            Err(err) => {
                // On a timeout the command may still commit; the reservation
                // stays so quota cannot be over-spent by retries.
                if !matches!(err, KernelError::Timeout) {
                    self.inner.gate.release_reservation(&spec.tenant_id);
                }
                Err(err)
            }
        }
    }

    pub async fn cancel(
        &self,
        principal: &Principal,
        timer_id: Uuid,
        reason: Option<String>,
    ) -> Result<TimerInstance, KernelError> {
        let now = self.inner.clock.now();
        let signed = self.inner.gate.admit_cancel(principal, timer_id, reason, now)?;
        Ok(self.submit(signed).await?.timer)
    }

    pub async fn settle(
        &self,
        principal: &Principal,
        timer_id: Uuid,
        outcome: SettleOutcome,
    ) -> Result<TimerInstance, KernelError> {
        let now = self.inner.clock.now();
        let signed = self
            .inner
            .gate
            .admit_settle(principal, timer_id, outcome, now)?;
        Ok(self.submit(signed).await?.timer)
    }

    pub async fn get(
        &self,
        principal: &Principal,
        timer_id: Uuid,
    ) -> Result<TimerInstance, KernelError> {
        self.inner.gate.authorize_read(principal)?;
        self.read_fence().await?;
        let state = self.inner.state.read().await;
        state
            .get(&principal.tenant_id, timer_id)
            .cloned()
            .ok_or(KernelError::NotFound)
    }

    pub async fn list(&self, principal: &Principal) -> Result<Vec<TimerInstance>, KernelError> {
        self.inner.gate.authorize_read(principal)?;
        self.read_fence().await?;
        let state = self.inner.state.read().await;
        Ok(state.list(&principal.tenant_id))
    }

    /// Linearizable reads: on a replica set, confirm leadership against a
    /// majority before reading; non-leaders answer with the leader hint.
    async fn read_fence(&self) -> Result<(), KernelError> {
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.read_index().await?;
        }
        Ok(())
    }

    async fn submit(&self, signed: SignedCommand) -> Result<AppliedOutcome, KernelError> {
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.ensure_leader().await.map_err(KernelError::from)?;
        }
        let (respond_tx, respond_rx) = oneshot::channel();
        self.inner
            .pipeline_tx
            .send(KernelRequest::Command {
                signed,
                respond: Some(respond_tx),
            })
            .map_err(|_| KernelError::Unavailable("kernel is shutting down".into()))?;
        respond_rx
            .await
            .map_err(|_| KernelError::Unavailable("kernel dropped the command".into()))?
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.shutdown().await;
        }
    }
}

/// The single apply task: serializes every command through the write-ahead
/// log and the replica set, applies it to the state machine, then runs the
/// scheduling side effects (wheel, events, graphs, quotas).
struct ApplyWorker {
    inner: Arc<KernelInner>,
    wal: Option<CommandWal>,
    snapshots: Option<SnapshotStore>,
    next_sequence: u64,
    /// Follower-side: appended but not yet committed entries.
    pending: BTreeMap<u64, CommandEntry>,
}

impl ApplyWorker {
    async fn run(
        mut self,
        mut pipeline_rx: mpsc::UnboundedReceiver<KernelRequest>,
        mut replica_rx: mpsc::Receiver<ReplicaBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut replica_open = true;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                request = pipeline_rx.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => break,
                    }
                }
                batch = replica_rx.recv(), if replica_open => {
                    match batch {
                        Some(batch) => self.handle_replica_batch(batch).await,
                        None => replica_open = false,
                    }
                }
            }
        }
        debug!("apply task exiting");
    }

    async fn handle_request(&mut self, request: KernelRequest) {
        match request {
            KernelRequest::Command { signed, respond } => {
                let result = self.commit_and_apply(signed).await;
                match respond {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => {
                        if let Err(err) = result {
                            warn!(%err, "internal command failed");
                        }
                    }
                }
            }
            KernelRequest::Arm {
                tenant_id,
                timer_id,
            } => self.arm_lifted_timer(&tenant_id, timer_id).await,
            KernelRequest::LeadershipGained => self.on_leadership_gained().await,
        }
    }

    async fn commit_and_apply(
        &mut self,
        signed: SignedCommand,
    ) -> Result<AppliedOutcome, KernelError> {
        if !self.inner.gate.verify(&signed) {
            return Err(KernelError::Internal(anyhow!(
                "command envelope failed signature verification"
            )));
        }
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.ensure_leader().await.map_err(KernelError::from)?;
        }

        let sequence = self.next_sequence + 1;
        let entry = CommandEntry {
            sequence,
            command: signed.command.clone(),
            received_at: signed.issued_at,
            signature: signed.signature.clone(),
        };

        // Write-ahead: the log is durable before anything is applied.
        if let Err(err) = self.append_durably(&entry).await {
            if let TimerCommand::Fire {
                tenant_id,
                timer_id,
                ..
            } = &entry.command
            {
                // A fire must never be lost: put it back on the wheel and
                // retry shortly.
                let retry_at = self.inner.clock.now() + chrono::Duration::seconds(1);
                self.inner.wheel.insert(
                    &self.inner.clock,
                    self.inner.clock.now(),
                    tenant_id,
                    *timer_id,
                    retry_at,
                );
            }
            return Err(err.into());
        }

        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.record_appended(sequence).await;
            coordinator.replicate(&entry).await.map_err(KernelError::from)?;
        }
        self.next_sequence = sequence;

        let applied = {
            let mut state = self.inner.state.write().await;
            state.apply(&entry)
        }
        .map_err(KernelError::from)?;

        self.post_apply(&applied).await;
        self.maybe_snapshot().await;

        Ok(AppliedOutcome {
            timer: applied.timer,
            replayed: applied.replayed,
        })
    }

    /// Retries transient append failures with backoff before giving up.
    async fn append_durably(&mut self, entry: &CommandEntry) -> Result<(), PersistenceError> {
        let Some(wal) = self.wal.as_mut() else {
            return Ok(());
        };
        let mut backoff = Duration::from_millis(10);
        let mut last_err = None;
        for _ in 0..3 {
            match wal.append(entry).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(%err, sequence = entry.sequence, "log append failed; retrying");
                    last_err = Some(err);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
        Err(last_err.expect("append failed at least once"))
    }

    async fn post_apply(&self, applied: &Applied) {
        if applied.replayed {
            return;
        }
        let inner = &self.inner;
        let is_leader = inner.leader.is_leader();

        for event in &applied.events {
            match event {
                TimerEvent::Scheduled(timer) => {
                    scheduling_metrics::record_transition("scheduled", &timer.tenant_id);
                    inner.bus.publish(event.clone(), None);
                    if is_leader {
                        self.arm_or_defer(timer).await;
                        if timer.graph_root_id.is_none() {
                            if let Some(graph) = &timer.temporal_graph {
                                let ready =
                                    inner.graphs.register_root(timer.id, graph.clone()).await;
                                self.schedule_graph_nodes(timer, timer.id, ready).await;
                            }
                        }
                    }
                }
                TimerEvent::Fired(timer) => {
                    scheduling_metrics::record_transition("fired", &timer.tenant_id);
                    let drift_ms = timer
                        .fired_at
                        .map(|fired_at| {
                            fired_at
                                .signed_duration_since(timer.perturbed_fire_at())
                                .num_milliseconds()
                        })
                        .unwrap_or(0);
                    scheduling_metrics::record_firing_drift(drift_ms);
                    inner
                        .jitter
                        .record(drift_ms, timer.jitter_policy.as_ref())
                        .await;
                    inner.bus.publish(event.clone(), Some(drift_ms));
                    if is_leader {
                        self.advance_graph(timer).await;
                    }
                }
                TimerEvent::Cancelled { timer, .. } => {
                    scheduling_metrics::record_transition("cancelled", &timer.tenant_id);
                    inner.wheel.remove(&timer.tenant_id, timer.id);
                    inner.bus.publish(event.clone(), None);
                }
                TimerEvent::Failed { timer, .. } => {
                    scheduling_metrics::record_transition("failed", &timer.tenant_id);
                    inner.wheel.remove(&timer.tenant_id, timer.id);
                    inner.bus.publish(event.clone(), None);
                }
                TimerEvent::Settled(timer) => {
                    scheduling_metrics::record_transition("settled", &timer.tenant_id);
                    inner.bus.publish(event.clone(), None);
                }
                TimerEvent::Armed(_) => {
                    // Arming is emitted by the wheel path, never by apply.
                }
            }
        }

        if applied.released_active {
            inner.policies.release_active(&applied.timer.tenant_id);
        }
    }

    /// Place a freshly scheduled timer: into the wheel (arming it) when its
    /// effective deadline is inside the horizon, into the cold store
    /// otherwise. The effective deadline is `fire_at + offset − compensation`.
    async fn arm_or_defer(&self, timer: &TimerInstance) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let mut effective = timer.perturbed_fire_at();
        if let Some(policy) = &timer.jitter_policy {
            let compensation = inner.jitter.compensation_ms(policy).await;
            if compensation > 0 {
                effective -= chrono::Duration::milliseconds(compensation);
                // Compensation never drags a deadline into the past.
                let floor = now + chrono::Duration::milliseconds(5);
                if effective < floor {
                    effective = floor.min(timer.perturbed_fire_at());
                }
            }
        }

        if inner.wheel.insert(&inner.clock, now, &timer.tenant_id, timer.id, effective)
            == ArmDecision::Armed
        {
            let armed = {
                let mut state = inner.state.write().await;
                state.arm(&timer.tenant_id, timer.id)
            };
            if let Some((_, event)) = armed {
                scheduling_metrics::record_transition("armed", &timer.tenant_id);
                inner.bus.publish(event, None);
            }
        }
    }

    /// A cold timer whose deadline entered the horizon: arm it for real.
    async fn arm_lifted_timer(&self, tenant_id: &str, timer_id: Uuid) {
        if !self.inner.leader.is_leader() {
            return;
        }
        let timer = {
            let state = self.inner.state.read().await;
            state.get(tenant_id, timer_id).cloned()
        };
        match timer {
            Some(timer) if !timer.is_terminal() => self.arm_or_defer(&timer).await,
            _ => {}
        }
    }

    /// Fired timer participates in a temporal graph: record the completion
    /// and schedule every node that became ready.
    async fn advance_graph(&self, timer: &TimerInstance) {
        let inner = &self.inner;
        let (root_id, node_id) = match (timer.graph_root_id, &timer.graph_node_id) {
            (Some(root_id), Some(node_id)) => (root_id, node_id.clone()),
            (None, _) if timer.temporal_graph.is_some() => {
                let root_node = inner
                    .graphs
                    .root_node(timer.id)
                    .await
                    .unwrap_or_else(|| "root".to_string());
                (timer.id, root_node)
            }
            _ => return,
        };
        let ready = inner.graphs.record_completion(root_id, &node_id).await;
        if !ready.is_empty() {
            self.schedule_graph_nodes(timer, root_id, ready).await;
        }
    }

    async fn schedule_graph_nodes(
        &self,
        template: &TimerInstance,
        root_id: Uuid,
        nodes: Vec<temporal_graph::TemporalGraphNode>,
    ) {
        let inner = &self.inner;
        let now = inner.clock.now();
        for node in nodes {
            let delay_ms = node.delay_ms();
            let mut spec = TimerSpec::new(&template.tenant_id, "temporal-graph", delay_ms);
            spec.name = Some(format!("{}/{}", template.name, node.id));
            spec.metadata = node.metadata.clone();
            spec.labels = node.labels.clone();
            spec.action_bundle = node
                .action_bundle
                .clone()
                .and_then(|value| serde_json::from_value(value).ok());
            spec.agent_binding = node
                .agent_binding
                .clone()
                .and_then(|value| serde_json::from_value(value).ok());
            spec.graph_root_id = Some(root_id);
            spec.graph_node_id = Some(node.id.clone());

            let timer = TimerInstance {
                id: Uuid::new_v4(),
                tenant_id: spec.tenant_id.clone(),
                requested_by: spec.requested_by.clone(),
                name: spec.name.clone().expect("graph nodes are named"),
                duration_ms: delay_ms,
                created_at: now,
                fire_at: now + chrono::Duration::milliseconds(delay_ms as i64),
                status: TimerStatus::Scheduled,
                metadata: spec.metadata.clone(),
                labels: spec.labels.clone(),
                action_bundle: spec.action_bundle.clone(),
                agent_binding: spec.agent_binding.clone(),
                jitter_policy: None,
                jitter_offset_ms: 0,
                temporal_graph: None,
                graph_root_id: Some(root_id),
                graph_node_id: Some(node.id.clone()),
                client_timer_id: None,
                payload_hash: command::schedule_payload_hash(&spec),
                state_version: 1,
                fired_at: None,
                cancelled_at: None,
                settled_at: None,
                cancel_reason: None,
                cancelled_by: None,
                failure_reason: None,
            };
            inner.policies.note_active(&timer.tenant_id);
            let signed = inner
                .gate
                .sign_internal(TimerCommand::Schedule { timer }, now);
            let _ = inner.pipeline_tx.send(KernelRequest::Command {
                signed,
                respond: None,
            });
        }
    }

    async fn maybe_snapshot(&mut self) {
        let interval = self.inner.config.snapshot_interval;
        if interval == 0 || self.next_sequence == 0 || self.next_sequence % interval != 0 {
            return;
        }
        let (Some(snapshots), Some(wal)) = (self.snapshots.as_ref(), self.wal.as_mut()) else {
            return;
        };

        let payload = {
            let state = self.inner.state.read().await;
            SnapshotPayload {
                applied_sequence: state.applied_sequence(),
                taken_at: self.inner.clock.now(),
                timers: state.snapshot_timers(),
            }
        };
        match snapshots.save(&payload).await {
            Ok(()) => {
                if let Err(err) = wal.truncate_through(payload.applied_sequence).await {
                    warn!(%err, "failed to truncate the command log after snapshot");
                } else {
                    info!(
                        applied_sequence = payload.applied_sequence,
                        timers = payload.timers.len(),
                        "snapshot taken, log prefix truncated"
                    );
                }
            }
            Err(err) => warn!(%err, "snapshot failed; log retained"),
        }
    }

    async fn handle_replica_batch(&mut self, batch: ReplicaBatch) {
        for entry in &batch.entries {
            if entry.sequence <= self.next_sequence {
                continue;
            }
            if let Err(err) = self.append_durably(entry).await {
                let _ = batch.respond.send(Err(err.to_string()));
                return;
            }
            self.next_sequence = entry.sequence;
            self.pending.insert(entry.sequence, entry.clone());
        }

        // Apply everything the leader has committed, in order.
        while let Some((&sequence, _)) = self.pending.iter().next() {
            if sequence > batch.commit_sequence {
                break;
            }
            let entry = self.pending.remove(&sequence).expect("pending entry");
            self.apply_replicated(&entry).await;
        }

        let _ = batch.respond.send(Ok(self.next_sequence));
    }

    async fn apply_replicated(&mut self, entry: &CommandEntry) {
        let applied = {
            let mut state = self.inner.state.write().await;
            state.apply(entry)
        };
        match applied {
            Ok(applied) => self.post_apply(&applied).await,
            Err(err) => {
                debug!(sequence = entry.sequence, %err, "replicated command was rejected")
            }
        }
        self.maybe_snapshot().await;
    }

    /// This node became leader: commit whatever the old leader left pending
    /// in our log, recalibrate the clock and rebuild the wheel. Overdue
    /// timers fire immediately.
    async fn on_leadership_gained(&mut self) {
        let pending: Vec<CommandEntry> = std::mem::take(&mut self.pending).into_values().collect();
        for entry in &pending {
            self.apply_replicated(entry).await;
        }
        if let Some(coordinator) = &self.inner.coordinator {
            coordinator.record_appended(self.next_sequence).await;
        }
        self.inner.clock.recalibrate();

        self.inner.wheel.clear();
        let timers = {
            let state = self.inner.state.read().await;
            state.non_terminal()
        };
        info!(timers = timers.len(), "leadership gained; rebuilding the wheel");
        for timer in &timers {
            self.arm_or_defer(timer).await;
        }
    }
}

async fn watch_leadership(
    inner: Arc<KernelInner>,
    mut leadership: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut was_leader = *leadership.borrow();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
                let is_leader = *leadership.borrow();
                if is_leader && !was_leader {
                    let _ = inner.pipeline_tx.send(KernelRequest::LeadershipGained);
                }
                was_leader = is_leader;
            }
        }
    }
}

/// The firing loop: sleep until the earliest armed deadline, drain everything
/// due in one batch, and push `Fire` commands through the commit pipeline.
/// Only the leader drains; followers keep an empty wheel.
async fn run_firing_loop(inner: Arc<KernelInner>, mut shutdown: watch::Receiver<bool>) {
    let mut cold_tick = tokio::time::interval(Duration::from_secs(1));
    cold_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if let Some(skew_ms) = inner.clock.detect_jump() {
            warn!(skew_ms, "wall-clock jump detected; translation table recalibrated");
        }

        if inner.leader.is_leader() {
            for (tenant_id, timer_id, _nominal) in inner.wheel.take_liftable(inner.clock.now()) {
                let _ = inner.pipeline_tx.send(KernelRequest::Arm {
                    tenant_id,
                    timer_id,
                });
            }
        }

        let next = inner.wheel.next_deadline();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = cold_tick.tick() => {}
            _ = inner.wheel.changed() => {}
            _ = sleep_until_or_forever(next) => {}
        }

        if !inner.leader.is_leader() {
            continue;
        }
        let due = inner
            .wheel
            .drain_due(Instant::now(), inner.config.max_fires_per_tick);
        for due_timer in due {
            let at = inner.clock.now();
            let signed = inner.gate.sign_internal(
                TimerCommand::Fire {
                    tenant_id: due_timer.tenant_id,
                    timer_id: due_timer.timer_id,
                    at,
                },
                at,
            );
            let _ = inner.pipeline_tx.send(KernelRequest::Command {
                signed,
                respond: None,
            });
        }
    }
    debug!("firing loop exiting");
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub use admission::parse_duration_ms;
