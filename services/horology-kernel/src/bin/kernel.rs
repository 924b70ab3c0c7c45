use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use horology_kernel::consensus::ConsensusConfig;
use horology_kernel::events::jetstream::{spawn_forwarder, JetStreamForwarderConfig};
use horology_kernel::grpc::HorologyKernelService;
use horology_kernel::{
    telemetry, EventSigner, HorologyKernel, KernelRuntimeOptions, PolicyStore, SchedulerConfig,
    TimerSpec,
};
use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry_handle = match telemetry::init() {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing_subscriber::fmt::try_init().ok();
            warn!(?error, "telemetry init failed; metrics disabled");
            None
        }
    };
    info!("Starting horology kernel");

    let kernel = build_kernel().await?;

    let mut logging_receiver = kernel.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match logging_receiver.recv().await {
                Ok(envelope) => info!(
                    event_id = %envelope.event_id,
                    tenant_id = %envelope.tenant_id,
                    kind = %envelope.kind,
                    state_version = envelope.state_version,
                    "timer event"
                ),
                Err(err) => {
                    warn!(?err, "event channel closed");
                    break;
                }
            }
        }
    });

    let jetstream_task = match jetstream_forwarder_config_from_env() {
        Some(config) => match spawn_forwarder(config, kernel.subscribe()).await {
            Ok(handle) => Some(handle),
            Err(error) => {
                warn!(
                    ?error,
                    "Failed to start JetStream forwarder; continuing without NATS publishing"
                );
                None
            }
        },
        None => None,
    };

    let metrics_task = match (&telemetry_handle, std::env::var("KERNEL_METRICS_ADDR").ok()) {
        (Some(handle), Some(addr)) => {
            let addr: SocketAddr = addr.parse()?;
            Some(handle.serve_metrics(addr).await?)
        }
        _ => None,
    };

    // Testing aid: prove the pipeline end-to-end on a fresh deployment.
    if std::env::var("MINOOTS_BOOT_DEMO").is_ok() {
        info!("Scheduling demo timer");
        match kernel.authenticate("demo", "demo-bootstrap-key") {
            Ok(principal) => {
                let mut spec = TimerSpec::new("demo", "bootstrap", 5_000);
                spec.name = Some("demo-timer".into());
                if let Err(error) = kernel.schedule(&principal, spec).await {
                    warn!(?error, "demo timer was rejected");
                }
            }
            Err(error) => warn!(?error, "demo tenant could not authenticate"),
        }
    }

    let grpc_addr: SocketAddr = std::env::var("KERNEL_GRPC_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
        .parse()?;
    let grpc_service = HorologyKernelService::new(kernel.clone());

    info!(%grpc_addr, "Starting horology kernel gRPC server");
    Server::builder()
        .add_service(grpc_service.into_server())
        .serve_with_shutdown(grpc_addr, async {
            signal::ctrl_c()
                .await
                .expect("failed to listen for shutdown signal");
        })
        .await
        .map_err(|error| {
            error!(?error, "gRPC server error");
            anyhow::anyhow!(error)
        })?;

    info!("Shutting down horology kernel");
    kernel.shutdown().await;
    event_task.abort();
    if let Some(handle) = jetstream_task {
        handle.abort();
    }
    if let Some(handle) = metrics_task {
        handle.abort();
    }
    if let Some(handle) = telemetry_handle {
        handle.shutdown();
    }
    Ok(())
}

async fn build_kernel() -> anyhow::Result<HorologyKernel> {
    let config = SchedulerConfig::default();

    let policies = match std::env::var("KERNEL_TENANTS_PATH") {
        Ok(path) if !path.trim().is_empty() => {
            let store = PolicyStore::load_from_file(std::path::Path::new(&path))?;
            info!(%path, "loaded tenant policies");
            Arc::new(store)
        }
        _ => {
            warn!("KERNEL_TENANTS_PATH not configured; accepting any tenant (development mode)");
            Arc::new(PolicyStore::permissive_dev())
        }
    };

    let signer = match std::env::var("KERNEL_ENVELOPE_SECRET")
        .or_else(|_| std::env::var("EVENT_ENVELOPE_SECRET"))
    {
        Ok(secret) if !secret.trim().is_empty() => Arc::new(EventSigner::new(secret.as_bytes())),
        _ => {
            warn!("KERNEL_ENVELOPE_SECRET not configured; using insecure development secret");
            Arc::new(EventSigner::insecure_dev())
        }
    };

    let persist_dir = std::env::var("KERNEL_PERSIST_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    if let Some(dir) = &persist_dir {
        info!(path = %dir.display(), "durable log/snapshot store enabled");
    } else {
        warn!("KERNEL_PERSIST_PATH not configured; running with in-memory state only");
    }

    let consensus = consensus_config_from_env()?;
    if let Some(consensus) = &consensus {
        info!(
            node_id = consensus.node_id,
            peers = consensus.peers.len(),
            "joining replica set"
        );
    }

    let kernel = HorologyKernel::with_runtime(
        config,
        KernelRuntimeOptions {
            policies,
            signer,
            persist_dir,
            consensus,
        },
    )
    .await?;
    Ok(kernel)
}

fn consensus_config_from_env() -> anyhow::Result<Option<ConsensusConfig>> {
    let Ok(node_id_raw) = std::env::var("KERNEL_NODE_ID") else {
        return Ok(None);
    };
    let node_id: u64 = node_id_raw
        .parse()
        .map_err(|error| anyhow::anyhow!("invalid KERNEL_NODE_ID: {error}"))?;

    let peers = match std::env::var("KERNEL_PEERS") {
        Ok(raw) if !raw.trim().is_empty() => parse_peer_map(&raw, node_id)?,
        _ => HashMap::new(),
    };

    let listen_addr = if peers.is_empty() {
        None
    } else {
        let addr = std::env::var("KERNEL_CONSENSUS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7207".to_string())
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid KERNEL_CONSENSUS_ADDR: {error}"))?;
        Some(addr)
    };

    Ok(Some(ConsensusConfig {
        node_id,
        listen_addr,
        peers,
        election_timeout_min: Duration::from_millis(env_u64("KERNEL_ELECTION_MIN_MS", 300)),
        election_timeout_max: Duration::from_millis(env_u64("KERNEL_ELECTION_MAX_MS", 600)),
        heartbeat_interval: Duration::from_millis(env_u64("KERNEL_HEARTBEAT_MS", 100)),
    }))
}

fn jetstream_forwarder_config_from_env() -> Option<JetStreamForwarderConfig> {
    let servers = std::env::var("NATS_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())?;
    let subject = std::env::var("NATS_SUBJECT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "minoots.timer.fired".to_string());
    let dlq_subject = std::env::var("NATS_DLQ_SUBJECT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{subject}.dlq"));
    let mut config = JetStreamForwarderConfig::new(servers, subject, dlq_subject);
    config.stream = std::env::var("NATS_STREAM")
        .ok()
        .filter(|value| !value.trim().is_empty());
    config.max_deliver = env_u64("NATS_MAX_DELIVER", 5) as u32;
    Some(config)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_peer_map(value: &str, local_id: u64) -> anyhow::Result<HashMap<u64, String>> {
    let mut map = HashMap::new();
    for pair in value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        let (id_raw, addr) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid KERNEL_PEERS entry '{pair}'"))?;
        let id: u64 = id_raw
            .trim()
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid peer id '{id_raw}': {error}"))?;
        if id == local_id {
            continue;
        }
        map.insert(id, addr.trim().to_string());
    }
    Ok(map)
}
