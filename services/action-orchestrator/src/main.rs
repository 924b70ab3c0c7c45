use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::pull, AckKind};
use tokio_stream::StreamExt;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{error, info, warn};
use uuid::Uuid;

mod envelope;
mod executor;

pub mod pb {
    tonic::include_proto!("minoots.timer.v1");
}

use envelope::EventEnvelope;
use executor::ActionExecutor;
use pb::horology_kernel_client::HorologyKernelClient;

const DEV_SECRET: &[u8] = b"minoots-insecure-dev-secret";
const SEEN_CAPACITY: usize = 4096;

/// Dedupe window over envelope ids: subscribers see at-least-once delivery
/// and must not execute the same fire twice.
struct SeenEvents {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl SeenEvents {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, id: Uuid) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

/// Settles fired timers back into the kernel over gRPC.
#[derive(Clone)]
struct SettleClient {
    channel: Channel,
    api_key: String,
}

impl SettleClient {
    fn new(endpoint: String, api_key: String) -> Result<Self> {
        let channel = Channel::from_shared(endpoint)
            .context("invalid KERNEL_GRPC_URL")?
            .connect_lazy();
        Ok(Self { channel, api_key })
    }

    async fn settle(
        &self,
        envelope: &EventEnvelope,
        success: bool,
        failure_reason: Option<String>,
    ) -> Result<()> {
        let mut client = HorologyKernelClient::new(self.channel.clone());
        let mut request = Request::new(pb::TimerSettleRequest {
            tenant_id: envelope.tenant_id.clone(),
            timer_id: envelope.timer_id.to_string(),
            success,
            failure_reason: failure_reason.unwrap_or_default(),
        });
        request.metadata_mut().insert(
            "x-tenant-id",
            MetadataValue::try_from(envelope.tenant_id.as_str())
                .context("tenant id is not valid metadata")?,
        );
        request.metadata_mut().insert(
            "x-api-key",
            MetadataValue::try_from(self.api_key.as_str())
                .context("api key is not valid metadata")?,
        );
        client
            .settle_timer(request)
            .await
            .context("SettleTimer call failed")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting MINOOTS Action Orchestrator");

    let allow_commands = std::env::var("MINOOTS_ALLOW_COMMANDS")
        .map(|value| value == "true")
        .unwrap_or(false);
    let executor = ActionExecutor::new(allow_commands);

    if std::env::var("DEMO_MODE").is_ok() {
        info!("Running in demo mode - simulating timer events");
        simulate_timer_events(executor).await;
        return Ok(());
    }

    let servers = std::env::var("NATS_URL").context("NATS_URL must be set")?;
    let subject = std::env::var("NATS_SUBJECT").unwrap_or_else(|_| "minoots.timer.fired".into());
    let stream_name = std::env::var("NATS_STREAM").unwrap_or_else(|_| "MINOOTS_TIMER".into());
    let consumer_name =
        std::env::var("ORCHESTRATOR_CONSUMER").unwrap_or_else(|_| "minoots-orchestrator".into());
    let max_deliver = std::env::var("ORCHESTRATOR_MAX_DELIVER")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(5);
    let secret = std::env::var("EVENT_ENVELOPE_SECRET")
        .map(|value| value.into_bytes())
        .unwrap_or_else(|_| {
            warn!("EVENT_ENVELOPE_SECRET not configured; using insecure development secret");
            DEV_SECRET.to_vec()
        });

    let settle = SettleClient::new(
        std::env::var("KERNEL_GRPC_URL").unwrap_or_else(|_| "http://127.0.0.1:50051".into()),
        std::env::var("ORCHESTRATOR_API_KEY").unwrap_or_else(|_| "orchestrator-dev-key".into()),
    )?;

    let client = async_nats::connect(&servers)
        .await
        .with_context(|| format!("failed to connect to NATS at {servers}"))?;
    let js = jetstream::new(client);
    let stream = js
        .get_stream(&stream_name)
        .await
        .map_err(|error| anyhow::anyhow!("failed to open stream {stream_name}: {error}"))?;
    let consumer = stream
        .create_consumer(pull::Config {
            durable_name: Some(consumer_name.clone()),
            filter_subject: subject.clone(),
            max_deliver,
            ..Default::default()
        })
        .await
        .map_err(|error| anyhow::anyhow!("failed to create durable consumer: {error}"))?;

    info!(%subject, consumer = %consumer_name, "consuming fired-timer envelopes");
    let mut seen = SeenEvents::new();
    let mut messages = consumer
        .messages()
        .await
        .map_err(|error| anyhow::anyhow!("failed to open message stream: {error}"))?;

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "failed to pull message");
                continue;
            }
        };

        let envelope: EventEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "terminating malformed envelope");
                let _ = message.ack_with(AckKind::Term).await;
                continue;
            }
        };

        if !envelope.verify(&secret) {
            warn!(event_id = %envelope.event_id, "terminating envelope with bad signature");
            let _ = message.ack_with(AckKind::Term).await;
            continue;
        }

        if envelope.kind != "timer.fired" {
            let _ = message.ack().await;
            continue;
        }

        if !seen.insert(envelope.event_id) {
            info!(event_id = %envelope.event_id, "duplicate delivery; already handled");
            let _ = message.ack().await;
            continue;
        }

        match executor.process(&envelope).await {
            Ok(()) => match settle.settle(&envelope, true, None).await {
                Ok(()) => {
                    let _ = message.ack().await;
                }
                Err(error) => {
                    // The actions ran; the dedupe window keeps a redelivery
                    // from running them again while we retry the settlement.
                    error!(%error, event_id = %envelope.event_id, "settlement failed; requesting redelivery");
                    let _ = message.ack_with(AckKind::Nak(None)).await;
                }
            },
            Err(error) => {
                warn!(%error, event_id = %envelope.event_id, "action bundle failed; settling as failure");
                if let Err(settle_error) = settle
                    .settle(&envelope, false, Some(error.to_string()))
                    .await
                {
                    error!(%settle_error, event_id = %envelope.event_id, "failure settlement did not reach the kernel");
                }
                let _ = message.ack().await;
            }
        }
    }

    info!("message stream closed; shutting down");
    Ok(())
}

/// Local development aid: fabricate a fired envelope every few seconds and
/// run it through the executor without a kernel or NATS.
async fn simulate_timer_events(executor: ActionExecutor) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            bus_sequence: 0,
            tenant_id: "demo".into(),
            timer_id: Uuid::new_v4(),
            kind: "timer.fired".into(),
            occurred_at: chrono::Utc::now(),
            state_version: 2,
            drift_ms: Some(3),
            event: serde_json::json!({
                "type": "Fired",
                "data": {
                    "name": "demo-timer",
                    "actionBundle": {
                        "actions": [
                            {
                                "id": "demo-webhook",
                                "kind": "webhook",
                                "parameters": {
                                    "url": "https://webhook.site/your-webhook-url",
                                    "payload": { "message": "Timer fired successfully!" }
                                }
                            }
                        ]
                    }
                }
            }),
            signature: String::new(),
            signature_version: envelope::SIGNATURE_VERSION.into(),
        };
        if let Err(error) = executor.process(&envelope).await {
            warn!(%error, "demo action failed");
        }
    }
}
