use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{
    self,
    context::{GetStreamError, PublishError as JetStreamAckError},
};
use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

use crate::events::{DeadLetterRecord, EventEnvelope};
use crate::telemetry::scheduling as scheduling_metrics;

#[derive(Clone, Debug)]
pub struct JetStreamForwarderConfig {
    pub servers: String,
    pub subject: String,
    pub dlq_subject: String,
    pub stream: Option<String>,
    /// Publish attempts per envelope before dead-lettering.
    pub max_deliver: u32,
    pub retry_backoff: Duration,
}

impl JetStreamForwarderConfig {
    pub fn new(servers: String, subject: String, dlq_subject: String) -> Self {
        Self {
            servers,
            subject,
            dlq_subject,
            stream: None,
            max_deliver: 5,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

pub async fn spawn_forwarder(
    config: JetStreamForwarderConfig,
    receiver: broadcast::Receiver<EventEnvelope>,
) -> Result<JoinHandle<()>> {
    let connection = async_nats::connect(&config.servers)
        .await
        .with_context(|| format!("failed to connect to NATS at {}", config.servers))?;
    let jetstream = jetstream::new(connection.clone());
    let client = RealJetStreamClient::new(connection, jetstream);
    Ok(spawn_forwarder_with_client(config, receiver, client))
}

fn spawn_forwarder_with_client<C>(
    config: JetStreamForwarderConfig,
    receiver: broadcast::Receiver<EventEnvelope>,
    client: C,
) -> JoinHandle<()>
where
    C: JetStreamClient + Send + Sync + 'static,
{
    tokio::spawn(async move {
        if let Some(stream_name) = config.stream.as_deref() {
            match client.ensure_stream(stream_name).await {
                Ok(_) => info!(
                    stream = %stream_name,
                    subject = %config.subject,
                    "JetStream forwarder connected"
                ),
                Err(error) => warn!(
                    ?error,
                    stream = %stream_name,
                    subject = %config.subject,
                    "Failed to fetch JetStream stream info"
                ),
            }
        } else {
            info!(subject = %config.subject, "JetStream forwarder connected (stream not specified)");
        }

        let mut receiver = receiver;
        loop {
            match receiver.recv().await {
                Ok(envelope) => {
                    forward_envelope(&config, &client, envelope).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(subject = %config.subject, "JetStream forwarder exiting; channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, subject = %config.subject, "JetStream forwarder lagged; skipping envelopes");
                }
            }
        }
    })
}

/// Publish with bounded retries, then dead-letter. An envelope is never
/// dropped: either the primary subject accepts it or the DLQ records it with
/// the last error attached.
async fn forward_envelope<C>(config: &JetStreamForwarderConfig, client: &C, envelope: EventEnvelope)
where
    C: JetStreamClient,
{
    let payload = match encode_envelope(&envelope) {
        Ok(payload) => payload,
        Err(error) => {
            error!(?error, subject = %config.subject, "Failed to encode timer envelope");
            return;
        }
    };

    let mut last_error = String::new();
    let mut backoff = config.retry_backoff;
    for attempt in 1..=config.max_deliver.max(1) {
        match client.publish(&config.subject, payload.clone()).await {
            Ok(()) => return,
            Err(error) => {
                scheduling_metrics::record_publish_failure(&config.subject);
                last_error = error.to_string();
                warn!(
                    %error,
                    attempt,
                    max_deliver = config.max_deliver,
                    subject = %config.subject,
                    "JetStream publish failed"
                );
            }
        }
        if attempt < config.max_deliver {
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    let record = DeadLetterRecord {
        occurred_at: Utc::now(),
        error_description: last_error,
        envelope,
    };
    let dlq_payload = match serde_json::to_vec(&record) {
        Ok(payload) => payload,
        Err(error) => {
            error!(?error, "Failed to encode dead-letter record");
            return;
        }
    };
    match client.publish(&config.dlq_subject, dlq_payload).await {
        Ok(()) => {
            scheduling_metrics::record_dead_letter(&config.dlq_subject);
            warn!(
                subject = %config.dlq_subject,
                event_id = %record.envelope.event_id,
                "envelope dead-lettered after exhausting delivery budget"
            );
        }
        Err(error) => {
            error!(
                %error,
                subject = %config.dlq_subject,
                event_id = %record.envelope.event_id,
                "failed to dead-letter envelope; it will be retried from the retention ring"
            );
        }
    }
}

#[async_trait]
trait JetStreamClient {
    async fn ensure_stream(&self, stream: &str) -> Result<(), EnsureStreamError>;
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Clone)]
struct RealJetStreamClient {
    #[allow(dead_code)]
    connection: async_nats::Client,
    context: jetstream::Context,
}

impl RealJetStreamClient {
    fn new(connection: async_nats::Client, context: jetstream::Context) -> Self {
        Self {
            connection,
            context,
        }
    }
}

#[async_trait]
impl JetStreamClient for RealJetStreamClient {
    async fn ensure_stream(&self, stream: &str) -> Result<(), EnsureStreamError> {
        self.context.get_stream(stream).await?;
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let ack = self
            .context
            .publish(subject.to_string(), payload.into())
            .await?;
        ack.await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum EnsureStreamError {
    #[error("failed to fetch stream info")]
    Fetch(#[from] GetStreamError),
}

#[derive(Debug, thiserror::Error)]
enum PublishError {
    #[error("publish request failed")]
    Request(#[from] async_nats::Error),
    #[error("publish ack failed")]
    Ack(#[from] JetStreamAckError),
}

fn encode_envelope(envelope: &EventEnvelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope)
        .map_err(|error| anyhow!("failed to serialize event envelope: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TimerEvent;
    use crate::signing::EventSigner;
    use crate::test_support::sample_timer;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::sync::{Mutex, Notify};
    use tokio::time::timeout;

    fn config() -> JetStreamForwarderConfig {
        JetStreamForwarderConfig {
            servers: "unused".into(),
            subject: "minoots.timer.events".into(),
            dlq_subject: "minoots.timer.dlq".into(),
            stream: Some("MINOOTS_TIMER".into()),
            max_deliver: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn envelope(tenant: &str) -> EventEnvelope {
        EventSigner::insecure_dev().sign_event(TimerEvent::Scheduled(sample_timer(tenant)), 1, None)
    }

    #[tokio::test]
    async fn encode_envelope_produces_canonical_json() {
        let envelope = envelope("tenant-a");
        let bytes = encode_envelope(&envelope).expect("serialize envelope");
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).expect("valid json");
        assert_eq!(decoded["tenant_id"], "tenant-a");
        assert_eq!(decoded["signature_version"], "v1-hmac-sha256");
        assert_eq!(decoded["kind"], "timer.scheduled");
        assert_eq!(
            decoded["event"]["type"],
            serde_json::Value::String("Scheduled".into())
        );
    }

    #[tokio::test]
    async fn forwarder_publishes_envelopes_via_client() {
        let client = RecordingClient::new(0);
        let (sender, receiver) = broadcast::channel(16);
        let config = config();
        let handle = spawn_forwarder_with_client(config.clone(), receiver, client.clone());

        let envelope = envelope("tenant-a");
        sender.send(envelope.clone()).expect("forward envelope");

        timeout(Duration::from_secs(1), client.wait_for_publish())
            .await
            .expect("forwarder to publish");
        let published = client.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, config.subject);
        let decoded: EventEnvelope =
            serde_json::from_slice(&published[0].1).expect("valid envelope payload");
        assert_eq!(decoded.event_id, envelope.event_id);

        let ensured = client.ensured_streams().await;
        assert_eq!(ensured, vec!["MINOOTS_TIMER".to_string()]);

        drop(sender);
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("forwarder to exit")
            .expect("forwarder task panicked");
    }

    #[tokio::test]
    async fn transient_failures_are_retried_before_success() {
        // Fail the first two attempts; the third succeeds within max_deliver.
        let client = RecordingClient::new(2);
        let (sender, receiver) = broadcast::channel(16);
        let handle = spawn_forwarder_with_client(config(), receiver, client.clone());

        sender.send(envelope("tenant-a")).expect("forward envelope");
        timeout(Duration::from_secs(1), client.wait_for_publish())
            .await
            .expect("retried publish lands");
        let published = client.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "minoots.timer.events");

        drop(sender);
        let _ = timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn exhausted_envelopes_are_dead_lettered_with_the_error() {
        // Primary always fails; the DLQ publish succeeds.
        let client = RecordingClient::new(u32::MAX);
        let (sender, receiver) = broadcast::channel(16);
        let handle = spawn_forwarder_with_client(config(), receiver, client.clone());

        let original = envelope("tenant-a");
        sender.send(original.clone()).expect("forward envelope");
        timeout(Duration::from_secs(1), client.wait_for_publish())
            .await
            .expect("dead-letter publish lands");

        let published = client.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "minoots.timer.dlq");
        let record: DeadLetterRecord =
            serde_json::from_slice(&published[0].1).expect("valid dead-letter record");
        assert_eq!(record.envelope.event_id, original.event_id);
        assert!(record.error_description.contains("publish request failed"));

        drop(sender);
        let _ = timeout(Duration::from_secs(1), handle).await;
    }

    /// Test double: fails the first `failures` primary publishes, always
    /// accepts DLQ publishes, and records everything that lands.
    #[derive(Clone)]
    struct RecordingClient {
        published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
        ensured: Arc<Mutex<Vec<String>>>,
        notify: Arc<Notify>,
        failures_remaining: Arc<AtomicU32>,
    }

    impl RecordingClient {
        fn new(failures: u32) -> Self {
            Self {
                published: Arc::new(Mutex::new(Vec::new())),
                ensured: Arc::new(Mutex::new(Vec::new())),
                notify: Arc::new(Notify::new()),
                failures_remaining: Arc::new(AtomicU32::new(failures)),
            }
        }

        async fn wait_for_publish(&self) {
            self.notify.notified().await;
        }

        async fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().await.clone()
        }

        async fn ensured_streams(&self) -> Vec<String> {
            self.ensured.lock().await.clone()
        }
    }

    #[async_trait]
    impl JetStreamClient for RecordingClient {
        async fn ensure_stream(&self, stream: &str) -> Result<(), EnsureStreamError> {
            self.ensured.lock().await.push(stream.to_string());
            Ok(())
        }

        async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if !subject.ends_with(".dlq") {
                let remaining = self.failures_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    if remaining != u32::MAX {
                        self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                    }
                    return Err(PublishError::Request("simulated outage".into()));
                }
            }
            self.published
                .lock()
                .await
                .push((subject.to_string(), payload));
            self.notify.notify_one();
            Ok(())
        }
    }
}
