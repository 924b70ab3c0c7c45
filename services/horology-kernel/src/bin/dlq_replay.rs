//! Re-publish dead-lettered envelopes to the primary subject so the durable
//! consumers reprocess them. Run it manually after the outage that parked
//! them is resolved.

use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::pull};
use horology_kernel::events::DeadLetterRecord;
use tokio_stream::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let servers = std::env::var("NATS_URL").context("NATS_URL must be set")?;
    let subject = std::env::var("NATS_SUBJECT").unwrap_or_else(|_| "minoots.timer.fired".into());
    let dlq_subject =
        std::env::var("NATS_DLQ_SUBJECT").unwrap_or_else(|_| format!("{subject}.dlq"));
    let stream_name = std::env::var("NATS_STREAM").unwrap_or_else(|_| "MINOOTS_TIMER".into());

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
            durable_name: Some("minoots-dlq-replay".to_string()),
            filter_subject: dlq_subject.clone(),
            ..Default::default()
        })
        .await
        .map_err(|error| anyhow::anyhow!("failed to create DLQ consumer: {error}"))?;

    info!(%dlq_subject, %subject, "replaying dead-lettered envelopes");
    let mut messages = consumer
        .messages()
        .await
        .map_err(|error| anyhow::anyhow!("failed to open DLQ messages: {error}"))?;

    let mut replayed = 0usize;
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), messages.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(error))) => {
                warn!(%error, "failed to pull DLQ message");
                continue;
            }
            Ok(None) => break,
            Err(_) => break, // drained
        };

        let record: DeadLetterRecord = match serde_json::from_slice(&message.payload) {
            Ok(record) => record,
            Err(error) => {
                warn!(%error, "skipping malformed dead-letter record");
                let _ = message.ack().await;
                continue;
            }
        };

        let payload = serde_json::to_vec(&record.envelope)?;
        let ack = js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|error| anyhow::anyhow!("failed to re-publish envelope: {error}"))?;
        ack.await
            .map_err(|error| anyhow::anyhow!("re-publish was not acknowledged: {error}"))?;
        message
            .ack()
            .await
            .map_err(|error| anyhow::anyhow!("failed to ack DLQ message: {error}"))?;

        replayed += 1;
        info!(
            event_id = %record.envelope.event_id,
            original_error = %record.error_description,
            "envelope re-published"
        );
    }

    info!(replayed, "DLQ replay complete");
    Ok(())
}
