use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::envelope::{ActionBundle, EventEnvelope, RetryPolicy, TimerAction};

/// Executes the action bundle attached to a fired timer. Webhooks are the
/// main path; command actions stay disabled unless explicitly opted in and
/// whitelisted.
#[derive(Clone)]
pub struct ActionExecutor {
    client: reqwest::Client,
    allow_commands: bool,
}

impl ActionExecutor {
    pub fn new(allow_commands: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            allow_commands,
        }
    }

    /// Run every action in the bundle, retrying each one per the bundle's
    /// retry policy. Returns an error if any action ultimately failed, which
    /// the caller reports as a failed settlement.
    pub async fn process(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(bundle) = envelope.action_bundle() else {
            info!(timer_id = %envelope.timer_id, "no action bundle; nothing to execute");
            return Ok(());
        };

        info!(
            timer_id = %envelope.timer_id,
            actions = bundle.actions.len(),
            "processing action bundle"
        );

        let mut failures = Vec::new();
        for action in &bundle.actions {
            if let Err(error) = self.execute_with_retries(action, &bundle, envelope).await {
                warn!(
                    action_id = %action.id,
                    timer_id = %envelope.timer_id,
                    %error,
                    "action execution failed"
                );
                failures.push(format!("{}: {error}", action.id));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(failures.join("; ")))
        }
    }

    async fn execute_with_retries(
        &self,
        action: &TimerAction,
        bundle: &ActionBundle,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        let retry = bundle.retry_policy.clone().unwrap_or(RetryPolicy {
            max_attempts: 1,
            backoff_initial_ms: 1_000,
            backoff_multiplier: 2.0,
        });
        let attempts = retry.max_attempts.max(1);
        let mut backoff = Duration::from_millis(retry.backoff_initial_ms.max(1));
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.execute(action, envelope).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        action_id = %action.id,
                        attempt,
                        max_attempts = attempts,
                        %error,
                        "action attempt failed"
                    );
                    last_error = Some(error);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = Duration::from_millis(
                    (backoff.as_millis() as f64 * retry.backoff_multiplier) as u64,
                )
                .min(Duration::from_secs(60));
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    async fn execute(&self, action: &TimerAction, envelope: &EventEnvelope) -> Result<()> {
        match action.kind.as_str() {
            "webhook" => {
                let url = action
                    .parameters
                    .get("url")
                    .and_then(|value| value.as_str())
                    .context("webhook action missing url parameter")?;
                self.execute_webhook(url, action, envelope).await
            }
            "command" => {
                let command = action
                    .parameters
                    .get("command")
                    .and_then(|value| value.as_str())
                    .context("command action missing command parameter")?;
                self.execute_command(command, envelope).await
            }
            other => {
                warn!(kind = %other, timer_id = %envelope.timer_id, "unknown action kind; skipping");
                Ok(())
            }
        }
    }

    async fn execute_webhook(
        &self,
        url: &str,
        action: &TimerAction,
        envelope: &EventEnvelope,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "event": envelope.kind,
            "event_id": envelope.event_id,
            "timer_id": envelope.timer_id,
            "tenant_id": envelope.tenant_id,
            "timer_name": envelope.timer_name(),
            "occurred_at": envelope.occurred_at,
            "state_version": envelope.state_version,
            "payload": action.parameters.get("payload").cloned().unwrap_or_default(),
        });

        info!(%url, timer_id = %envelope.timer_id, "executing webhook");
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "MINOOTS-ActionOrchestrator/1.0")
            .json(&payload)
            .send()
            .await
            .context("failed to send webhook request")?;

        let status = response.status();
        if status.is_success() {
            info!(%url, %status, "webhook succeeded");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("webhook returned {status}: {body}"))
        }
    }

    async fn execute_command(&self, command: &str, envelope: &EventEnvelope) -> Result<()> {
        // Command execution is disabled by default to prevent injection.
        // MINOOTS_ALLOW_COMMANDS=true opts in, and even then only the
        // whitelist below runs.
        if !self.allow_commands {
            warn!(%command, "command execution disabled");
            return Err(anyhow::anyhow!(
                "command execution disabled; set MINOOTS_ALLOW_COMMANDS=true to enable (not recommended in production)"
            ));
        }

        if command_is_dangerous(command) {
            warn!(%command, "command contains forbidden operations");
            return Err(anyhow::anyhow!("command contains forbidden operations"));
        }

        let cmd_parts: Vec<&str> = command.split_whitespace().collect();
        if cmd_parts.is_empty() || !command_whitelisted(cmd_parts[0]) {
            warn!(%command, "command not in whitelist");
            return Err(anyhow::anyhow!("command not in allowed whitelist"));
        }

        let output = tokio::process::Command::new(cmd_parts[0])
            .args(&cmd_parts[1..])
            .env("TIMER_ID", envelope.timer_id.to_string())
            .env("TIMER_NAME", envelope.timer_name())
            .env("TENANT_ID", &envelope.tenant_id)
            .env("OCCURRED_AT", envelope.occurred_at.to_rfc3339())
            .output()
            .await
            .context("failed to execute command")?;

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            info!(%command, output = %stdout.trim(), "command succeeded");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(anyhow::anyhow!("command failed: {}", stderr.trim()))
        }
    }
}

fn command_is_dangerous(command: &str) -> bool {
    ["rm ", "sudo ", "curl ", "wget ", ">/", "&", "|", ";"]
        .iter()
        .any(|needle| command.contains(needle))
}

fn command_whitelisted(program: &str) -> bool {
    ["echo", "date", "sleep"].contains(&program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn fired_envelope(bundle: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            bus_sequence: 1,
            tenant_id: "tenant-a".into(),
            timer_id: Uuid::new_v4(),
            kind: "timer.fired".into(),
            occurred_at: Utc::now(),
            state_version: 2,
            drift_ms: None,
            event: serde_json::json!({
                "type": "Fired",
                "data": { "name": "job", "actionBundle": bundle }
            }),
            signature: String::new(),
            signature_version: crate::envelope::SIGNATURE_VERSION.into(),
        }
    }

    #[tokio::test]
    async fn envelopes_without_bundles_are_a_noop() {
        let executor = ActionExecutor::new(false);
        let mut envelope = fired_envelope(serde_json::json!(null));
        envelope.event = serde_json::json!({ "type": "Fired", "data": { "name": "bare" } });
        executor.process(&envelope).await.expect("nothing to do");
    }

    #[tokio::test]
    async fn commands_are_refused_when_not_opted_in() {
        let executor = ActionExecutor::new(false);
        let envelope = fired_envelope(serde_json::json!({
            "actions": [
                { "id": "cmd", "kind": "command", "parameters": { "command": "echo hi" } }
            ],
            "retryPolicy": { "maxAttempts": 1, "backoffInitialMs": 1, "backoffMultiplier": 1.0 }
        }));
        let err = executor.process(&envelope).await.expect_err("disabled");
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn dangerous_and_unlisted_commands_are_refused() {
        let executor = ActionExecutor::new(true);
        for command in ["rm -rf /tmp/x", "python evil.py", "echo hi; rm x"] {
            let envelope = fired_envelope(serde_json::json!({
                "actions": [
                    { "id": "cmd", "kind": "command", "parameters": { "command": command } }
                ],
                "retryPolicy": { "maxAttempts": 1, "backoffInitialMs": 1, "backoffMultiplier": 1.0 }
            }));
            executor
                .process(&envelope)
                .await
                .expect_err("refused command");
        }
    }

    #[tokio::test]
    async fn whitelisted_commands_run_with_timer_context() {
        let executor = ActionExecutor::new(true);
        let envelope = fired_envelope(serde_json::json!({
            "actions": [
                { "id": "cmd", "kind": "command", "parameters": { "command": "echo fired" } }
            ],
            "retryPolicy": { "maxAttempts": 1, "backoffInitialMs": 1, "backoffMultiplier": 1.0 }
        }));
        executor.process(&envelope).await.expect("echo runs");
    }

    #[tokio::test]
    async fn webhook_actions_require_a_url() {
        let executor = ActionExecutor::new(false);
        let envelope = fired_envelope(serde_json::json!({
            "actions": [
                { "id": "hook", "kind": "webhook", "parameters": {} }
            ],
            "retryPolicy": { "maxAttempts": 1, "backoffInitialMs": 1, "backoffMultiplier": 1.0 }
        }));
        let err = executor.process(&envelope).await.expect_err("missing url");
        assert!(err.to_string().contains("url"));
    }

    #[tokio::test]
    async fn unknown_action_kinds_are_skipped_not_fatal() {
        let executor = ActionExecutor::new(false);
        let envelope = fired_envelope(serde_json::json!({
            "actions": [
                { "id": "future", "kind": "quantum_entangle", "parameters": {} }
            ]
        }));
        executor.process(&envelope).await.expect("skipped");
    }
}
