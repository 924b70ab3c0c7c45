use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tonic::{metadata::MetadataMap, Request, Response, Status};
use tracing::debug;
use uuid::Uuid;

use crate::admission::parse_duration_ms;
use crate::command::SettleOutcome;
use crate::events::EventEnvelope;
use crate::pb::horology_kernel_server::{HorologyKernel as HorologyKernelApi, HorologyKernelServer};
use crate::pb::{
    self, TimerCancelRequest, TimerEventStreamRequest, TimerGetRequest, TimerListRequest,
    TimerScheduleRequest, TimerSettleRequest,
};
use crate::policy::Principal;
use crate::{HorologyKernel, KernelError, TimerInstance, TimerSpec, TimerStatus};

pub type TimerEventStream =
    Pin<Box<dyn Stream<Item = Result<pb::TimerEvent, Status>> + Send + 'static>>;

#[derive(Clone)]
pub struct HorologyKernelService {
    kernel: HorologyKernel,
}

struct RequestContext {
    principal: Principal,
    #[allow(dead_code)]
    trace_id: Option<String>,
}

impl HorologyKernelService {
    pub fn new(kernel: HorologyKernel) -> Self {
        Self { kernel }
    }

    pub fn into_server(self) -> HorologyKernelServer<Self> {
        HorologyKernelServer::new(self)
    }

    fn authenticate(&self, metadata: &MetadataMap) -> Result<RequestContext, Status> {
        let tenant_id = require_ascii_metadata(metadata, "x-tenant-id")?;
        let api_key = require_ascii_metadata(metadata, "x-api-key")?;
        let trace_id = metadata
            .get("x-trace-id")
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_string());

        let principal = self
            .kernel
            .authenticate(&tenant_id, &api_key)
            .map_err(map_kernel_error)?;
        Ok(RequestContext {
            principal,
            trace_id,
        })
    }
}

#[tonic::async_trait]
impl HorologyKernelApi for HorologyKernelService {
    async fn schedule_timer(
        &self,
        request: Request<TimerScheduleRequest>,
    ) -> Result<Response<pb::TimerScheduleResponse>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let spec = convert_schedule_request(payload)?;

        let deadline = self.kernel.config().mutation_deadline;
        let timer = tokio::time::timeout(deadline, self.kernel.schedule(&context.principal, spec))
            .await
            .map_err(|_| map_kernel_error(KernelError::Timeout))?
            .map_err(map_kernel_error)?;

        Ok(Response::new(pb::TimerScheduleResponse {
            timer: Some(to_proto_timer(timer)),
        }))
    }

    async fn cancel_timer(
        &self,
        request: Request<TimerCancelRequest>,
    ) -> Result<Response<pb::Timer>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let timer_id = parse_timer_id(&payload.timer_id)?;

        let deadline = self.kernel.config().mutation_deadline;
        let timer = tokio::time::timeout(
            deadline,
            self.kernel
                .cancel(&context.principal, timer_id, optional_string(payload.reason)),
        )
        .await
        .map_err(|_| map_kernel_error(KernelError::Timeout))?
        .map_err(map_kernel_error)?;

        Ok(Response::new(to_proto_timer(timer)))
    }

    async fn get_timer(
        &self,
        request: Request<TimerGetRequest>,
    ) -> Result<Response<pb::Timer>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let timer_id = parse_timer_id(&payload.timer_id)?;
        let timer = self
            .kernel
            .get(&context.principal, timer_id)
            .await
            .map_err(map_kernel_error)?;
        Ok(Response::new(to_proto_timer(timer)))
    }

    async fn list_timers(
        &self,
        request: Request<TimerListRequest>,
    ) -> Result<Response<pb::TimerListResponse>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;

        let statuses: HashSet<TimerStatus> = payload
            .statuses
            .iter()
            .filter_map(|status| parse_status_filter(status))
            .collect();

        let timers = self
            .kernel
            .list(&context.principal)
            .await
            .map_err(map_kernel_error)?;
        let filtered: Vec<_> = if statuses.is_empty() {
            timers
        } else {
            timers
                .into_iter()
                .filter(|timer| statuses.contains(&timer.status))
                .collect()
        };

        Ok(Response::new(pb::TimerListResponse {
            timers: filtered.into_iter().map(to_proto_timer).collect(),
            next_page_token: String::new(),
        }))
    }

    async fn settle_timer(
        &self,
        request: Request<TimerSettleRequest>,
    ) -> Result<Response<pb::Timer>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let timer_id = parse_timer_id(&payload.timer_id)?;

        let outcome = if payload.success {
            SettleOutcome::Success
        } else {
            SettleOutcome::Failure {
                reason: if payload.failure_reason.is_empty() {
                    "unspecified downstream failure".to_string()
                } else {
                    payload.failure_reason
                },
            }
        };

        let deadline = self.kernel.config().mutation_deadline;
        let timer = tokio::time::timeout(
            deadline,
            self.kernel.settle(&context.principal, timer_id, outcome),
        )
        .await
        .map_err(|_| map_kernel_error(KernelError::Timeout))?
        .map_err(map_kernel_error)?;

        Ok(Response::new(to_proto_timer(timer)))
    }

    type StreamTimerEventsStream = TimerEventStream;

    async fn stream_timer_events(
        &self,
        request: Request<TimerEventStreamRequest>,
    ) -> Result<Response<Self::StreamTimerEventsStream>, Status> {
        let context = self.authenticate(request.metadata())?;
        let mut payload = request.into_inner();
        payload.tenant_id = enforce_tenant_scope(&payload.tenant_id, &context)?;
        let tenant_id = payload.tenant_id.clone();
        let topics: Arc<HashSet<String>> = Arc::new(payload.topics.into_iter().collect());

        // Subscribe before snapshotting the retention ring so nothing falls
        // between replay and live delivery; the overlap can duplicate, and
        // consumers dedupe on event_id across the seam.
        let receiver = self.kernel.subscribe();
        let replayed: Vec<Result<pb::TimerEvent, Status>> = self
            .kernel
            .replay_events_after(&tenant_id, payload.after_bus_sequence)
            .into_iter()
            .filter(|envelope| topic_matches(&topics, &envelope.kind))
            .map(|envelope| Ok(envelope_to_proto(envelope)))
            .collect();
        let live = BroadcastStream::new(receiver).filter_map({
            let topics = Arc::clone(&topics);
            let tenant_id = tenant_id.clone();
            move |item| match item {
                Ok(envelope)
                    if envelope.tenant_id == tenant_id
                        && topic_matches(&topics, &envelope.kind) =>
                {
                    Some(Ok(envelope_to_proto(envelope)))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "event stream subscriber lagged");
                    None
                }
            }
        });

        let stream = tokio_stream::iter(replayed).chain(live);
        Ok(Response::new(Box::pin(stream)))
    }
}

fn topic_matches(topics: &HashSet<String>, kind: &str) -> bool {
    topics.is_empty() || topics.contains(kind)
}

fn require_ascii_metadata(metadata: &MetadataMap, key: &str) -> Result<String, Status> {
    metadata
        .get(key)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .ok_or_else(|| Status::unauthenticated(format!("{key} metadata is required")))
}

fn enforce_tenant_scope(requested: &str, context: &RequestContext) -> Result<String, Status> {
    if requested.is_empty() || requested == context.principal.tenant_id {
        Ok(context.principal.tenant_id.clone())
    } else {
        Err(Status::permission_denied(
            "tenant mismatch for kernel request",
        ))
    }
}

fn parse_timer_id(value: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(value).map_err(|_| Status::invalid_argument("timer_id must be a valid UUID"))
}

fn optional_string(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_status_filter(raw: &str) -> Option<TimerStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "scheduled" | "timer_status_scheduled" => Some(TimerStatus::Scheduled),
        "armed" | "timer_status_armed" => Some(TimerStatus::Armed),
        "fired" | "timer_status_fired" => Some(TimerStatus::Fired),
        "cancelled" | "canceled" | "timer_status_cancelled" => Some(TimerStatus::Cancelled),
        "failed" | "timer_status_failed" => Some(TimerStatus::Failed),
        _ => None,
    }
}

fn convert_schedule_request(request: TimerScheduleRequest) -> Result<TimerSpec, Status> {
    if request.requested_by.is_empty() {
        return Err(Status::invalid_argument("requested_by is required"));
    }

    let (duration_ms, fire_at) = match request.schedule_time {
        Some(pb::timer_schedule_request::ScheduleTime::DurationMs(duration)) => {
            if duration == 0 {
                return Err(Status::invalid_argument(
                    "duration_ms must be greater than zero",
                ));
            }
            (duration, None)
        }
        Some(pb::timer_schedule_request::ScheduleTime::FireTimeIso(iso)) => {
            let fire_at = parse_iso_datetime(&iso)?;
            (0, Some(fire_at))
        }
        Some(pb::timer_schedule_request::ScheduleTime::Duration(human)) => {
            let duration = parse_duration_ms(&human).map_err(map_kernel_error)?;
            if duration == 0 {
                return Err(Status::invalid_argument(
                    "duration must be greater than zero",
                ));
            }
            (duration, None)
        }
        None => {
            return Err(Status::invalid_argument(
                "either duration_ms, duration or fire_time_iso must be provided",
            ))
        }
    };

    Ok(TimerSpec {
        tenant_id: request.tenant_id,
        requested_by: request.requested_by,
        name: optional_string(request.name),
        duration_ms,
        fire_at,
        metadata: parse_optional_json_string(request.metadata_json, "metadata_json")?,
        labels: request.labels,
        action_bundle: parse_optional_json_typed(request.action_bundle_json, "action_bundle_json")?,
        agent_binding: parse_optional_json_typed(request.agent_binding_json, "agent_binding_json")?,
        jitter_policy: parse_optional_json_typed(request.jitter_policy_json, "jitter_policy_json")?,
        temporal_graph: parse_optional_json_typed(
            request.temporal_graph_json,
            "temporal_graph_json",
        )?,
        client_timer_id: optional_string(request.client_timer_id),
        graph_root_id: None,
        graph_node_id: None,
    })
}

fn parse_iso_datetime(value: &str) -> Result<chrono::DateTime<chrono::Utc>, Status> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|_| Status::invalid_argument("fire_time_iso must be RFC3339"))
}

fn parse_optional_json_string(
    value: String,
    field: &str,
) -> Result<Option<serde_json::Value>, Status> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|error| Status::invalid_argument(format!("invalid {field}: {error}")))
}

fn parse_optional_json_typed<T: serde::de::DeserializeOwned>(
    value: String,
    field: &str,
) -> Result<Option<T>, Status> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|error| Status::invalid_argument(format!("invalid {field}: {error}")))
}

fn format_datetime(value: chrono::DateTime<chrono::Utc>) -> String {
    value.to_rfc3339()
}

fn serialize_json<T: serde::Serialize>(value: Option<&T>) -> String {
    value
        .and_then(|inner| serde_json::to_string(inner).ok())
        .unwrap_or_default()
}

pub fn to_proto_timer(timer: TimerInstance) -> pb::Timer {
    pb::Timer {
        id: timer.id.to_string(),
        tenant_id: timer.tenant_id,
        name: timer.name,
        requested_by: timer.requested_by,
        status: status_to_proto(&timer.status) as i32,
        created_at_iso: format_datetime(timer.created_at),
        fire_at_iso: format_datetime(timer.fire_at),
        fired_at_iso: timer.fired_at.map(format_datetime).unwrap_or_default(),
        cancelled_at_iso: timer.cancelled_at.map(format_datetime).unwrap_or_default(),
        settled_at_iso: timer.settled_at.map(format_datetime).unwrap_or_default(),
        cancel_reason: timer.cancel_reason.unwrap_or_default(),
        cancelled_by: timer.cancelled_by.unwrap_or_default(),
        failure_reason: timer.failure_reason.unwrap_or_default(),
        duration_ms: timer.duration_ms,
        metadata_json: serialize_json(timer.metadata.as_ref()),
        action_bundle_json: serialize_json(timer.action_bundle.as_ref()),
        agent_binding_json: serialize_json(timer.agent_binding.as_ref()),
        jitter_policy_json: serialize_json(timer.jitter_policy.as_ref()),
        temporal_graph_json: serialize_json(timer.temporal_graph.as_ref()),
        labels: timer.labels,
        state_version: timer.state_version,
        client_timer_id: timer.client_timer_id.unwrap_or_default(),
        graph_root_id: timer
            .graph_root_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
        graph_node_id: timer.graph_node_id.unwrap_or_default(),
    }
}

fn status_to_proto(status: &TimerStatus) -> pb::TimerStatus {
    match status {
        TimerStatus::Scheduled => pb::TimerStatus::Scheduled,
        TimerStatus::Armed => pb::TimerStatus::Armed,
        TimerStatus::Fired => pb::TimerStatus::Fired,
        TimerStatus::Cancelled => pb::TimerStatus::Cancelled,
        TimerStatus::Failed => pb::TimerStatus::Failed,
    }
}

pub fn envelope_to_proto(envelope: EventEnvelope) -> pb::TimerEvent {
    pb::TimerEvent {
        event_id: envelope.event_id.to_string(),
        bus_sequence: envelope.bus_sequence,
        tenant_id: envelope.tenant_id,
        timer_id: envelope.timer_id.to_string(),
        kind: envelope.kind,
        occurred_at_iso: format_datetime(envelope.occurred_at),
        state_version: envelope.state_version,
        drift_ms: envelope.drift_ms.unwrap_or(0),
        timer: Some(to_proto_timer(envelope.event.timer().clone())),
        signature: envelope.signature,
        signature_version: envelope.signature_version,
    }
}

/// RPC error taxonomy: the KernelError kinds map one-to-one onto tonic codes.
fn map_kernel_error(error: KernelError) -> Status {
    match error {
        KernelError::Validation(message) => Status::invalid_argument(message),
        KernelError::Unauthenticated => {
            Status::unauthenticated("api key could not be authenticated")
        }
        KernelError::PermissionDenied(message) => Status::permission_denied(message),
        KernelError::QuotaExceeded(message) => Status::resource_exhausted(message),
        KernelError::Conflict => {
            Status::already_exists("timer id already exists with a different payload")
        }
        KernelError::NotFound => Status::not_found("timer not found"),
        KernelError::AlreadySettled => Status::failed_precondition("timer already settled"),
        KernelError::Unavailable(message) => Status::unavailable(message),
        KernelError::Timeout => Status::deadline_exceeded("request deadline exceeded"),
        KernelError::Persistence(error) => Status::internal(format!("persistence error: {error}")),
        KernelError::Internal(error) => Status::internal(format!("internal error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn status_filters_accept_both_spellings() {
        assert_eq!(parse_status_filter("fired"), Some(TimerStatus::Fired));
        assert_eq!(
            parse_status_filter("TIMER_STATUS_SCHEDULED"),
            Some(TimerStatus::Scheduled)
        );
        assert_eq!(parse_status_filter("canceled"), Some(TimerStatus::Cancelled));
        assert_eq!(parse_status_filter("bogus"), None);
    }

    #[test]
    fn missing_metadata_is_unauthenticated() {
        let metadata = MetadataMap::new();
        let err = require_ascii_metadata(&metadata, "x-api-key").expect_err("missing key");
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn tenant_scope_defaults_to_principal_and_rejects_mismatch() {
        let context = RequestContext {
            principal: Principal {
                tenant_id: "tenant-123".into(),
                principal_id: "principal".into(),
                key_id: "key".into(),
                roles: vec![],
                permissions: Default::default(),
            },
            trace_id: None,
        };

        assert_eq!(enforce_tenant_scope("", &context).unwrap(), "tenant-123");
        assert_eq!(
            enforce_tenant_scope("tenant-123", &context).unwrap(),
            "tenant-123"
        );
        assert!(enforce_tenant_scope("tenant-other", &context).is_err());
    }

    #[test]
    fn schedule_request_conversion_normalises_durations() {
        let request = TimerScheduleRequest {
            tenant_id: "tenant-a".into(),
            requested_by: "agent-1".into(),
            name: "demo".into(),
            schedule_time: Some(pb::timer_schedule_request::ScheduleTime::Duration(
                "2s".into(),
            )),
            metadata_json: r#"{"priority":"high"}"#.into(),
            ..Default::default()
        };
        let spec = convert_schedule_request(request).expect("converts");
        assert_eq!(spec.duration_ms, 2_000);
        assert!(spec.fire_at.is_none());
        assert_eq!(
            spec.metadata.expect("metadata")["priority"],
            serde_json::json!("high")
        );
    }

    #[test]
    fn schedule_request_without_a_deadline_is_invalid() {
        let request = TimerScheduleRequest {
            tenant_id: "tenant-a".into(),
            requested_by: "agent-1".into(),
            ..Default::default()
        };
        let err = convert_schedule_request(request).expect_err("missing schedule_time");
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn kernel_errors_map_to_the_published_taxonomy() {
        assert_eq!(
            map_kernel_error(KernelError::QuotaExceeded("daily".into())).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            map_kernel_error(KernelError::AlreadySettled).code(),
            tonic::Code::FailedPrecondition
        );
        assert_eq!(
            map_kernel_error(KernelError::Conflict).code(),
            tonic::Code::AlreadyExists
        );
        assert_eq!(
            map_kernel_error(KernelError::Unavailable("no leader".into())).code(),
            tonic::Code::Unavailable
        );
        assert_eq!(
            map_kernel_error(KernelError::Unauthenticated).code(),
            tonic::Code::Unauthenticated
        );
    }

    #[test]
    fn proto_timer_carries_json_payloads() {
        let mut timer = crate::test_support::sample_timer("tenant-a");
        timer.metadata = Some(serde_json::json!({"k": "v"}));
        let proto = to_proto_timer(timer);
        assert_eq!(proto.metadata_json, r#"{"k":"v"}"#);
        assert_eq!(proto.status, pb::TimerStatus::Scheduled as i32);
        assert_eq!(proto.state_version, 1);
    }
}
