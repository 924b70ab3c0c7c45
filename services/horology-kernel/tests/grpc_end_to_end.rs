use std::time::Duration;

use anyhow::Result;
use horology_kernel::grpc::HorologyKernelService;
use horology_kernel::{pb, HorologyKernel, SchedulerConfig};
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::metadata::MetadataValue;
use tonic::transport::Server;
use tonic::{Code, Request};

type KernelClient =
    pb::horology_kernel_client::HorologyKernelClient<tonic::transport::Channel>;

async fn start_server() -> Result<(KernelClient, oneshot::Sender<()>)> {
    let kernel = HorologyKernel::new(SchedulerConfig::default());
    let service = HorologyKernelService::new(kernel);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let incoming = TcpListenerStream::new(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        Server::builder()
            .add_service(service.into_server())
            .serve_with_incoming_shutdown(incoming, async {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("grpc server runs");
    });

    let client = KernelClient::connect(format!("http://{addr}")).await?;
    Ok((client, shutdown_tx))
}

fn authed<T>(message: T, tenant: &str) -> Request<T> {
    let mut request = Request::new(message);
    request.metadata_mut().insert(
        "x-tenant-id",
        MetadataValue::try_from(tenant).expect("tenant metadata"),
    );
    request
        .metadata_mut()
        .insert("x-api-key", MetadataValue::from_static("test-key"));
    request
}

fn schedule_request(tenant: &str, duration: &str, name: &str) -> pb::TimerScheduleRequest {
    pb::TimerScheduleRequest {
        tenant_id: tenant.into(),
        requested_by: "agent-1".into(),
        name: name.into(),
        schedule_time: Some(pb::timer_schedule_request::ScheduleTime::Duration(
            duration.into(),
        )),
        metadata_json: r#"{"topic":"demo","priority":"high"}"#.into(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_timer_lifecycle_round_trip() -> Result<()> {
    let (mut client, shutdown) = start_server().await?;

    let mut stream_client = client.clone();
    let mut stream = stream_client
        .stream_timer_events(authed(
            pb::TimerEventStreamRequest {
                tenant_id: "tenant-a".into(),
                topics: vec![],
                after_bus_sequence: 0,
            },
            "tenant-a",
        ))
        .await?
        .into_inner();

    let response = client
        .schedule_timer(authed(
            schedule_request("tenant-a", "300ms", "round-trip"),
            "tenant-a",
        ))
        .await?
        .into_inner();
    let timer = response.timer.expect("timer in response");
    assert_eq!(timer.tenant_id, "tenant-a");
    assert_eq!(timer.name, "round-trip");
    assert_eq!(timer.duration_ms, 300);
    assert_eq!(timer.status, pb::TimerStatus::Scheduled as i32);
    assert_eq!(timer.state_version, 1);
    assert_eq!(timer.metadata_json, r#"{"priority":"high","topic":"demo"}"#);

    // The stream sees the lifecycle in order for this timer, with signed
    // envelopes.
    let mut kinds = Vec::new();
    while kinds.iter().filter(|kind| *kind == "timer.fired").count() == 0 {
        let event = tokio::time::timeout(Duration::from_secs(2), stream.message())
            .await
            .expect("stream event before timeout")?
            .expect("stream open");
        assert_eq!(event.tenant_id, "tenant-a");
        assert_eq!(event.timer_id, timer.id);
        assert_eq!(event.signature_version, "v1-hmac-sha256");
        assert!(!event.signature.is_empty());
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first().map(String::as_str), Some("timer.scheduled"));
    assert!(kinds.contains(&"timer.fired".to_string()));

    let fetched = client
        .get_timer(authed(
            pb::TimerGetRequest {
                tenant_id: "tenant-a".into(),
                timer_id: timer.id.clone(),
            },
            "tenant-a",
        ))
        .await?
        .into_inner();
    assert_eq!(fetched.status, pb::TimerStatus::Fired as i32);
    assert!(!fetched.fired_at_iso.is_empty());

    // Acknowledge the fired timer the way the orchestrator would.
    let settled = client
        .settle_timer(authed(
            pb::TimerSettleRequest {
                tenant_id: "tenant-a".into(),
                timer_id: timer.id.clone(),
                success: true,
                failure_reason: String::new(),
            },
            "tenant-a",
        ))
        .await?
        .into_inner();
    assert!(!settled.settled_at_iso.is_empty());

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_cancel_flow_and_terminal_refusal() -> Result<()> {
    let (mut client, shutdown) = start_server().await?;

    let response = client
        .schedule_timer(authed(
            schedule_request("tenant-a", "30s", "to-cancel"),
            "tenant-a",
        ))
        .await?
        .into_inner();
    let timer = response.timer.expect("timer in response");

    let cancelled = client
        .cancel_timer(authed(
            pb::TimerCancelRequest {
                tenant_id: "tenant-a".into(),
                timer_id: timer.id.clone(),
                requested_by: "agent-1".into(),
                reason: "user".into(),
            },
            "tenant-a",
        ))
        .await?
        .into_inner();
    assert_eq!(cancelled.status, pb::TimerStatus::Cancelled as i32);
    assert_eq!(cancelled.cancel_reason, "user");

    // Cancelling a settled timer reports FAILED_PRECONDITION, never success.
    let err = client
        .cancel_timer(authed(
            pb::TimerCancelRequest {
                tenant_id: "tenant-a".into(),
                timer_id: timer.id.clone(),
                requested_by: "agent-1".into(),
                reason: "again".into(),
            },
            "tenant-a",
        ))
        .await
        .expect_err("second cancel fails");
    assert_eq!(err.code(), Code::FailedPrecondition);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_requires_credentials_and_scopes_tenants() -> Result<()> {
    let (mut client, shutdown) = start_server().await?;

    // No metadata at all: unauthenticated.
    let err = client
        .list_timers(Request::new(pb::TimerListRequest {
            tenant_id: "tenant-a".into(),
            statuses: vec![],
        }))
        .await
        .expect_err("missing credentials");
    assert_eq!(err.code(), Code::Unauthenticated);

    // Authenticated as tenant-a but asking for tenant-b: denied.
    let err = client
        .list_timers(authed(
            pb::TimerListRequest {
                tenant_id: "tenant-b".into(),
                statuses: vec![],
            },
            "tenant-a",
        ))
        .await
        .expect_err("cross-tenant request");
    assert_eq!(err.code(), Code::PermissionDenied);

    // Tenant isolation: tenant-b never sees tenant-a's timers.
    client
        .schedule_timer(authed(
            schedule_request("tenant-a", "60s", "invisible"),
            "tenant-a",
        ))
        .await?;
    let listed = client
        .list_timers(authed(
            pb::TimerListRequest {
                tenant_id: String::new(),
                statuses: vec![],
            },
            "tenant-b",
        ))
        .await?
        .into_inner();
    assert!(listed.timers.is_empty());

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grpc_stream_resumes_from_a_bus_cursor() -> Result<()> {
    let (mut client, shutdown) = start_server().await?;

    let response = client
        .schedule_timer(authed(
            schedule_request("tenant-a", "100ms", "resume-me"),
            "tenant-a",
        ))
        .await?
        .into_inner();
    let timer = response.timer.expect("timer in response");

    // Let the timer fire before anyone subscribes.
    tokio::time::sleep(Duration::from_millis(400)).await;

    // A late subscriber with cursor zero replays the retained history.
    let mut stream = client
        .stream_timer_events(authed(
            pb::TimerEventStreamRequest {
                tenant_id: "tenant-a".into(),
                topics: vec!["timer.fired".into()],
                after_bus_sequence: 0,
            },
            "tenant-a",
        ))
        .await?
        .into_inner();

    let replayed = tokio::time::timeout(Duration::from_secs(1), stream.message())
        .await
        .expect("replayed envelope")?
        .expect("stream open");
    assert_eq!(replayed.kind, "timer.fired");
    assert_eq!(replayed.timer_id, timer.id);
    assert!(replayed.bus_sequence > 0);

    let _ = shutdown.send(());
    Ok(())
}
