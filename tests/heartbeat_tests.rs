use activity_heartbeat::{
    record_heartbeat, record_heartbeat_json, telemetry_init, worker_stop_signal, ActivityAttempt,
    ActivityCancelReason, ActivityEnvironment, ActivityInfo, AsJsonPayloadExt, ExecutionContext,
    HeartbeatInvoker, HeartbeatInvokerOptions, HeartbeatResponse, InvokerStatus, Payload,
    ShutdownSignal, TaskToken,
};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use test_utils::{
    test_invoker, test_options, FakeTransport, TestInvoker, TEST_ACTIVITY_TYPE, TEST_IDENTITY,
    TEST_TASK_TOKEN, TEST_WORKFLOW_TYPE,
};

const WAIT: Duration = Duration::from_secs(5);

/// Binds the invoker into a context the way the worker does for a running attempt
fn activity_ctx(t: &TestInvoker) -> ExecutionContext {
    ExecutionContext::with_cancellation(t.cancel.clone()).bind_activity(Some(ActivityEnvironment {
        info: ActivityInfo {
            task_token: TaskToken::from(TEST_TASK_TOKEN),
            activity_type: TEST_ACTIVITY_TYPE.to_string(),
            ..Default::default()
        },
        invoker: Some(t.invoker.clone()),
        worker_shutdown: t.worker_shutdown.clone(),
        heartbeat_details: vec![],
    }))
}

fn hb(ctx: &ExecutionContext, details: &str) {
    record_heartbeat_json(ctx, &details).unwrap();
}

#[tokio::test]
async fn activity_heartbeat() {
    telemetry_init();
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(1));
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    t.transport.wait_for_calls(1, WAIT).await;
    let req = &t.transport.requests()[0];
    assert_eq!(req.task_token, TaskToken::from(TEST_TASK_TOKEN));
    assert_eq!(req.identity, TEST_IDENTITY);
    assert_eq!(t.transport.sent_strings(), vec![Some("testDetails".to_string())]);
    assert!(!ctx.is_cancelled());
}

#[tokio::test]
async fn activity_heartbeat_internal_error() {
    let transport = FakeTransport::new();
    transport
        .respond_with(Err(tonic::Status::internal("internal service error")))
        .respond_with(Err(tonic::Status::internal("internal service error")));
    let t = test_invoker(transport, Duration::ZERO);
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    t.transport.wait_for_calls(1, WAIT).await;
    hb(&ctx, "testDetails2");
    t.transport.wait_for_calls(2, WAIT).await;
    hb(&ctx, "testDetails3");
    t.transport.wait_for_calls(3, WAIT).await;
    assert!(!ctx.is_cancelled());
    assert_eq!(t.invoker.cancel_reason(), None);
}

#[tokio::test]
async fn activity_heartbeat_cancel_requested() {
    let transport = FakeTransport::new();
    transport.respond_with(Ok(HeartbeatResponse {
        cancel_requested: true,
    }));
    let t = test_invoker(transport, Duration::ZERO);
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    tokio::time::timeout(WAIT, ctx.cancelled()).await.unwrap();
    assert_eq!(t.invoker.cancel_reason(), Some(ActivityCancelReason::Cancelled));

    hb(&ctx, "afterCancel");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.transport.call_count(), 1);
}

#[tokio::test]
async fn activity_heartbeat_entity_not_exist() {
    let transport = FakeTransport::new();
    transport.respond_with(Err(tonic::Status::not_found("entity not exists")));
    let t = test_invoker(transport, Duration::ZERO);
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    tokio::time::timeout(WAIT, ctx.cancelled()).await.unwrap();
    assert_eq!(t.invoker.cancel_reason(), Some(ActivityCancelReason::NotFound));
    assert_eq!(t.invoker.status(), InvokerStatus::Cancelled);

    hb(&ctx, "afterNotFound");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn suppress_continuous_invokes() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(2));
    let ctx = activity_ctx(&t);
    for _ in 0..3 {
        hb(&ctx, "testDetails");
    }
    t.invoker.close(false).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(t.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn batch_picks_latest_before_expiry() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(2));
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    hb(&ctx, "testDetails2");
    hb(&ctx, "testDetails3");
    hb(&ctx, "testDetails-expected");
    t.transport.wait_for_calls(2, WAIT).await;
    t.invoker.close(false).await;
    assert_eq!(
        t.transport.sent_strings(),
        vec![
            Some("testDetails".to_string()),
            Some("testDetails-expected".to_string())
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn batch_without_progress_sends_absent_details() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(2));
    let ctx = activity_ctx(&t);
    for _ in 0..4 {
        record_heartbeat(&ctx, vec![]).unwrap();
    }
    t.transport.wait_for_calls(2, WAIT).await;
    t.invoker.close(false).await;
    assert_eq!(t.transport.sent_strings(), vec![None, None]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_throttle_never_overlaps_calls() {
    let t = test_invoker(
        FakeTransport::new().with_latency(Duration::from_millis(20)),
        Duration::ZERO,
    );
    let ctx = activity_ctx(&t);
    hb(&ctx, "first");
    hb(&ctx, "second");
    t.transport.wait_for_calls(2, WAIT).await;
    assert_eq!(
        t.transport.sent_strings(),
        vec![Some("first".to_string()), Some("second".to_string())]
    );

    // Hammer it from several tasks at once
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for j in 0..50 {
                    hb(&ctx, &format!("{}-{}", i, j));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    t.invoker.close(true).await;
    assert_eq!(t.transport.max_concurrent_calls(), 1);
    // Far fewer calls than heartbeats
    assert!(t.transport.call_count() < 400);
}

#[tokio::test]
async fn worker_stop_flushes_buffered_heartbeat() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(5));
    let ctx = activity_ctx(&t);
    hb(&ctx, "testDetails");
    t.transport.wait_for_calls(1, WAIT).await;
    hb(&ctx, "testDetails-latest");
    worker_stop_signal(&ctx).unwrap().close();
    // Well inside the throttle window
    t.transport.wait_for_calls(2, Duration::from_secs(1)).await;
    assert_eq!(
        t.transport.sent_strings()[1].as_deref(),
        Some("testDetails-latest")
    );
}

#[tokio::test]
async fn close_waits_for_outstanding_call_then_flushes() {
    let t = test_invoker(
        FakeTransport::new().with_latency(Duration::from_millis(100)),
        Duration::ZERO,
    );
    let ctx = activity_ctx(&t);
    hb(&ctx, "inFlight");
    hb(&ctx, "buffered");
    t.invoker.close(true).await;
    assert_eq!(t.transport.call_count(), 2);
    assert_eq!(t.transport.max_concurrent_calls(), 1);
    assert_eq!(
        t.transport.sent_strings(),
        vec![Some("inFlight".to_string()), Some("buffered".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn close_twice_has_no_effect() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(10));
    let ctx = activity_ctx(&t);
    hb(&ctx, "first");
    t.transport.wait_for_calls(1, WAIT).await;
    hb(&ctx, "buffered");
    t.invoker.close(true).await;
    assert_eq!(t.transport.call_count(), 2);
    t.invoker.close(true).await;
    hb(&ctx, "afterClose");
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(t.transport.call_count(), 2);
    assert_eq!(t.invoker.status(), InvokerStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancel_requested_on_final_flush_cancels_activity() {
    let t = test_invoker(FakeTransport::new(), Duration::from_secs(10));
    t.transport
        .respond_with(Ok(HeartbeatResponse::default()))
        .respond_with(Ok(HeartbeatResponse {
            cancel_requested: true,
        }));
    let ctx = activity_ctx(&t);
    hb(&ctx, "first");
    t.transport.wait_for_calls(1, WAIT).await;
    hb(&ctx, "buffered");
    t.invoker.close(true).await;
    assert_eq!(t.transport.call_count(), 2);
    assert!(ctx.is_cancelled());
    assert_eq!(t.invoker.cancel_reason(), Some(ActivityCancelReason::Cancelled));
    assert_eq!(t.invoker.status(), InvokerStatus::Cancelled);
}

#[tokio::test]
async fn not_found_after_close_cancels_activity() {
    let t = test_invoker(
        FakeTransport::new().with_latency(Duration::from_millis(50)),
        Duration::ZERO,
    );
    t.transport.respond_with(Err(tonic::Status::not_found("activity gone")));
    let ctx = activity_ctx(&t);
    hb(&ctx, "inFlight");
    t.invoker.close(false).await;
    tokio::time::timeout(WAIT, ctx.cancelled()).await.unwrap();
    assert_eq!(t.invoker.cancel_reason(), Some(ActivityCancelReason::NotFound));
    assert_eq!(t.transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn close_abandons_wait_for_outstanding_call_after_flush_timeout() {
    let transport = FakeTransport::new().with_latency(Duration::from_secs(30));
    let invoker = HeartbeatInvoker::new(
        flush_timeout_options(Duration::ZERO, Duration::from_secs(1)),
        Arc::new(transport.clone()),
        CancellationToken::new(),
        ShutdownSignal::new(),
    )
    .unwrap();
    invoker.record(vec!["inFlight".as_json_payload().unwrap()]);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.requests().len(), 1);
    invoker.record(vec!["buffered".as_json_payload().unwrap()]);

    let started = Instant::now();
    invoker.close(true).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "closed after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "closed after {elapsed:?}");

    // The buffered details were never sent, not even once the slow call finished
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.call_count(), 1);
    assert_eq!(transport.sent_strings(), vec![Some("inFlight".to_string())]);
    assert_eq!(invoker.status(), InvokerStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn close_abandons_slow_final_flush_after_flush_timeout() {
    let transport = FakeTransport::new();
    let invoker = HeartbeatInvoker::new(
        flush_timeout_options(Duration::from_secs(10), Duration::from_secs(1)),
        Arc::new(transport.clone()),
        CancellationToken::new(),
        ShutdownSignal::new(),
    )
    .unwrap();
    invoker.record(vec!["first".as_json_payload().unwrap()]);
    transport.wait_for_calls(1, WAIT).await;
    invoker.record(vec!["buffered".as_json_payload().unwrap()]);
    transport.set_latency(Duration::from_secs(30));

    let started = Instant::now();
    invoker.close(true).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "closed after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "closed after {elapsed:?}");
    assert_eq!(
        transport.sent_strings(),
        vec![Some("first".to_string()), Some("buffered".to_string())]
    );
    assert_eq!(transport.call_count(), 1);
}

fn flush_timeout_options(
    throttle_interval: Duration,
    flush_timeout: Duration,
) -> HeartbeatInvokerOptions {
    HeartbeatInvokerOptions::builder()
        .task_token(TEST_TASK_TOKEN.to_vec())
        .identity(TEST_IDENTITY)
        .workflow_type(TEST_WORKFLOW_TYPE)
        .activity_type(TEST_ACTIVITY_TYPE)
        .throttle_interval(throttle_interval)
        .flush_timeout(flush_timeout)
        .build()
        .unwrap()
}

#[tokio::test]
async fn attempt_threads_invoker_into_activity() {
    let transport = FakeTransport::new();
    let worker_shutdown = ShutdownSignal::new();
    let info = ActivityInfo {
        task_token: TaskToken::from(TEST_TASK_TOKEN),
        workflow_type: "wf".to_string(),
        activity_type: "act".to_string(),
        activity_id: "1".to_string(),
        attempt: 2,
        ..Default::default()
    };
    let attempt = ActivityAttempt::start(
        test_options(Duration::from_secs(60)),
        info,
        Arc::new(transport.clone()),
        worker_shutdown.clone(),
        vec!["resume-from".as_json_payload().unwrap()],
    )
    .unwrap();
    let progress = attempt
        .run(|ctx| async move {
            let prior: Vec<Payload> = activity_heartbeat::heartbeat_details(&ctx).unwrap().to_vec();
            record_heartbeat(&ctx, prior).unwrap();
            record_heartbeat_json(&ctx, &"final-progress").unwrap();
            activity_heartbeat::activity_info(&ctx).unwrap().attempt
        })
        .await;
    assert_eq!(progress, 2);
    assert_eq!(
        transport.sent_strings(),
        vec![
            Some("resume-from".to_string()),
            Some("final-progress".to_string())
        ]
    );
}
