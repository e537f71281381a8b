//! Helpers for exercising heartbeat invokers against a scriptable, in-memory transport.

use activity_heartbeat::{
    FromJsonPayloadExt, HeartbeatInvoker, HeartbeatInvokerOptions, HeartbeatRequest,
    HeartbeatResponse, HeartbeatTransport, ShutdownSignal,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const TEST_TASK_TOKEN: &[u8] = b"task-token";
pub const TEST_IDENTITY: &str = "identity";
pub const TEST_WORKFLOW_TYPE: &str = "test-workflow-type";
pub const TEST_ACTIVITY_TYPE: &str = "test-activity-type";

type ScriptedResult = Result<HeartbeatResponse, tonic::Status>;

/// A [HeartbeatTransport] that answers from a script, falling back to successful responses once
/// the script runs out, and remembers every request it saw.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    script: Mutex<VecDeque<ScriptedResult>>,
    requests: Mutex<Vec<HeartbeatRequest>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: CallCounter,
}

struct CallCounter {
    tx: watch::Sender<usize>,
}

impl Default for CallCounter {
    fn default() -> Self {
        Self {
            tx: watch::channel(0).0,
        }
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each call takes this long to complete
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change how long calls made from now on take to complete
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Queue up the result of the next unanswered call
    pub fn respond_with(&self, result: ScriptedResult) -> &Self {
        self.inner.script.lock().push_back(result);
        self
    }

    pub fn requests(&self) -> Vec<HeartbeatRequest> {
        self.inner.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        *self.inner.calls.tx.borrow()
    }

    /// The most calls that were ever outstanding at the same moment
    pub fn max_concurrent_calls(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every request's details decoded as a json string, `None` for absent details
    pub fn sent_strings(&self) -> Vec<Option<String>> {
        self.requests()
            .iter()
            .map(|r| {
                r.details.as_ref().map(|d| {
                    String::from_json_payload(&d.payloads[0])
                        .expect("test details are json strings")
                })
            })
            .collect()
    }

    /// Waits until at least `n` calls have completed. Panics after `timeout`.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) {
        let mut rx = self.inner.calls.tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|c| *c >= n))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "Expected {} heartbeat calls, only saw {}",
                    n,
                    self.call_count()
                )
            })
            .expect("call counter is never dropped while a transport exists");
    }
}

#[async_trait::async_trait]
impl HeartbeatTransport for FakeTransport {
    async fn record_activity_heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, tonic::Status> {
        let now_in_flight = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner
            .max_in_flight
            .fetch_max(now_in_flight, Ordering::SeqCst);
        self.inner.requests.lock().push(request);
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let result = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HeartbeatResponse::default()));
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.calls.tx.send_modify(|c| *c += 1);
        result
    }
}

/// Options for the canned test activity with the given throttle interval
pub fn test_options(throttle_interval: Duration) -> HeartbeatInvokerOptions {
    HeartbeatInvokerOptions::builder()
        .task_token(TEST_TASK_TOKEN.to_vec())
        .identity(TEST_IDENTITY)
        .workflow_type(TEST_WORKFLOW_TYPE)
        .activity_type(TEST_ACTIVITY_TYPE)
        .throttle_interval(throttle_interval)
        .build()
        .expect("test options are valid")
}

/// Everything a test needs to drive and observe an invoker
pub struct TestInvoker {
    pub invoker: Arc<HeartbeatInvoker>,
    pub transport: FakeTransport,
    pub cancel: CancellationToken,
    pub worker_shutdown: ShutdownSignal,
}

/// Creates an invoker for the canned test activity backed by `transport`
pub fn test_invoker(transport: FakeTransport, throttle_interval: Duration) -> TestInvoker {
    let cancel = CancellationToken::new();
    let worker_shutdown = ShutdownSignal::new();
    let invoker = HeartbeatInvoker::new(
        test_options(throttle_interval),
        Arc::new(transport.clone()),
        cancel.clone(),
        worker_shutdown.clone(),
    )
    .expect("test invoker is created inside a runtime");
    TestInvoker {
        invoker: Arc::new(invoker),
        transport,
        cancel,
        worker_shutdown,
    }
}
