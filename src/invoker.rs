//! Throttled, coalescing delivery of heartbeats for a single activity attempt.
//!
//! Every input (recorded heartbeats, completed sends, expired throttle timers, the worker stopping)
//! is applied to [HeartbeatState] under one lock. Each transition may hand back a
//! [HeartbeatExecutorAction], which is carried out after the lock is released.

use crate::{
    cancel::CancellationBridge,
    classify::{ActivityCancelReason, HeartbeatErrorClassifier, HeartbeatOutcome},
    errors::InvokerInitError,
    options::{FeatureFlags, HeartbeatInvokerOptions},
    payload::{IntoPayloadsExt, Payload},
    shutdown::ShutdownSignal,
    task_token::TaskToken,
    transport::{HeartbeatRequest, HeartbeatTransport},
};
use parking_lot::Mutex;
use std::{fmt::Debug, sync::Arc, time::Duration};
use tokio::{runtime::Handle, sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Observable state of a [HeartbeatInvoker]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvokerStatus {
    /// No heartbeat is being sent right now
    Idle,
    /// A call to the server is outstanding
    Sending,
    /// The server told us the activity should stop. Terminal.
    Cancelled,
    /// [HeartbeatInvoker::close] was called. Terminal.
    Closed,
}

/// Reports heartbeats for one activity attempt to the server.
///
/// [Self::record] may be called as often as the activity likes, from any thread. At most one call
/// to the server is ever outstanding, and at most one is made per throttle interval. Details
/// recorded while a call is outstanding or throttled are buffered, with each new recording
/// replacing the last, so whatever eventually goes out is always the most recent.
///
/// When the server responds that the activity was cancelled, or no longer knows about it, the
/// [CancellationBridge] the invoker was created with fires (exactly once) and heartbeating stops.
pub struct HeartbeatInvoker {
    shared: Arc<InvokerShared>,
}

struct InvokerShared {
    state: Mutex<HeartbeatState>,
    task_token: TaskToken,
    identity: String,
    feature_flags: FeatureFlags,
    flush_timeout: Duration,
    throttle_interval: Duration,
    classifier: HeartbeatErrorClassifier,
    transport: Arc<dyn HeartbeatTransport>,
    cancel_bridge: CancellationBridge,
    /// Woken every time an outstanding report completes
    report_completed: Notify,
    /// Cancelled on close. Stops the worker-stopping observer and any throttle timer.
    close_token: CancellationToken,
    span: tracing::Span,
    rt: Handle,
}

#[derive(Debug)]
enum HeartbeatExecutorAction {
    /// Heartbeats are throttled, sleep until duration or wait to be cancelled
    Sleep(Duration, CancellationToken),
    /// Report heartbeat to the server
    Report(Vec<Payload>),
    /// The server says this activity is done for, tell the activity
    Cancel(ActivityCancelReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Cancelled(ActivityCancelReason),
    Closed,
}

#[derive(Debug)]
struct HeartbeatState {
    lifecycle: Lifecycle,
    /// Most recent details not yet handed to a report
    pending_details: Option<Vec<Payload>>,
    /// True if we've queued up a request to record against server, but it hasn't yet completed
    is_record_in_flight: bool,
    /// When the last report completed. Anchors the throttle window.
    last_completed: Option<Instant>,
    throttle_interval: Duration,
    /// Set once the worker starts stopping, after which throttling no longer applies
    worker_stopping: bool,
    /// Present while a throttle timer is armed
    throttled_cancellation_token: Option<CancellationToken>,
    /// Parent of every throttle timer token
    timers_token: CancellationToken,
}

impl HeartbeatState {
    fn new(throttle_interval: Duration, timers_token: CancellationToken) -> Self {
        Self {
            lifecycle: Lifecycle::Active,
            pending_details: None,
            is_record_in_flight: false,
            last_completed: None,
            throttle_interval,
            worker_stopping: false,
            throttled_cancellation_token: None,
            timers_token,
        }
    }

    fn status(&self) -> InvokerStatus {
        match self.lifecycle {
            Lifecycle::Cancelled(_) => InvokerStatus::Cancelled,
            Lifecycle::Closed => InvokerStatus::Closed,
            Lifecycle::Active if self.is_record_in_flight => InvokerStatus::Sending,
            Lifecycle::Active => InvokerStatus::Idle,
        }
    }

    fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Time left in the current throttle window
    fn throttle_remaining(&self) -> Duration {
        if self.worker_stopping {
            return Duration::ZERO;
        }
        match self.last_completed {
            None => Duration::ZERO,
            Some(at) => self.throttle_interval.saturating_sub(at.elapsed()),
        }
    }

    /// Record a heartbeat received from the activity
    fn record(&mut self, details: Vec<Payload>) -> Option<HeartbeatExecutorAction> {
        if !self.is_active() {
            trace!(lifecycle = ?self.lifecycle, "Dropping heartbeat for inactive invoker");
            return None;
        }
        self.pending_details = Some(details);
        if self.is_record_in_flight {
            // Completion of the outstanding report will pick the details up
            return None;
        }
        self.dispatch_or_throttle()
    }

    /// Report pending details now if the throttle window allows, otherwise make sure a timer is
    /// armed for when it ends
    fn dispatch_or_throttle(&mut self) -> Option<HeartbeatExecutorAction> {
        self.pending_details.as_ref()?;
        let remaining = self.throttle_remaining();
        if remaining.is_zero() {
            self.start_report()
        } else if self.throttled_cancellation_token.is_some() {
            None
        } else {
            let token = self.timers_token.child_token();
            self.throttled_cancellation_token = Some(token.clone());
            Some(HeartbeatExecutorAction::Sleep(remaining, token))
        }
    }

    fn start_report(&mut self) -> Option<HeartbeatExecutorAction> {
        let details = self.pending_details.take()?;
        if let Some(tok) = self.throttled_cancellation_token.take() {
            tok.cancel();
        }
        self.is_record_in_flight = true;
        Some(HeartbeatExecutorAction::Report(details))
    }

    /// Heartbeat report to server completed
    fn handle_report_completed(
        &mut self,
        cancel_reason: Option<ActivityCancelReason>,
    ) -> Option<HeartbeatExecutorAction> {
        self.is_record_in_flight = false;
        self.last_completed = Some(Instant::now());
        match (self.lifecycle, cancel_reason) {
            (Lifecycle::Active, Some(reason)) => {
                self.lifecycle = Lifecycle::Cancelled(reason);
                self.pending_details = None;
                self.throttled_cancellation_token = None;
                self.timers_token.cancel();
                Some(HeartbeatExecutorAction::Cancel(reason))
            }
            (Lifecycle::Active, None) => self.dispatch_or_throttle(),
            (Lifecycle::Closed, reason) => self.handle_flush_completed(reason),
            _ => None,
        }
    }

    /// A send which completed after close still gets to cancel the activity
    fn handle_flush_completed(
        &mut self,
        cancel_reason: Option<ActivityCancelReason>,
    ) -> Option<HeartbeatExecutorAction> {
        match (self.lifecycle, cancel_reason) {
            (Lifecycle::Closed, Some(reason)) => {
                self.lifecycle = Lifecycle::Cancelled(reason);
                Some(HeartbeatExecutorAction::Cancel(reason))
            }
            _ => None,
        }
    }

    /// Throttle window is over, report whatever accumulated during it
    fn handle_throttle_completed(
        &mut self,
        token: &CancellationToken,
    ) -> Option<HeartbeatExecutorAction> {
        // A timer that lost the race against being replaced or cancelled must not touch state
        if token.is_cancelled() {
            return None;
        }
        self.throttled_cancellation_token = None;
        if !self.is_active() || self.is_record_in_flight {
            return None;
        }
        self.start_report()
    }

    /// The worker is going away, flush immediately and stop throttling from here on
    fn handle_worker_stopping(&mut self) -> Option<HeartbeatExecutorAction> {
        self.worker_stopping = true;
        if !self.is_active() || self.is_record_in_flight {
            return None;
        }
        self.start_report()
    }

    /// Moves to closed, returning the details which should be flushed, if any
    fn close(&mut self, flush: bool) -> Option<Vec<Payload>> {
        if !self.is_active() {
            self.pending_details = None;
            return None;
        }
        self.lifecycle = Lifecycle::Closed;
        self.throttled_cancellation_token = None;
        self.timers_token.cancel();
        let pending = self.pending_details.take();
        if flush {
            pending
        } else {
            if pending.is_some() {
                debug!("Discarding buffered heartbeat on close");
            }
            None
        }
    }
}

impl HeartbeatInvoker {
    /// Create an invoker for one activity attempt. Must be called from within a tokio runtime,
    /// which is used to send heartbeats in the background.
    ///
    /// `cancel` fires at most once, the first time the server indicates the activity should be
    /// abandoned. `worker_shutdown` closing causes any buffered heartbeat to be flushed right
    /// away.
    pub fn new(
        options: HeartbeatInvokerOptions,
        transport: Arc<dyn HeartbeatTransport>,
        cancel: impl Into<CancellationBridge>,
        worker_shutdown: ShutdownSignal,
    ) -> Result<Self, InvokerInitError> {
        let rt = Handle::try_current()?;
        let span = options.make_span();
        let close_token = CancellationToken::new();
        let shared = Arc::new(InvokerShared {
            state: Mutex::new(HeartbeatState::new(
                options.throttle_interval,
                close_token.child_token(),
            )),
            task_token: options.task_token,
            identity: options.identity,
            feature_flags: options.feature_flags,
            flush_timeout: options.flush_timeout,
            throttle_interval: options.throttle_interval,
            classifier: options.error_classifier,
            transport,
            cancel_bridge: cancel.into(),
            report_completed: Notify::new(),
            close_token,
            span,
            rt,
        });
        shared.observe_worker_shutdown(worker_shutdown);
        Ok(Self { shared })
    }

    /// Record new heartbeat details. Never blocks on the network.
    ///
    /// The first call results in an immediate report to the server, while rapid successive calls
    /// accumulate for up to the throttle interval, and then only the latest details are sent.
    /// Does nothing once the invoker is cancelled or closed. An empty vec means "no details".
    pub fn record(&self, details: Vec<Payload>) {
        let action = {
            let _entered = self.shared.span.enter();
            self.shared.state.lock().record(details)
        };
        self.shared.execute(action);
    }

    /// Stop heartbeating. If `flush` is set and there are buffered details which have not been
    /// sent, waits for any outstanding report and then makes one last attempt to send them, bounded
    /// by the configured flush timeout. Failures are logged. Otherwise buffered details are
    /// dropped.
    ///
    /// Calling this more than once, or after the invoker was cancelled, has no further effect. If
    /// the server answers the final send, or one still outstanding at close, by saying the activity
    /// should stop, the cancellation still fires and the status becomes
    /// [InvokerStatus::Cancelled].
    pub async fn close(&self, flush: bool) {
        let to_flush = self.shared.state.lock().close(flush);
        self.shared.close_token.cancel();
        if let Some(details) = to_flush {
            let shared = &self.shared;
            let flush_fut = async {
                shared.wait_for_report_completion().await;
                // The outstanding report may have been told the activity is gone
                if shared.state.lock().lifecycle != Lifecycle::Closed {
                    return None;
                }
                Some(shared.send(details).await)
            };
            match tokio::time::timeout(shared.flush_timeout, flush_fut)
                .instrument(shared.span.clone())
                .await
            {
                Ok(None) => debug!(
                    parent: &shared.span,
                    "Activity cancelled before final heartbeat flush"
                ),
                Ok(Some(outcome)) => {
                    if matches!(outcome, HeartbeatOutcome::Transient(_)) {
                        warn!(parent: &shared.span, "Final heartbeat flush failed");
                    } else {
                        debug!(parent: &shared.span, ?outcome, "Flushed final heartbeat");
                    }
                    let next = shared
                        .state
                        .lock()
                        .handle_flush_completed(outcome.cancel_reason());
                    shared.execute(next);
                }
                Err(_) => warn!(
                    parent: &shared.span,
                    timeout = ?shared.flush_timeout,
                    "Abandoned final heartbeat flush after timeout"
                ),
            }
        }
    }

    pub fn status(&self) -> InvokerStatus {
        self.shared.state.lock().status()
    }

    /// Why the activity was cancelled, if the server told us to stop
    pub fn cancel_reason(&self) -> Option<ActivityCancelReason> {
        match self.shared.state.lock().lifecycle {
            Lifecycle::Cancelled(r) => Some(r),
            _ => None,
        }
    }

    pub fn task_token(&self) -> &TaskToken {
        &self.shared.task_token
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn throttle_interval(&self) -> Duration {
        self.shared.throttle_interval
    }

    pub fn feature_flags(&self) -> &FeatureFlags {
        &self.shared.feature_flags
    }
}

impl Drop for HeartbeatInvoker {
    fn drop(&mut self) {
        self.shared.state.lock().close(false);
        self.shared.close_token.cancel();
    }
}

impl Debug for HeartbeatInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatInvoker")
            .field("task_token", &self.shared.task_token)
            .field("identity", &self.shared.identity)
            .field("status", &self.status())
            .finish()
    }
}

impl InvokerShared {
    fn execute(self: &Arc<Self>, action: Option<HeartbeatExecutorAction>) {
        let Some(action) = action else {
            return;
        };
        match action {
            HeartbeatExecutorAction::Sleep(duration, token) => {
                let me = self.clone();
                self.rt.spawn(
                    async move {
                        tokio::select! {
                            _ = token.cancelled() => (),
                            _ = tokio::time::sleep(duration) => {
                                let next = me.state.lock().handle_throttle_completed(&token);
                                me.execute(next);
                            }
                        }
                    }
                    .instrument(self.span.clone()),
                );
            }
            HeartbeatExecutorAction::Report(details) => {
                let me = self.clone();
                self.rt.spawn(
                    async move {
                        let outcome = me.send(details).await;
                        let next = me
                            .state
                            .lock()
                            .handle_report_completed(outcome.cancel_reason());
                        me.report_completed.notify_waiters();
                        me.execute(next);
                    }
                    .instrument(self.span.clone()),
                );
            }
            HeartbeatExecutorAction::Cancel(reason) => {
                info!(parent: &self.span, %reason, "Server indicated activity should stop");
                self.cancel_bridge.cancel();
            }
        }
    }

    async fn send(&self, details: Vec<Payload>) -> HeartbeatOutcome {
        let request = HeartbeatRequest {
            task_token: self.task_token.clone(),
            details: details.into_payloads(),
            identity: self.identity.clone(),
        };
        let result = self.transport.record_activity_heartbeat(request).await;
        let outcome = self.classifier.classify(result);
        match &outcome {
            HeartbeatOutcome::Recorded => trace!("Heartbeat recorded"),
            HeartbeatOutcome::Terminal(reason) => {
                debug!(%reason, "Heartbeat returned terminal outcome")
            }
            HeartbeatOutcome::Transient(e) => warn!("Error when recording heartbeat: {:?}", e),
        }
        outcome
    }

    async fn wait_for_report_completion(&self) {
        loop {
            let notified = self.report_completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.state.lock().is_record_in_flight {
                return;
            }
            notified.await;
        }
    }

    fn observe_worker_shutdown(self: &Arc<Self>, worker_shutdown: ShutdownSignal) {
        let me = self.clone();
        let close_token = self.close_token.clone();
        self.rt.spawn(
            async move {
                tokio::select! {
                    biased;

                    _ = close_token.cancelled() => (),
                    _ = worker_shutdown.closed() => {
                        debug!("Worker is stopping, flushing buffered heartbeat");
                        let next = me.state.lock().handle_worker_stopping();
                        me.execute(next);
                    }
                }
            }
            .instrument(self.span.clone()),
        );
    }
}
