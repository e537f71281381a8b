//! What running activity code sees. An [ExecutionContext] is handed to the activity for each
//! attempt and optionally carries an [ActivityEnvironment], through which heartbeats reach the
//! attempt's [HeartbeatInvoker].

use crate::{
    app_data::AppData,
    errors::{ActivityContextError, RecordHeartbeatError},
    invoker::HeartbeatInvoker,
    options::HeartbeatInvokerOptionsBuilder,
    payload::{AsJsonPayloadExt, Payload},
    shutdown::ShutdownSignal,
    task_token::TaskToken,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Describes the activity attempt being executed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivityInfo {
    pub task_token: TaskToken,
    pub workflow_type: String,
    pub workflow_domain: String,
    pub workflow_id: String,
    pub run_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub task_queue: String,
    pub heartbeat_timeout: Option<Duration>,
    /// Attempt starts from 1, and increases by 1 for every retry
    pub attempt: u32,
}

impl ActivityInfo {
    /// Invoker options pre-populated from this attempt
    pub fn invoker_options(&self, identity: impl Into<String>) -> HeartbeatInvokerOptionsBuilder {
        let mut builder = HeartbeatInvokerOptionsBuilder::default();
        builder
            .task_token(self.task_token.clone())
            .identity(identity)
            .workflow_type(self.workflow_type.clone())
            .activity_type(self.activity_type.clone());
        builder
    }
}

/// Everything bound to a context while an activity attempt runs
#[derive(Clone, Debug, Default)]
pub struct ActivityEnvironment {
    pub info: ActivityInfo,
    /// Absent for activities which do not heartbeat to the server, like local activities
    pub invoker: Option<Arc<HeartbeatInvoker>>,
    pub worker_shutdown: ShutdownSignal,
    /// Details recorded by the previous attempt, if it heartbeated before failing
    pub heartbeat_details: Vec<Payload>,
}

/// Execution context passed to activity code
#[derive(Clone, Debug, Default)]
pub struct ExecutionContext {
    activity: Option<Arc<ActivityEnvironment>>,
    app_data: AppData,
    cancellation_token: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context which is done once `token` is cancelled
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation_token: token,
            ..Default::default()
        }
    }

    /// Bind (or, with `None`, unbind) an activity environment
    pub fn bind_activity(mut self, env: Option<ActivityEnvironment>) -> Self {
        self.activity = env.map(Arc::new);
        self
    }

    pub fn with_app_data<T: Send + Sync + 'static>(mut self, val: T) -> Self {
        self.app_data.insert(val);
        self
    }

    pub fn app_data<T: 'static>(&self) -> Option<&T> {
        self.app_data.get::<T>()
    }

    pub fn activity(&self) -> Option<&ActivityEnvironment> {
        self.activity.as_deref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Returns a future that completes once this context has been cancelled
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    fn activity_env(&self) -> Result<&ActivityEnvironment, ActivityContextError> {
        self.activity()
            .ok_or(ActivityContextError::NotAnActivityContext)
    }
}

/// Records a heartbeat for the activity running in `ctx`. Never blocks on the network and never
/// reports delivery problems; those surface only as `ctx` being cancelled if the server says the
/// activity should stop.
pub fn record_heartbeat(
    ctx: &ExecutionContext,
    details: Vec<Payload>,
) -> Result<(), ActivityContextError> {
    let env = ctx.activity_env()?;
    match env.invoker {
        Some(ref invoker) => invoker.record(details),
        None => trace!(
            activity_id = %env.info.activity_id,
            "Activity has no heartbeat invoker, ignoring heartbeat"
        ),
    }
    Ok(())
}

/// Like [record_heartbeat], encoding `details` as a single json payload
pub fn record_heartbeat_json<T: Serialize>(
    ctx: &ExecutionContext,
    details: &T,
) -> Result<(), RecordHeartbeatError> {
    let payload = details.as_json_payload()?;
    record_heartbeat(ctx, vec![payload])?;
    Ok(())
}

/// The signal that closes once the worker running this activity begins to stop
pub fn worker_stop_signal(ctx: &ExecutionContext) -> Result<ShutdownSignal, ActivityContextError> {
    Ok(ctx.activity_env()?.worker_shutdown.clone())
}

/// True if `ctx` is bound to a running activity
pub fn has_activity_info(ctx: &ExecutionContext) -> bool {
    ctx.activity().is_some()
}

pub fn activity_info(ctx: &ExecutionContext) -> Result<&ActivityInfo, ActivityContextError> {
    Ok(&ctx.activity_env()?.info)
}

/// Details the previous attempt heartbeated, for resuming progress
pub fn heartbeat_details(ctx: &ExecutionContext) -> Result<&[Payload], ActivityContextError> {
    Ok(&ctx.activity_env()?.heartbeat_details)
}

pub fn has_heartbeat_details(ctx: &ExecutionContext) -> bool {
    ctx.activity()
        .map(|env| !env.heartbeat_details.is_empty())
        .unwrap_or_default()
}
