use crate::{
    context::{ActivityEnvironment, ActivityInfo, ExecutionContext},
    errors::InvokerInitError,
    invoker::HeartbeatInvoker,
    options::HeartbeatInvokerOptions,
    payload::Payload,
    shutdown::ShutdownSignal,
    transport::HeartbeatTransport,
};
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// One execution attempt of an activity, owning the attempt's heartbeat invoker.
///
/// The invoker is created when the attempt starts and threaded into the [ExecutionContext] the
/// activity runs with. When the activity finishes the invoker is closed: buffered heartbeat
/// details are flushed if the activity completed on its own, and dropped if the server cancelled
/// it.
#[derive(Debug)]
pub struct ActivityAttempt {
    invoker: Arc<HeartbeatInvoker>,
    ctx: ExecutionContext,
}

impl ActivityAttempt {
    /// Must be called from within a tokio runtime
    pub fn start(
        options: HeartbeatInvokerOptions,
        info: ActivityInfo,
        transport: Arc<dyn HeartbeatTransport>,
        worker_shutdown: ShutdownSignal,
        heartbeat_details: Vec<Payload>,
    ) -> Result<Self, InvokerInitError> {
        let cancellation_token = CancellationToken::new();
        let invoker = Arc::new(HeartbeatInvoker::new(
            options,
            transport,
            cancellation_token.clone(),
            worker_shutdown.clone(),
        )?);
        let ctx = ExecutionContext::with_cancellation(cancellation_token).bind_activity(Some(
            ActivityEnvironment {
                info,
                invoker: Some(invoker.clone()),
                worker_shutdown,
                heartbeat_details,
            },
        ));
        Ok(Self { invoker, ctx })
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn invoker(&self) -> &Arc<HeartbeatInvoker> {
        &self.invoker
    }

    /// Run the activity to completion, then close the invoker
    pub async fn run<F, Fut, T>(self, activity: F) -> T
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let res = activity(self.ctx.clone()).await;
        let cancelled = self.ctx.is_cancelled();
        if cancelled {
            debug!(task_token = %self.invoker.task_token(), "Activity attempt ended cancelled");
        }
        self.invoker.close(!cancelled).await;
        res
    }
}
