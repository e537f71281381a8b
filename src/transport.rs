//! The network side of heartbeating. The invoker is agnostic to how a heartbeat physically reaches
//! the orchestrator: it hands a [HeartbeatRequest] to a [HeartbeatTransport] from a background task
//! and reacts to whatever outcome comes back. Per-call timeouts and retries are the transport's
//! business.

use crate::{payload::Payloads, task_token::TaskToken};

/// A result from a transport call
pub type Result<T, E = tonic::Status> = std::result::Result<T, E>;

/// Everything sent to the server for one heartbeat
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatRequest {
    pub task_token: TaskToken,
    /// `None` when the activity heartbeated without details
    pub details: Option<Payloads>,
    /// Identity of the worker running the activity
    pub identity: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Set by the server when the activity has been requested to cancel
    pub cancel_requested: bool,
}

/// Sends activity heartbeats to the orchestrator.
///
/// Implementations must be callable from a background task. The invoker guarantees it will never
/// have more than one call outstanding per activity attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// Record a heartbeat for the activity identified by the request's task token
    async fn record_activity_heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse>;
}
