/// Errors thrown when constructing a [crate::HeartbeatInvoker]
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum InvokerInitError {
    /// Heartbeat invoker must be created from within a tokio runtime
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Errors thrown by the context-facing accessors in [crate::context]
#[derive(thiserror::Error, Debug, displaydoc::Display, PartialEq, Eq)]
pub enum ActivityContextError {
    /// The execution context is not bound to a running activity
    NotAnActivityContext,
}

/// Errors thrown when encoding or decoding heartbeat details
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum PayloadError {
    /// Payload is not json encoded
    NotJson,
    /// Error during (de)serialization: {0}
    Json(#[from] serde_json::Error),
}

/// Errors thrown by [crate::record_heartbeat_json]
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum RecordHeartbeatError {
    /// {0}
    Context(#[from] ActivityContextError),
    /// Heartbeat details could not be encoded: {0}
    Payload(#[from] PayloadError),
}
