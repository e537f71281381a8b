#![warn(missing_debug_implementations)]

//! Client-side activity heartbeating.
//!
//! Long-running activities report progress by heartbeating. Activity code may do so as often as
//! it likes; a [HeartbeatInvoker] turns that stream into a throttled, coalesced stream of calls to
//! the server which always carries the latest details, and translates the server telling us the
//! activity is cancelled (or gone) into cancellation of the activity's [ExecutionContext].
//!
//! Activity code typically only touches the free functions in [context], such as
//! [record_heartbeat], while the worker drives each attempt with an [ActivityAttempt].

#[macro_use]
extern crate tracing;

mod abstractions;
mod app_data;
mod attempt;
mod cancel;
mod classify;
pub mod context;
mod errors;
mod invoker;
mod options;
mod payload;
mod shutdown;
mod task_token;
mod telemetry;
pub mod transport;

pub use app_data::AppData;
pub use attempt::ActivityAttempt;
pub use cancel::CancellationBridge;
pub use classify::{ActivityCancelReason, HeartbeatErrorClassifier, HeartbeatOutcome};
pub use context::{
    activity_info, has_activity_info, has_heartbeat_details, heartbeat_details, record_heartbeat,
    record_heartbeat_json, worker_stop_signal, ActivityEnvironment, ActivityInfo,
    ExecutionContext,
};
pub use errors::{ActivityContextError, InvokerInitError, PayloadError, RecordHeartbeatError};
pub use invoker::{HeartbeatInvoker, InvokerStatus};
pub use options::{
    throttle_interval_for, FeatureFlags, HeartbeatInvokerOptions, HeartbeatInvokerOptionsBuilder,
    HeartbeatInvokerOptionsBuilderError,
};
pub use payload::{
    AsJsonPayloadExt, FromJsonPayloadExt, IntoPayloadsExt, Payload, Payloads,
    ENCODING_PAYLOAD_KEY, JSON_ENCODING_VAL,
};
pub use shutdown::ShutdownSignal;
pub use task_token::TaskToken;
pub use telemetry::telemetry_init;
pub use transport::{HeartbeatRequest, HeartbeatResponse, HeartbeatTransport};
