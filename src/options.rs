use crate::{classify::HeartbeatErrorClassifier, task_token::TaskToken};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defines per-attempt configuration options for a [crate::HeartbeatInvoker]
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(setter(into), build_fn(validate = "Self::validate"), derive(Debug))]
#[non_exhaustive]
pub struct HeartbeatInvokerOptions {
    /// Token identifying the activity attempt to the server
    pub task_token: TaskToken,
    /// Identity of the worker, attached to every heartbeat
    pub identity: String,
    /// Type name of the workflow which scheduled the activity. Used for observability only.
    pub workflow_type: String,
    /// Type name of the activity being heartbeated. Used for observability only.
    pub activity_type: String,
    /// Minimum spacing targeted between heartbeat calls to the server. Zero disables time-based
    /// spacing, but heartbeats recorded while a call is outstanding are still coalesced.
    #[builder(default)]
    pub throttle_interval: Duration,
    /// Upper bound on the final flush performed by `close(true)`. A flush taking longer is
    /// abandoned.
    #[builder(default = "Duration::from_secs(10)")]
    pub flush_timeout: Duration,
    /// Passed through untouched
    #[builder(default)]
    pub feature_flags: FeatureFlags,
    /// Decides which server errors end the activity
    #[builder(default)]
    pub error_classifier: HeartbeatErrorClassifier,
    /// Span all of the invoker's events are emitted within. If unset, one is created carrying the
    /// task token, identity, and type names.
    #[builder(default)]
    pub span: Option<tracing::Span>,
}

impl HeartbeatInvokerOptions {
    pub fn builder() -> HeartbeatInvokerOptionsBuilder {
        HeartbeatInvokerOptionsBuilder::default()
    }

    pub(crate) fn make_span(&self) -> tracing::Span {
        self.span.clone().unwrap_or_else(|| {
            info_span!(
                "activity_heartbeat",
                task_token = %self.task_token,
                identity = %self.identity,
                workflow_type = %self.workflow_type,
                activity_type = %self.activity_type,
            )
        })
    }
}

impl HeartbeatInvokerOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.flush_timeout == Some(Duration::ZERO) {
            return Err("`flush_timeout` must be nonzero".to_owned());
        }
        if let Some(ref tt) = self.task_token {
            if tt.as_bytes().is_empty() {
                return Err("`task_token` must not be empty".to_owned());
            }
        }
        Ok(())
    }
}

/// Feature toggles handed down from the worker. The invoker carries them without acting on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub workflow_execution_already_completed_error_enabled: bool,
    pub poller_auto_scaler_enabled: bool,
}

/// Picks how often an activity with the given heartbeat timeout should actually reach the server.
///
/// Heartbeats are sent at 80% of the timeout, never less often than `max`. An unset or zero
/// timeout uses `default` since a zero interval would hammer the server.
pub fn throttle_interval_for(
    heartbeat_timeout: Option<Duration>,
    default: Duration,
    max: Duration,
) -> Duration {
    let throttle_interval = match heartbeat_timeout {
        Some(t) if !t.is_zero() => t.mul_f64(0.8),
        _ => default,
    };
    std::cmp::min(throttle_interval, max)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn builds_with_defaults() {
        let opts = HeartbeatInvokerOptions::builder()
            .task_token(b"task-token".to_vec())
            .identity("identity")
            .workflow_type("test-workflow-type")
            .activity_type("test-activity-type")
            .build()
            .unwrap();
        assert_eq!(opts.throttle_interval, Duration::ZERO);
        assert_eq!(opts.flush_timeout, Duration::from_secs(10));
        assert_eq!(opts.feature_flags, FeatureFlags::default());
        assert_eq!(opts.error_classifier, HeartbeatErrorClassifier::default());
    }

    #[test]
    fn missing_identity_fails() {
        let res = HeartbeatInvokerOptions::builder()
            .task_token(b"task-token".to_vec())
            .workflow_type("wf")
            .activity_type("act")
            .build();
        assert_matches!(res, Err(HeartbeatInvokerOptionsBuilderError::UninitializedField(f)) if f == "identity");
    }

    #[test]
    fn zero_flush_timeout_rejected() {
        let res = HeartbeatInvokerOptions::builder()
            .task_token(b"task-token".to_vec())
            .identity("identity")
            .workflow_type("wf")
            .activity_type("act")
            .flush_timeout(Duration::ZERO)
            .build();
        assert_matches!(res, Err(HeartbeatInvokerOptionsBuilderError::ValidationError(_)));
    }

    #[test]
    fn feature_flags_deserialize_partially() {
        let flags: FeatureFlags =
            serde_json::from_str(r#"{"poller_auto_scaler_enabled": true}"#).unwrap();
        assert!(flags.poller_auto_scaler_enabled);
        assert!(!flags.workflow_execution_already_completed_error_enabled);
    }

    #[test]
    fn throttle_interval_derivation() {
        let default = Duration::from_secs(30);
        let max = Duration::from_secs(60);
        assert_eq!(
            throttle_interval_for(Some(Duration::from_secs(10)), default, max),
            Duration::from_secs(8)
        );
        assert_eq!(throttle_interval_for(None, default, max), default);
        assert_eq!(throttle_interval_for(Some(Duration::ZERO), default, max), default);
        assert_eq!(
            throttle_interval_for(Some(Duration::from_secs(600)), default, max),
            max
        );
    }
}
