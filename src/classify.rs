//! Turns the result of a transport call into something the invoker can act on.

use crate::transport::HeartbeatResponse;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use tonic::Code;

/// Why the orchestrator told us to abandon an activity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityCancelReason {
    /// The server responded with `cancel_requested`
    Cancelled,
    /// The activity task is no longer known to the server. Usually its workflow already finished.
    NotFound,
    /// Some other error code that was configured as terminal
    Terminal(Code),
}

impl Display for ActivityCancelReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancel requested"),
            Self::NotFound => f.write_str("activity not found"),
            Self::Terminal(c) => write!(f, "terminal error ({:?})", c),
        }
    }
}

/// Classified result of one heartbeat round trip
#[derive(Debug)]
pub enum HeartbeatOutcome {
    /// Heartbeat recorded, keep going
    Recorded,
    /// The activity must stop. Heartbeating ceases and the cancellation bridge fires.
    Terminal(ActivityCancelReason),
    /// Something went wrong that a later heartbeat might not hit. Logged and otherwise ignored.
    Transient(tonic::Status),
}

impl HeartbeatOutcome {
    pub fn cancel_reason(&self) -> Option<ActivityCancelReason> {
        match self {
            Self::Terminal(r) => Some(*r),
            _ => None,
        }
    }
}

/// Decides which transport errors mean the activity should be abandoned. A response with
/// `cancel_requested` set is always terminal. By default the only terminal error is
/// [Code::NotFound].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatErrorClassifier {
    #[serde(with = "codes_serde")]
    terminal_codes: Vec<Code>,
}

impl Default for HeartbeatErrorClassifier {
    fn default() -> Self {
        Self {
            terminal_codes: vec![Code::NotFound],
        }
    }
}

impl HeartbeatErrorClassifier {
    /// A classifier that treats every error as transient. Only explicit cancel requests stop the
    /// activity.
    pub fn cancel_requested_only() -> Self {
        Self {
            terminal_codes: vec![],
        }
    }

    /// Additionally treat `code` as terminal
    pub fn with_terminal_code(mut self, code: Code) -> Self {
        if !self.terminal_codes.contains(&code) {
            self.terminal_codes.push(code);
        }
        self
    }

    pub fn is_terminal(&self, code: Code) -> bool {
        self.terminal_codes.contains(&code)
    }

    pub fn classify(
        &self,
        result: Result<HeartbeatResponse, tonic::Status>,
    ) -> HeartbeatOutcome {
        match result {
            Ok(HeartbeatResponse { cancel_requested }) => {
                if cancel_requested {
                    HeartbeatOutcome::Terminal(ActivityCancelReason::Cancelled)
                } else {
                    HeartbeatOutcome::Recorded
                }
            }
            Err(s) if self.is_terminal(s.code()) => {
                HeartbeatOutcome::Terminal(if s.code() == Code::NotFound {
                    ActivityCancelReason::NotFound
                } else {
                    ActivityCancelReason::Terminal(s.code())
                })
            }
            Err(s) => HeartbeatOutcome::Transient(s),
        }
    }
}

mod codes_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tonic::Code;

    pub(super) fn serialize<S: Serializer>(codes: &[Code], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(codes.iter().map(|c| *c as i32))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Code>, D::Error> {
        Ok(Vec::<i32>::deserialize(d)?
            .into_iter()
            .map(Code::from_i32)
            .collect())
    }
}
