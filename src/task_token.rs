use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt::{Debug, Display, Formatter};

/// Opaque token the orchestrator issued for one activity attempt. Attached to every heartbeat so
/// the server can correlate it with the running attempt.
#[derive(Hash, Eq, PartialEq, Clone, Default, derive_more::From)]
pub struct TaskToken(pub Vec<u8>);

impl TaskToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for TaskToken {
    fn from(tt: &[u8]) -> Self {
        Self(tt.to_vec())
    }
}

impl From<&str> for TaskToken {
    fn from(tt: &str) -> Self {
        Self(tt.as_bytes().to_vec())
    }
}

impl Display for TaskToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&fmt_tt(&self.0))
    }
}

impl Debug for TaskToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("TaskToken({})", fmt_tt(&self.0)))
    }
}

pub fn fmt_tt(tt: &[u8]) -> String {
    STANDARD.encode(tt)
}
