use std::fmt::{Debug, Formatter};
use tokio_util::sync::CancellationToken;

/// Signals that the hosting worker is stopping. Produced once per worker and shared (by cloning)
/// with every heartbeat invoker it creates. Only the owner should call [Self::close]; invokers only
/// ever observe it. Once closed it stays closed.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has been closed. Resolves immediately if it already is.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

impl From<CancellationToken> for ShutdownSignal {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Debug for ShutdownSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("closed", &self.is_closed())
            .finish()
    }
}
