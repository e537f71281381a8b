use crate::abstractions::take_cell::TakeCell;
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// The one path by which a heartbeat invoker tells the activity it must stop. Wraps a callback
/// that runs at most once no matter how many clones of the bridge call [Self::cancel], or from
/// which threads.
#[derive(Clone)]
pub struct CancellationBridge {
    callback: Arc<TakeCell<CancelFn>>,
}

impl CancellationBridge {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Arc::new(TakeCell::new(Box::new(callback))),
        }
    }

    /// Invokes the callback if nobody has yet. Returns true if this call was the one that did.
    pub fn cancel(&self) -> bool {
        match self.callback.take_once() {
            Some(cb) => {
                cb();
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.callback.is_taken()
    }
}

impl From<CancellationToken> for CancellationBridge {
    fn from(token: CancellationToken) -> Self {
        Self::new(move || token.cancel())
    }
}

impl Debug for CancellationBridge {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationBridge")
            .field("has_fired", &self.has_fired())
            .finish()
    }
}
