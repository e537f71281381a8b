use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Starts out holding a value which may be taken out exactly once, from any thread. Every later
/// attempt observes `None`.
pub(crate) struct TakeCell<T> {
    taken: AtomicBool,
    data: Mutex<Option<T>>,
}

impl<T> TakeCell<T> {
    pub(crate) fn new(val: T) -> Self {
        Self {
            taken: AtomicBool::new(false),
            data: Mutex::new(Some(val)),
        }
    }

    /// If the cell has not already been taken from, takes the value and returns it
    pub(crate) fn take_once(&self) -> Option<T> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.data.lock().take()
    }

    pub(crate) fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}
