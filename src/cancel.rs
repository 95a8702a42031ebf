use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag that stops polling and downloading at the next checkpoint.
///
/// Clones observe the same flag, so one handle can be given to another thread
/// (a signal handler, a UI) while the retrieval runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
