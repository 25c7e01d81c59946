use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation flag shared between the thread driving an `EventLoop` and
/// whoever decides it is time to stop.
///
/// Clones observe the same flag. Pass one to every worker explicitly.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag {
    triggered: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}
