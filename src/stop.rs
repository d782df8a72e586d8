//! Cooperative stop signal for the long-running components.
//!
//! The flag is checked at loop and cycle boundaries only; an in-flight
//! network call is always allowed to complete before the owning loop observes
//! the request. There is no hard cancellation of in-flight requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct StopFlag {
    stopped: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
