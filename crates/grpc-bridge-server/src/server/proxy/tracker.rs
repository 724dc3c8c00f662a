use crate::server::telemetry::{decrement_calls_inflight, increment_calls_inflight};
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout};

/// Counts in-flight calls and refuses new ones once shutdown has started.
#[derive(Debug, Default)]
pub struct CallTracker {
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
}

impl CallTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a call. Returns `None` once shutdown has begun.
    pub fn enter(self: &Arc<Self>) -> Option<CallGuard> {
        if self.shutting_down.load(Ordering::Acquire) {
            return None;
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        increment_calls_inflight();
        Some(CallGuard(Arc::clone(self)))
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stops accepting calls and waits up to `limit` for in-flight calls to
    /// finish. Returns `true` if everything drained in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        self.shutting_down.store(true, Ordering::Release);

        timeout(limit, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Marks one in-flight call; released on drop, including when the call's
/// future is cancelled.
#[derive(Debug)]
pub struct CallGuard(Arc<CallTracker>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_calls_inflight();
    }
}
