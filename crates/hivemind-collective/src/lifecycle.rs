//! Shutdown coordination shared by loops, proposals and aggregation passes.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Cancellation token plus a tracker of in-flight work.
///
/// Periodic loops watch `token`; proposals and aggregation passes are
/// wrapped with [`Lifecycle::track`] so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lifecycle cancelled together with this one but closable on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled() || self.tracker.is_closed()
    }

    /// Wrap in-flight work so [`Lifecycle::shutdown`] waits for it.
    pub fn track<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        self.tracker.track_future(future)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting work, wait for in-flight work up to `grace`, then
    /// cancel. Returns `true` when everything drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();

        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if drained {
            info!("In-flight work drained");
        } else {
            warn!(
                in_flight = self.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, force-cancelling in-flight work"
            );
        }

        self.token.cancel();
        drained
    }
}
