//! Cancellable background loops

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A periodic task owned by a component.
///
/// Dropping the handle cancels the loop; [`BackgroundTask::stop`] cancels and
/// waits for the loop to exit.
pub struct BackgroundTask {
    name: &'static str,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `tick` every `period` until cancelled or until `tick` returns `false`.
    ///
    /// The first run happens one full period after spawning.
    pub fn spawn_periodic<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        if !tick() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "Background task exited");
        });

        debug!(task = name, ?period, "Background task started");

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// Task name, for logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Check whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, "Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
