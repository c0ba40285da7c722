//! Cancellable periodic background tasks.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use idrs_core::RngSource;

/// `period` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
pub fn jittered(period: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    if jitter <= 0.0 || period.is_zero() {
        return period;
    }
    let jitter = jitter.min(0.99);
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    period.mul_f64(factor)
}

/// Owns the engine's background loops. Every loop watches the same
/// cancellation token; [`BackgroundTasks::shutdown`] cancels and awaits them.
pub struct BackgroundTasks {
    token: CancellationToken,
    tasks: JoinSet<()>,
    rng: Arc<dyn RngSource>,
}

impl BackgroundTasks {
    /// Jitter for every periodic loop is drawn from `rng`.
    pub fn new(rng: Arc<dyn RngSource>) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            rng,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn rng(&self) -> &Arc<dyn RngSource> {
        &self.rng
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a future that is expected to watch [`BackgroundTasks::token`].
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Run `tick` every `period` (± jitter) until cancelled. The first run
    /// happens after one period.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        jitter: f64,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let mut rng = self.rng.for_selection();
        self.tasks.spawn(async move {
            debug!(task = name, period_ms = period.as_millis() as u64, "Background task started");
            loop {
                let delay = jittered(period, jitter, &mut rng);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => tick().await,
                }
            }
            debug!(task = name, "Background task stopped");
        });
    }

    /// Cancel every task and wait up to `timeout` for them to finish.
    /// Returns `false` if some had to be aborted.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        self.token.cancel();
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!("Background task join error: {}", e);
                }
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(remaining = self.tasks.len(), "Background tasks did not stop in time, aborting");
            self.tasks.abort_all();
        }
        drained
    }
}
