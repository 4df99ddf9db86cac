//! Scheduler - Cancellable Background Tasks
//!
//! Repeating ticks (detection poll, eviction, prune sweep) and one-shot
//! delayed jobs (clip materialization) run on tokio timers, so tests drive
//! them with a paused clock instead of sleeping.
//!
//! Repeating tasks are tied to a cancellation token; cancelling a camera's
//! token stops every tick it owns. Delayed jobs are detached and always
//! run to completion.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handle to a repeating task
pub struct ScheduledTask {
    name: String,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Wait for the task to exit
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(task = %self.name, error = %e, "Scheduled task ended abnormally");
        }
    }
}

/// Run `tick` every `period` until `parent` is cancelled.
///
/// The first tick fires immediately. Ticks never overlap; a slow tick delays
/// the next one instead of bursting.
pub fn spawn_repeating<F, Fut>(
    name: impl Into<String>,
    period: Duration,
    parent: &CancellationToken,
    mut tick: F,
) -> ScheduledTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let task_token = parent.child_token();
    let task_name = name.clone();

    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(task = %task_name, period_ms = period.as_millis() as u64, "Scheduled task started");

        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }

        tracing::debug!(task = %task_name, "Scheduled task stopped");
    });

    ScheduledTask { name, handle }
}

/// Run `job` once after `delay`, detached from any cancellation.
pub fn spawn_delayed<Fut>(name: impl Into<String>, delay: Duration, job: Fut) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tracing::trace!(task = %name, "Delayed task running");
        job.await;
    })
}
