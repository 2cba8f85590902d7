use std::time::Duration;

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::ScheduleConfig, manager::TokenManager};

/// Background task refreshing the shared tokens on two fixed cadences.
///
/// Both cadences force a full [`TokenManager::refresh_tokens`]; the first run happens one
/// period after spawning. Failures are logged and the next tick tries again.
///
/// The task stops when `cancel` fires, on [`RefreshScheduler::shutdown`], or when the
/// scheduler is dropped.
#[derive(Debug)]
pub struct RefreshScheduler {
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    /// Spawn the refresh task on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    #[must_use]
    pub fn spawn(manager: TokenManager, schedule: ScheduleConfig, cancel: CancellationToken) -> Self {
        let cancel = cancel.child_token();
        tracing::debug!(
            "Starting token refresh task. Access token cadence {}s, refresh token cadence {}s.",
            schedule.access_token_interval_secs,
            schedule.refresh_token_interval_secs
        );
        let task = tokio::spawn(run(manager, schedule, cancel.clone()));
        Self {
            task: Some(task),
            cancel,
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the task and wait for it to finish. A refresh in flight is abandoned.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Token refresh task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(manager: TokenManager, schedule: ScheduleConfig, cancel: CancellationToken) {
    let mut access_token_ticks = ticks(schedule.access_token_interval());
    let mut refresh_token_ticks = ticks(schedule.refresh_token_interval());

    loop {
        let cadence = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = access_token_ticks.tick() => "access token",
            _ = refresh_token_ticks.tick() => "refresh token",
        };

        tracing::debug!("Running scheduled {cadence} refresh");
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = manager.refresh_tokens() => match result {
                Ok(()) => tracing::debug!("Scheduled {cadence} refresh finished"),
                Err(e) => tracing::error!("Scheduled {cadence} refresh failed: {e}"),
            },
        }
    }
    tracing::debug!("Token refresh task stopped");
}

fn ticks(period: Duration) -> Interval {
    // `interval_at` panics on a zero period.
    let period = period.max(Duration::from_secs(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        store::MemoryTokenStore,
        testing::{manager, record, ScriptedProvider},
    };

    fn schedule() -> ScheduleConfig {
        ScheduleConfig::builder()
            .access_token_interval_secs(600)
            .refresh_token_interval_secs(5 * 86_400)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_on_each_tick() {
        let store = MemoryTokenStore::new();
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_create(Ok(record("A1", "R1")));
        provider.push_refresh(Ok(record("A2", "R2")));
        let manager = manager(&store, &provider).await;

        let scheduler =
            RefreshScheduler::spawn(manager.clone(), schedule(), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert_eq!(provider.create_calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(provider.create_calls(), 1);
        assert_eq!(manager.access_token().await.unwrap(), "A1");

        // The second run exchanges the refresh token stored by the first.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(provider.refresh_calls(), 1);
        assert_eq!(manager.access_token().await.unwrap(), "A2");

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failures_are_logged_and_task_keeps_running() {
        let store = MemoryTokenStore::new();
        let provider = Arc::new(ScriptedProvider::new());
        let scheduler = RefreshScheduler::spawn(
            manager(&store, &provider).await,
            schedule(),
            CancellationToken::new(),
        );

        tokio::time::sleep(Duration::from_secs(610)).await;
        assert!(logs_contain("Scheduled access token refresh failed"));
        assert!(!scheduler.is_finished());
        assert_eq!(provider.create_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_task() {
        let store = MemoryTokenStore::new();
        let provider = Arc::new(ScriptedProvider::new());
        let cancel = CancellationToken::new();
        let scheduler =
            RefreshScheduler::spawn(manager(&store, &provider).await, schedule(), cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(1200)).await;

        assert!(scheduler.is_finished());
        assert_eq!(provider.create_calls(), 0);
    }
}
