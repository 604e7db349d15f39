use color_eyre::eyre::Result;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Owns every background task the bot spawns.
///
/// Failures of supervised tasks all end up in [`TaskSupervisor::report`],
/// and `shutdown` cancels and then waits for everything that was spawned.
#[derive(Clone, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    token: CancellationToken,
    failures: Arc<AtomicU64>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn report(&self, task: &str, error: &color_eyre::eyre::Error) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(task, "background task failed: {:?}", error);
    }

    /// Runs `future` to completion. The future is responsible for watching
    /// [`TaskSupervisor::token`] if it has cleanup to do on shutdown.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let supervisor = self.clone();

        self.tracker.spawn(async move {
            if let Err(e) = future.await {
                supervisor.report(name, &e);
            }
        });
    }

    /// Like [`TaskSupervisor::spawn`], but the future is dropped as soon as
    /// shutdown starts.
    pub fn spawn_cancellable<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.token.clone();

        self.spawn(name, async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("{name} cancelled");
                    Ok(())
                }
                result = future => result,
            }
        });
    }

    /// Runs `job` every `period`, starting one period from now.
    ///
    /// Each run is awaited before the next tick is taken and missed ticks are
    /// skipped, so runs never overlap. A failed run is reported and the loop
    /// carries on.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let supervisor = self.clone();

        self.spawn_cancellable(name, async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(ticks);

            while ticks.next().await.is_some() {
                if let Err(e) = job().await {
                    supervisor.report(name, &e);
                }
            }

            Ok(())
        });
    }

    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("All background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn periodic_runs_never_overlap() {
        let tasks = TaskSupervisor::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        {
            let (running, max_running, runs) =
                (running.clone(), max_running.clone(), runs.clone());
            tasks.spawn_periodic("slow job", Duration::from_secs(10), move || {
                let (running, max_running, runs) =
                    (running.clone(), max_running.clone(), runs.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_secs(25)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        sleep(Duration::from_secs(100)).await;
        tasks.shutdown().await;

        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_shutdown_stops_loops() {
        let tasks = TaskSupervisor::new();
        let runs = Arc::new(AtomicUsize::new(0));

        {
            let runs = runs.clone();
            tasks.spawn_periodic("failing job", Duration::from_secs(1), move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err(eyre!("nope"))
                }
            });
        }
        tasks.spawn("one shot", async { Err(eyre!("also nope")) });

        sleep(Duration::from_millis(3500)).await;
        tasks.shutdown().await;

        let after_shutdown = runs.load(Ordering::SeqCst);
        assert_eq!(after_shutdown, 3);
        assert_eq!(tasks.failures(), 4);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }
}
