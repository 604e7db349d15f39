use crate::tasks::TaskSupervisor;
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// State that lives on its own task, see [`Confined`].
pub trait Owned: Send + 'static {
    /// How often [`Owned::tick`] runs on the owning task.
    fn tick_period(&self) -> Option<Duration> {
        None
    }

    fn tick(&mut self) {}

    /// Last call before the owning task exits.
    fn shutdown(&mut self) {
        self.tick();
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("the {0} task has shut down")]
pub struct StateClosed(pub &'static str);

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A handle to state owned by a single task.
///
/// Every read or mutation is shipped to the owning task as a closure and runs
/// there to completion, one at a time, so nothing else ever observes a
/// half-applied update. The owner also runs the state's periodic tick between
/// requests.
pub struct Confined<S> {
    name: &'static str,
    tx: mpsc::Sender<Job<S>>,
}

impl<S> Clone for Confined<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<S: Owned> Confined<S> {
    pub fn spawn(name: &'static str, state: S, tasks: &TaskSupervisor) -> Self {
        let (tx, rx) = mpsc::channel(256);

        tasks.spawn(name, run(state, rx, tasks.token()));

        Self { name, tx }
    }

    pub async fn call<R>(
        &self,
        request: impl FnOnce(&mut S) -> R + Send + 'static,
    ) -> Result<R, StateClosed>
    where
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Box::new(move |state| {
                // the caller may have given up waiting
                reply_tx.send(request(state)).ok();
            }))
            .await
            .map_err(|_| StateClosed(self.name))?;

        reply_rx.await.map_err(|_| StateClosed(self.name))
    }
}

async fn run<S: Owned>(
    mut state: S,
    mut rx: mpsc::Receiver<Job<S>>,
    token: CancellationToken,
) -> color_eyre::eyre::Result<()> {
    let mut ticks = state.tick_period().map(|period| {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticks
    });

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job(&mut state),
                None => break,
            },
            _ = next_tick(&mut ticks) => state.tick(),
        }
    }

    state.shutdown();

    Ok(())
}

async fn next_tick(ticks: &mut Option<Interval>) {
    match ticks {
        Some(ticks) => {
            ticks.tick().await;
        }
        None => std::future::pending().await,
    }
}
