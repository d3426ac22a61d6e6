//! Background reconciliation loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::reconcile::Reconciler;
use crate::task::{StoreError, Task};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pending: usize,
    pub finished: usize,
}

pub struct Sweeper {
    reconciler: Reconciler,
    concurrency: usize,
}

impl Sweeper {
    pub fn new(reconciler: Reconciler, concurrency: usize) -> Self {
        Self {
            reconciler,
            concurrency: concurrency.max(1),
        }
    }

    /// Reconcile every unfinished task once.
    ///
    /// Channels are resolved once per sweep; a missing or disabled channel
    /// fails all of its tasks without polling.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let pending = self.reconciler.tasks().list_unfinished()?;
        if pending.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut by_channel: BTreeMap<i64, Vec<Task>> = BTreeMap::new();
        for task in pending {
            by_channel.entry(task.channel_id).or_default().push(task);
        }

        let mut jobs = Vec::new();
        for (channel_id, tasks) in by_channel {
            let channel = self.reconciler.channels().get(channel_id)?;
            if !channel.as_ref().is_some_and(|c| c.is_enabled()) {
                tracing::warn!(
                    "Channel {} is unavailable, failing {} pending task(s)",
                    channel_id,
                    tasks.len()
                );
            }
            let channel = channel.map(Arc::new);
            jobs.extend(tasks.into_iter().map(|task| (task, channel.clone())));
        }

        let total = jobs.len();
        tracing::debug!("Sweeping {} pending task(s)", total);

        let finished = stream::iter(jobs)
            .map(|(task, channel)| async move {
                let task_id = task.task_id.clone();
                match self.reconciler.reconcile_task(task, channel.as_deref()).await {
                    Ok(task) => task.status.is_terminal(),
                    Err(e) => {
                        tracing::error!("Failed to reconcile task {}: {}", task_id, e);
                        false
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|done| futures::future::ready(*done))
            .count()
            .await;

        Ok(SweepReport {
            pending: total - finished,
            finished,
        })
    }

    /// Run `sweep` every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(
                "Task sweeper started (interval {:?}, concurrency {})",
                interval,
                self.concurrency
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Task sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) if report.finished > 0 => tracing::info!(
                                "Sweep finished {} task(s), {} still pending",
                                report.finished,
                                report.pending
                            ),
                            Ok(_) => {}
                            Err(e) => tracing::error!("Task sweep failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
