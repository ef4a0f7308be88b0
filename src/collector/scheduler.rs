use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::FutureExt;
use log::{error, info};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use crate::collector::orchestrator::{Bootstrap, CollectionOrchestrator};
use crate::metrics::METRICS;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: usize,
    pub failed_cycles: usize,
}

/// Runs a collection cycle immediately, then once per interval.
///
/// LOOP GUARANTEES:
/// - A failing or panicking cycle is logged; the next one still runs
/// - Cycles never overlap (the wait starts after a cycle ends)
/// - Cancellation stops the wait at once; an in-flight cycle winds
///   down through the shared token
pub struct Scheduler {
    orchestrator: Arc<CollectionOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<CollectionOrchestrator>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            cancel,
        }
    }

    pub async fn run(&self, boot: &Bootstrap) -> SchedulerStats {
        // a broken bootstrap still leaves whatever the store already tracks
        if let Err(e) = self.orchestrator.bootstrap(boot).await {
            error!("bootstrap failed, continuing with the stored set: {:#}", e);
        }

        let mut stats = SchedulerStats::default();

        while !self.cancel.is_cancelled() {
            let outcome = AssertUnwindSafe(self.orchestrator.run_cycle())
                .catch_unwind()
                .await;
            stats.cycles += 1;

            match outcome {
                Ok(Ok(_)) => {
                    METRICS.cycles_completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    stats.failed_cycles += 1;
                    METRICS.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    error!("collection cycle failed: {:#}", e);
                }
                Err(panic) => {
                    stats.failed_cycles += 1;
                    METRICS.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    error!("collection cycle panicked: {}", panic_message(&*panic));
                }
            }

            info!("next collection cycle in {:?}", self.interval);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!(
            "scheduler stopped after {} cycles ({} failed)",
            stats.cycles, stats.failed_cycles
        );
        stats
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
