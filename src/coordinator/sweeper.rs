//! Barrier deadline sweep.
//!
//! A sweep is safe to run from any number of processes at once: each
//! expired barrier is claimed with the same single-winner flip a
//! completing worker uses, so at most one sweeper (or worker) resumes it.
//!
//! The sweep also recovers resumes whose claimant died after winning the
//! flip. A barrier left in `resuming` longer than the grace period is
//! reclaimed by one sweeper and resumed; the run's own `waiting` guard
//! keeps that resume from applying twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{CoordResult, Coordinator, RunProgress};

/// One barrier the sweep resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub barrier_id: i64,
    pub run_id: i64,
    /// Jobs marked `timeout` by this sweep.
    pub timed_out: u32,
    /// The barrier had stalled in `resuming` and was taken over.
    pub reclaimed: bool,
    /// `None` when the resume itself failed; the error is logged and the
    /// run is marked failed where that applies.
    pub progress: Option<RunProgress>,
}

impl Coordinator {
    /// Time out every waiting barrier whose deadline has passed, then take
    /// over stalled resumes. Each resolved barrier resumes its run.
    pub async fn sweep_timeouts(&self) -> CoordResult<Vec<SweepOutcome>> {
        let mut outcomes = Vec::new();

        let expired = self
            .store
            .call(|store| store.barriers().expire_due(store.now()))
            .await?;
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Found expired barriers");
        }
        for barrier_id in expired {
            let claimed = self
                .store
                .call(move |store| store.barriers().claim_timed_out(barrier_id))
                .await?;
            // Lost to a completing worker or another sweeper.
            let Some(timed_out) = claimed else {
                continue;
            };
            let progress = self.resume_swept(barrier_id, timed_out.run_id).await;
            outcomes.push(SweepOutcome {
                barrier_id,
                run_id: timed_out.run_id,
                timed_out: timed_out.timed_out,
                reclaimed: false,
                progress,
            });
        }

        let grace = self.settings.resume_grace;
        let stalled = self
            .store
            .call(move |store| store.barriers().stalled_resumes(store.now() - grace))
            .await?;
        for barrier_id in stalled {
            let reclaimed = self
                .store
                .call(move |store| store.barriers().reclaim_resume(barrier_id, store.now() - grace))
                .await?;
            let Some(run_id) = reclaimed else {
                continue;
            };
            let progress = self.resume_swept(barrier_id, run_id).await;
            outcomes.push(SweepOutcome {
                barrier_id,
                run_id,
                timed_out: 0,
                reclaimed: true,
                progress,
            });
        }
        Ok(outcomes)
    }

    async fn resume_swept(&self, barrier_id: i64, run_id: i64) -> Option<RunProgress> {
        match self.resume(barrier_id, run_id).await {
            Ok(progress) => Some(progress),
            Err(e) => {
                tracing::error!(barrier_id, run_id, error = %e, "Resume from sweep failed");
                None
            }
        }
    }
}

/// Run [`Coordinator::sweep_timeouts`] every `interval` until `shutdown`
/// flips to `true`.
pub fn spawn_sweeper(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Barrier sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match coordinator.sweep_timeouts().await {
                        Ok(outcomes) if !outcomes.is_empty() => {
                            tracing::info!(resolved = outcomes.len(), "Barrier sweep resolved timeouts");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Barrier sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Barrier sweeper stopped");
    })
}
