//! Queue-driven worker pool.
//!
//! Each slot loops: claim the next entry of a registered job type, run its
//! handler while a heartbeat keeps the lease alive, then settle the entry.
//! Settling always starts with an ownership check; a slot that lost its
//! lease abandons the entry without reporting anything.
//!
//! Job types come in two kinds:
//! - **barrier jobs** (`JobDefinition::barrier`): the payload is a
//!   [`WorkerTask`]; the handler's outcome is reported to the run's
//!   barrier through a [`CompletionSink`].
//! - **plain jobs** (`JobDefinition::plain`): the handler does all the
//!   work itself, e.g. [`SupervisorJob`] starting a queued run.

pub mod client;
pub mod command;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordinator::{CompletionReport, Coordinator, RunProgress};
use crate::errors::WorkerError;
use crate::store::{QueueEntry, QueueStatus, StoreHandle, WorkerOutcome, WorkerTask};

pub use client::CallbackClient;
pub use command::CommandJob;

// ── Retry policy ──────────────────────────────────────────────────────

/// Exponential backoff with a cap, attached per job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total runs allowed, counting the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure on attempt number `attempts` gets another run.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// `base_delay * 2^(attempts-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ── Job definitions ───────────────────────────────────────────────────

/// What a handler sees about the entry it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub entry_id: i64,
    pub job_type: String,
    pub attempts: u32,
    pub owner: String,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one entry. The returned text is the result summary reported to
    /// the barrier for barrier jobs; plain jobs usually return `None`.
    async fn run(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<Option<String>>;
}

#[derive(Clone)]
pub struct JobDefinition {
    pub job_type: String,
    pub handler: Arc<dyn JobHandler>,
    pub retry: RetryPolicy,
    reports_to_barrier: bool,
}

impl JobDefinition {
    /// A job whose payload is a `WorkerTask` and whose outcome feeds a barrier.
    pub fn barrier(
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
            retry,
            reports_to_barrier: true,
        }
    }

    pub fn plain(
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
            retry,
            reports_to_barrier: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    definitions: HashMap<String, JobDefinition>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any earlier one for the same type.
    pub fn register(&mut self, definition: JobDefinition) -> &mut Self {
        self.definitions
            .insert(definition.job_type.clone(), definition);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<&JobDefinition> {
        self.definitions.get(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

// ── Completion sinks ──────────────────────────────────────────────────

/// Where barrier jobs send their outcome.
///
/// In-process: the coordinator itself. Remote: [`CallbackClient`].
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn report(&self, report: CompletionReport) -> Result<()>;
}

#[async_trait]
impl CompletionSink for Coordinator {
    async fn report(&self, report: CompletionReport) -> Result<()> {
        let (run_id, job_id) = (report.run_id, report.job_id);
        match self.report_completion(report).await {
            Ok(ack) => {
                tracing::debug!(run_id, job_id, ?ack, "Reported completion");
                Ok(())
            }
            // The report was recorded; the run has already been failed.
            Err(e) if e.is_fatal_to_run() => {
                tracing::error!(run_id, job_id, error = %e, "Continuation failed after report");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Supervisor start job ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartPayload {
    run_id: i64,
}

/// Starts queued supervisor runs (`supervisor` queue entries).
pub struct SupervisorJob {
    coordinator: Arc<Coordinator>,
}

impl SupervisorJob {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl JobHandler for SupervisorJob {
    async fn run(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<Option<String>> {
        let StartPayload { run_id } = serde_json::from_value(payload.clone()).map_err(|e| {
            WorkerError::InvalidPayload {
                entry_id: ctx.entry_id,
                message: e.to_string(),
            }
        })?;
        match self.coordinator.start_run(run_id).await {
            Ok(progress) => {
                if progress == RunProgress::Skipped {
                    tracing::debug!(run_id, "Run was not queued; start entry ignored");
                }
                Ok(None)
            }
            // The run is already marked failed; retrying the start would skip.
            Err(e) if e.is_fatal_to_run() => {
                tracing::error!(run_id, error = %e, "Supervisor turn failed");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── Pool ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Lease length requested on each heartbeat.
    pub lease_ttl: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(300),
        }
    }
}

/// How one claimed entry was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Done,
    Rescheduled { retry_in: Duration },
    Failed { error: String },
    /// The lease was lost; someone else owns the entry now.
    Abandoned,
}

/// Lease heartbeat for one entry; stops when dropped.
struct Heartbeat(JoinHandle<()>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct WorkerPool {
    store: StoreHandle,
    registry: JobRegistry,
    sink: Option<Arc<dyn CompletionSink>>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        store: StoreHandle,
        registry: JobRegistry,
        sink: Option<Arc<dyn CompletionSink>>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn `concurrency` slots. Each stops after its current entry once
    /// `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|slot| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.slot_loop(slot, shutdown).await })
            })
            .collect()
    }

    async fn slot_loop(&self, slot: usize, mut shutdown: watch::Receiver<bool>) {
        let owner = format!("{}-{}", self.config.worker_id, slot);
        tracing::info!(owner = %owner, types = ?self.registry.job_types(), "Worker slot started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once(&owner).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(owner = %owner, error = %format!("{:#}", e), "Worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(owner = %owner, "Worker slot stopped");
    }

    /// Claim and settle at most one entry as `owner`. `None` when nothing
    /// eligible was queued.
    pub async fn run_once(&self, owner: &str) -> Result<Option<(i64, Settled)>> {
        let types = self.registry.job_types();
        let claim_owner = owner.to_string();
        let entry = self
            .store
            .call(move |store| store.queue().claim_next_job_of_types(&claim_owner, &types))
            .await?;
        let Some(entry) = entry else {
            return Ok(None);
        };
        let id = entry.id;
        let settled = self.process(entry, owner).await?;
        Ok(Some((id, settled)))
    }

    async fn process(&self, entry: QueueEntry, owner: &str) -> Result<Settled> {
        let Some(definition) = self.registry.get(&entry.job_type).cloned() else {
            let error = WorkerError::UnknownJobType(entry.job_type.clone()).to_string();
            return self.fail(&entry, owner, None, error).await;
        };

        let task = if definition.reports_to_barrier {
            match serde_json::from_value::<WorkerTask>(entry.payload.clone()) {
                Ok(task) => Some(task),
                Err(e) => {
                    let error = WorkerError::InvalidPayload {
                        entry_id: entry.id,
                        message: e.to_string(),
                    }
                    .to_string();
                    return self.fail(&entry, owner, None, error).await;
                }
            }
        } else {
            None
        };

        // A claimant that keeps crashing mid-run never gets to the retry check.
        if entry.attempts > definition.retry.max_attempts {
            let error = format!(
                "Gave up after {} attempts",
                definition.retry.max_attempts
            );
            return self.fail(&entry, owner, task.as_ref(), error).await;
        }

        let ctx = JobContext {
            entry_id: entry.id,
            job_type: entry.job_type.clone(),
            attempts: entry.attempts,
            owner: owner.to_string(),
        };
        tracing::debug!(entry_id = entry.id, job_type = %entry.job_type, attempts = entry.attempts, owner, "Running job");

        // Held until the entry is settled: a winning report drives the
        // continuation inline and can outlast one lease.
        let _heartbeat = Heartbeat(self.spawn_heartbeat(entry.id, owner.to_string()));
        let result = definition.handler.run(&ctx, &entry.payload).await;

        if !self.still_owned(entry.id, owner).await? {
            let lost = WorkerError::LeaseLost {
                entry_id: entry.id,
                owner: owner.to_string(),
            };
            tracing::warn!(error = %lost, "Abandoning entry");
            return Ok(Settled::Abandoned);
        }

        match result {
            Ok(summary) => {
                if let Some(task) = &task
                    && let Err(e) = self.report(task, owner, WorkerOutcome::Success { result: summary }).await
                {
                    let error = format!("{:#}", e);
                    tracing::warn!(entry_id = entry.id, error = %error, "Completion report not delivered");
                    return self
                        .retry_or_fail(&entry, owner, &definition, Some(task), error)
                        .await;
                }
                self.complete(&entry, owner).await
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::warn!(entry_id = entry.id, attempts = entry.attempts, error = %error, "Job failed");
                self.retry_or_fail(&entry, owner, &definition, task.as_ref(), error).await
            }
        }
    }

    async fn retry_or_fail(
        &self,
        entry: &QueueEntry,
        owner: &str,
        definition: &JobDefinition,
        task: Option<&WorkerTask>,
        error: String,
    ) -> Result<Settled> {
        if !definition.retry.should_retry(entry.attempts) {
            return self.fail(entry, owner, task, error).await;
        }
        let retry_in = definition.retry.backoff(entry.attempts);
        let delay = chrono::Duration::from_std(retry_in).context("Backoff out of range")?;
        let (id, owner_key) = (entry.id, owner.to_string());
        let rescheduled = self
            .store
            .call(move |store| {
                let retry_at = store.now() + delay;
                store
                    .queue()
                    .reschedule_job(id, retry_at, Some(&error), &owner_key)
            })
            .await?;
        if !rescheduled {
            return Ok(Settled::Abandoned);
        }
        tracing::info!(entry_id = id, retry_in_secs = retry_in.as_secs(), "Rescheduled job");
        Ok(Settled::Rescheduled { retry_in })
    }

    /// Terminal failure. Barrier jobs report the failure first so the
    /// barrier does not wait for a job that will never run again.
    async fn fail(
        &self,
        entry: &QueueEntry,
        owner: &str,
        task: Option<&WorkerTask>,
        error: String,
    ) -> Result<Settled> {
        if let Some(task) = task {
            self.report(
                task,
                owner,
                WorkerOutcome::Failed {
                    error: error.clone(),
                },
            )
            .await?;
        }
        let (id, owner_key, recorded) = (entry.id, owner.to_string(), error.clone());
        let failed = self
            .store
            .call(move |store| store.queue().fail_job(id, &owner_key, &recorded))
            .await?;
        if !failed {
            return Ok(Settled::Abandoned);
        }
        tracing::warn!(entry_id = id, error = %error, "Job failed permanently");
        Ok(Settled::Failed { error })
    }

    async fn complete(&self, entry: &QueueEntry, owner: &str) -> Result<Settled> {
        let (id, owner_key) = (entry.id, owner.to_string());
        let done = self
            .store
            .call(move |store| store.queue().complete_job(id, QueueStatus::Done, &owner_key))
            .await?;
        Ok(if done {
            Settled::Done
        } else {
            Settled::Abandoned
        })
    }

    async fn report(&self, task: &WorkerTask, owner: &str, outcome: WorkerOutcome) -> Result<()> {
        let sink = self
            .sink
            .as_ref()
            .context("Barrier job finished but no completion sink is configured")?;
        sink.report(CompletionReport {
            run_id: task.run_id,
            job_id: task.job_id,
            worker_id: owner.to_string(),
            outcome,
        })
        .await
    }

    /// Ownership check before settling: renew the lease once more.
    async fn still_owned(&self, id: i64, owner: &str) -> Result<bool> {
        let owner = owner.to_string();
        let seconds = self.config.lease_ttl.as_secs() as i64;
        self.store
            .call(move |store| store.queue().extend_lease(id, &owner, seconds))
            .await
    }

    fn spawn_heartbeat(&self, id: i64, owner: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.config.lease_ttl;
        let every = (ttl / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let owner_key = owner.clone();
                let seconds = ttl.as_secs() as i64;
                match store
                    .call(move |store| store.queue().extend_lease(id, &owner_key, seconds))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(entry_id = id, owner = %owner, "Heartbeat found lease lost");
                        break;
                    }
                    Err(e) => tracing::warn!(entry_id = id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::{SpawnRequest, Store};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(64), Duration::from_secs(30));
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
        assert!(!RetryPolicy::once().should_retry(1));
    }

    #[test]
    fn test_registry_lists_sorted_types() {
        struct Noop;
        #[async_trait]
        impl JobHandler for Noop {
            async fn run(&self, _: &JobContext, _: &serde_json::Value) -> Result<Option<String>> {
                Ok(None)
            }
        }
        let mut registry = JobRegistry::new();
        registry
            .register(JobDefinition::plain("zeta", Arc::new(Noop), RetryPolicy::default()))
            .register(JobDefinition::plain("alpha", Arc::new(Noop), RetryPolicy::default()));
        assert_eq!(registry.job_types(), vec!["alpha", "zeta"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("beta").is_none());
    }

    /// Fails the first `failures` runs, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn run(&self, _: &JobContext, _: &serde_json::Value) -> Result<Option<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("flake #{}", call);
            }
            Ok(Some(format!("ok after {}", call)))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<CompletionReport>>,
    }

    #[async_trait]
    impl CompletionSink for CollectingSink {
        async fn report(&self, report: CompletionReport) -> Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn pool_with(
        definition: JobDefinition,
        sink: Option<Arc<dyn CompletionSink>>,
    ) -> Result<(WorkerPool, ManualClock)> {
        let clock = ManualClock::new(Utc::now());
        pool_on(clock, definition, sink, Duration::from_secs(60))
    }

    fn pool_on(
        clock: ManualClock,
        definition: JobDefinition,
        sink: Option<Arc<dyn CompletionSink>>,
        lease_ttl: Duration,
    ) -> Result<(WorkerPool, ManualClock)> {
        let store = Store::open_in_memory()?
            .with_clock(Arc::new(clock.clone()))
            .with_lease_ttl(chrono::Duration::seconds(60));
        let mut registry = JobRegistry::new();
        registry.register(definition);
        let config = WorkerPoolConfig {
            worker_id: "test".into(),
            concurrency: 1,
            poll_interval: Duration::from_millis(10),
            lease_ttl,
        };
        Ok((WorkerPool::new(StoreHandle::new(store), registry, sink, config), clock))
    }

    /// Register a one-job barrier so a `worker` entry exists.
    fn seed_barrier_job(pool: &WorkerPool) -> Result<i64> {
        let store = pool.store.lock_sync()?;
        let run = store.runs().create(&json!(null), "t")?;
        store.runs().start(run.id)?;
        let job = store
            .worker_jobs()
            .create(run.id, &SpawnRequest::new("call", json!({"x": 1})))?;
        store.barriers().register(run.id, &[job.id], None)?;
        Ok(job.id)
    }

    #[tokio::test]
    async fn test_success_reports_then_completes() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, _clock) = pool_with(
            JobDefinition::barrier("worker", handler, RetryPolicy::default()),
            Some(sink.clone()),
        )?;
        let job_id = seed_barrier_job(&pool)?;

        let (entry_id, settled) = pool.run_once("w-0").await?.expect("entry");
        assert_eq!(settled, Settled::Done);
        let reports = sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id, job_id);
        assert_eq!(
            reports[0].outcome,
            WorkerOutcome::Success { result: Some("ok after 1".into()) }
        );
        let entry = pool.store.lock_sync()?.queue().get(entry_id)?.unwrap();
        assert_eq!(entry.status, QueueStatus::Done);
        assert!(pool.run_once("w-0").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_is_rescheduled_then_reported_when_exhausted() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let handler = Arc::new(Flaky { failures: 10, calls: AtomicU32::new(0) });
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        };
        let (pool, clock) = pool_with(
            JobDefinition::barrier("worker", handler, retry),
            Some(sink.clone()),
        )?;
        seed_barrier_job(&pool)?;

        let (entry_id, settled) = pool.run_once("w-0").await?.unwrap();
        assert_eq!(settled, Settled::Rescheduled { retry_in: Duration::from_secs(10) });
        assert!(sink.reports.lock().unwrap().is_empty());
        // Not eligible until the backoff elapses.
        assert!(pool.run_once("w-0").await?.is_none());

        clock.advance(chrono::Duration::seconds(11));
        let (again, settled) = pool.run_once("w-0").await?.unwrap();
        assert_eq!(again, entry_id);
        assert!(matches!(settled, Settled::Failed { ref error } if error.contains("flake #2")));

        let reports = sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, WorkerOutcome::Failed { .. }));
        let entry = pool.store.lock_sync()?.queue().get(entry_id)?.unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_entry_past_max_attempts_fails_without_running() -> Result<()> {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, clock) = pool_with(
            JobDefinition::plain("chore", handler.clone(), RetryPolicy::once()),
            None,
        )?;
        {
            let store = pool.store.lock_sync()?;
            let now = clock.now();
            store.queue().enqueue("chore", &json!(null), now, None)?;
            // A claimant that died mid-run.
            store.queue().claim_next_job("crashed")?;
        }
        clock.advance(chrono::Duration::seconds(61));

        let (_, settled) = pool.run_once("w-0").await?.unwrap();
        assert!(matches!(settled, Settled::Failed { .. }));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_lost_during_run_abandons_entry() -> Result<()> {
        let sink = Arc::new(CollectingSink::default());
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, clock) = pool_with(
            JobDefinition::barrier("worker", handler, RetryPolicy::default()),
            Some(sink.clone()),
        )?;
        seed_barrier_job(&pool)?;
        let types = vec!["worker".to_string()];

        let entry = {
            let store = pool.store.lock_sync()?;
            let entry = store.queue().claim_next_job_of_types("slow-0", &types)?.unwrap();
            clock.advance(chrono::Duration::seconds(61));
            store
                .queue()
                .claim_next_job_of_types("thief", &types)?
                .expect("expired lease reclaimed");
            entry
        };
        let settled = pool.process(entry, "slow-0").await?;
        assert_eq!(settled, Settled::Abandoned);
        assert!(sink.reports.lock().unwrap().is_empty());
        Ok(())
    }

    /// Rejects the first `rejections` reports, then collects.
    struct UnreachableSink {
        rejections: AtomicU32,
        reports: Mutex<Vec<CompletionReport>>,
    }

    #[async_trait]
    impl CompletionSink for UnreachableSink {
        async fn report(&self, report: CompletionReport) -> Result<()> {
            let left = self.rejections.load(Ordering::SeqCst);
            if left > 0 {
                self.rejections.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_undelivered_success_reports_failure_when_exhausted() -> Result<()> {
        let sink = Arc::new(UnreachableSink {
            rejections: AtomicU32::new(1),
            reports: Mutex::new(Vec::new()),
        });
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, _clock) = pool_with(
            JobDefinition::barrier("worker", handler, RetryPolicy::once()),
            Some(sink.clone()),
        )?;
        let job_id = seed_barrier_job(&pool)?;

        let (_, settled) = pool.run_once("w-0").await?.unwrap();
        assert!(matches!(settled, Settled::Failed { ref error } if error.contains("connection refused")));
        let reports = sink.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].job_id, job_id);
        assert!(matches!(reports[0].outcome, WorkerOutcome::Failed { .. }));
        Ok(())
    }

    /// Takes longer than the claim lease to absorb a report, then checks
    /// whether another worker could claim the entry meanwhile.
    struct SlowSink {
        store: StoreHandle,
        clock: ManualClock,
        stolen: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl CompletionSink for SlowSink {
        async fn report(&self, _: CompletionReport) -> Result<()> {
            self.clock.advance(chrono::Duration::seconds(61));
            tokio::time::sleep(Duration::from_millis(700)).await;
            let types = vec!["worker".to_string()];
            let stolen = self
                .store
                .call(move |store| store.queue().claim_next_job_of_types("thief", &types))
                .await?
                .is_some();
            *self.stolen.lock().unwrap() = Some(stolen);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lease_held_while_report_is_absorbed() -> Result<()> {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let clock = ManualClock::new(Utc::now());
        let (mut pool, clock) = pool_on(
            clock,
            JobDefinition::barrier("worker", handler, RetryPolicy::default()),
            None,
            Duration::from_secs(1),
        )?;
        let sink = Arc::new(SlowSink {
            store: pool.store.clone(),
            clock: clock.clone(),
            stolen: Mutex::new(None),
        });
        pool.sink = Some(sink.clone());
        seed_barrier_job(&pool)?;

        let (_, settled) = pool.run_once("w-0").await?.unwrap();
        assert_eq!(*sink.stolen.lock().unwrap(), Some(false));
        assert_eq!(settled, Settled::Done);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_payload_fails_barrier_job() -> Result<()> {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, clock) = pool_with(
            JobDefinition::barrier("worker", handler.clone(), RetryPolicy::default()),
            None,
        )?;
        {
            let store = pool.store.lock_sync()?;
            store
                .queue()
                .enqueue("worker", &json!({"not": "a task"}), clock.now(), None)?;
        }
        let (_, settled) = pool.run_once("w-0").await?.unwrap();
        assert!(matches!(settled, Settled::Failed { ref error } if error.contains("Invalid payload")));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_slots_stop_on_shutdown() -> Result<()> {
        let handler = Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) });
        let (pool, _clock) = pool_with(
            JobDefinition::plain("chore", handler, RetryPolicy::default()),
            None,
        )?;
        let (tx, rx) = watch::channel(false);
        let handles = Arc::new(pool).spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true)?;
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle).await??;
        }
        Ok(())
    }
}
