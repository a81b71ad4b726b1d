//! Wall-clock aligned triggers.
//!
//! Each trigger is its own task that sleeps until the next boundary of its
//! interval (counted from the Unix epoch, plus an optional offset) and then
//! starts its job. A trigger never runs two jobs at once: if the previous job
//! is still running when the next boundary arrives, that tick is skipped and
//! logged rather than queued.
//!
//! The scheduler knows intervals and jobs only. Instrument triggers drive a
//! [`WorkerHandle`]; staging triggers run [`StagingJob::run`].

use crate::adapters::filesystem::HarvestLedger;
use crate::clock::Clock;
use crate::config::InstrumentSpec;
use crate::core::{HarvestedFile, Record};
use crate::error::{AppResult, DaqError};
use crate::stager::Stager;
use crate::timebin::{interval_end, next_boundary};
use crate::worker::WorkerHandle;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// At most one running job per trigger.
#[derive(Debug)]
pub struct TriggerSlot {
    name: String,
    running: Option<JoinHandle<()>>,
    skipped: u64,
}

impl TriggerSlot {
    /// Empty slot.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: None,
            skipped: 0,
        }
    }

    /// Whether the last job is still running.
    pub fn is_busy(&self) -> bool {
        self.running.as_ref().is_some_and(|job| !job.is_finished())
    }

    /// Ticks skipped because the previous job was still running.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Spawn `job` unless the previous one is still running.
    pub fn try_start<F>(&mut self, at: DateTime<Utc>, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_busy() {
            self.skipped += 1;
            tracing::warn!(trigger = %self.name, tick = %at, skipped = self.skipped, "previous run still active, skipping tick");
            return false;
        }
        self.running = Some(tokio::spawn(job));
        true
    }

    /// Wait up to `grace` for the running job, then abort it.
    pub async fn finish(&mut self, grace: Duration) {
        let Some(mut job) = self.running.take() else {
            return;
        };
        if tokio::time::timeout(grace, &mut job).await.is_err() {
            tracing::warn!(trigger = %self.name, ?grace, "job did not finish within the grace period, aborting");
            job.abort();
        }
    }
}

/// Owns the trigger tasks.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
    triggers: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    /// Scheduler whose triggers stop when `shutdown` turns true.
    pub fn new(clock: Arc<dyn Clock>, shutdown: watch::Receiver<bool>, grace: Duration) -> Self {
        Self {
            clock,
            shutdown,
            grace,
            triggers: Vec::new(),
        }
    }

    /// Start a trigger that calls `job(boundary)` on every boundary of
    /// `interval` shifted by `offset`.
    pub fn add_trigger<F, Fut>(&mut self, name: impl Into<String>, interval: Duration, offset: Duration, job: F)
    where
        F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(trigger = %name, ?interval, ?offset, "trigger registered");
        let task = tokio::spawn(run_trigger(
            name.clone(),
            interval,
            offset,
            self.clock.clone(),
            self.shutdown.clone(),
            self.grace,
            job,
        ));
        self.triggers.push((name, task));
    }

    /// Sampling (or scanning) and staging triggers for one instrument.
    pub fn add_instrument(&mut self, worker: WorkerHandle, staging: Arc<StagingJob>) {
        let spec = staging.spec.clone();
        let kind = if spec.is_passive() { "scan" } else { "sample" };
        self.add_trigger(
            format!("{}/{kind}", spec.id),
            spec.sampling_interval,
            Duration::ZERO,
            move |at| {
                let worker = worker.clone();
                async move {
                    // The worker logs its own failures.
                    if let Err(e) = worker.tick(at).await {
                        tracing::error!(instrument = %worker.id(), error = %e, "tick not delivered");
                    }
                }
            },
        );

        self.add_trigger(
            format!("{}/stage", spec.id),
            spec.staging_interval,
            Duration::ZERO,
            move |at| {
                let staging = staging.clone();
                async move {
                    // Failures are logged and counted inside.
                    let _ = staging.run(at).await;
                }
            },
        );
    }

    /// Names of the registered triggers.
    pub fn trigger_names(&self) -> Vec<&str> {
        self.triggers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Wait for every trigger task to stop. Call after signalling shutdown.
    pub async fn join(self) {
        let (names, tasks): (Vec<_>, Vec<_>) = self.triggers.into_iter().unzip();
        for (name, result) in names.iter().zip(join_all(tasks).await) {
            if let Err(e) = result {
                tracing::error!(trigger = %name, error = %e, "trigger task failed");
            }
        }
    }
}

async fn run_trigger<F, Fut>(
    name: String,
    interval: Duration,
    offset: Duration,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
    mut job: F,
) where
    F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut slot = TriggerSlot::new(name.clone());
    let mut last_fired: Option<DateTime<Utc>> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = clock.now();
        let mut next = next_boundary(now, interval, offset);
        // A clock that lags the timer must not fire the same boundary twice.
        if let Some(last) = last_fired {
            if next <= last {
                next = next_boundary(last, interval, offset);
            }
        }
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let late = clock.now() - next;
        if late > chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero()) {
            tracing::warn!(trigger = %name, tick = %next, ?late, "tick fired late");
        }
        slot.try_start(next, job(next));
        last_fired = Some(next);
    }
    slot.finish(grace).await;
    tracing::debug!(trigger = %name, "trigger stopped");
}

/// Staging cycle of one instrument.
pub struct StagingJob {
    spec: Arc<InstrumentSpec>,
    worker: WorkerHandle,
    stager: Stager,
    ledger: Option<HarvestLedger>,
    failures: AtomicU32,
    escalate_after: u32,
}

/// What one staging cycle wrote.
#[derive(Debug, Default)]
pub struct StageSummary {
    /// Staged file paths, in order
    pub files: Vec<PathBuf>,
    /// Records written
    pub records: usize,
}

impl StagingJob {
    /// Staging job for the instrument behind `worker`.
    pub fn new(
        spec: Arc<InstrumentSpec>,
        worker: WorkerHandle,
        stager: Stager,
        ledger: Option<HarvestLedger>,
        escalate_after: u32,
    ) -> Self {
        Self {
            spec,
            worker,
            stager,
            ledger,
            failures: AtomicU32::new(0),
            escalate_after,
        }
    }

    /// Instrument spec.
    pub fn spec(&self) -> &InstrumentSpec {
        &self.spec
    }

    /// Stage every record timestamped before `cutoff` (one file per staging
    /// interval) and every harvested file. Whatever fails to stage goes back
    /// to the buffer or queue for the next cycle.
    pub async fn run(&self, cutoff: DateTime<Utc>) -> AppResult<StageSummary> {
        let result = self.stage(cutoff).await;
        match &result {
            Ok(summary) => {
                let previous = self.failures.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    tracing::info!(instrument = %self.spec.id, after_failures = previous, "staging recovered");
                }
                if !summary.files.is_empty() {
                    tracing::debug!(instrument = %self.spec.id, files = summary.files.len(), "staging cycle complete");
                }
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.escalate_after {
                    tracing::error!(
                        instrument = %self.spec.id,
                        consecutive_failures = failures,
                        buffered = self.worker.buffer().len(),
                        error = %e,
                        escalated = true,
                        "staging keeps failing; records are accumulating in memory"
                    );
                } else {
                    tracing::warn!(instrument = %self.spec.id, consecutive_failures = failures, error = %e, "staging failed");
                }
            }
        }
        result
    }

    async fn stage(&self, cutoff: DateTime<Utc>) -> AppResult<StageSummary> {
        let records = self.worker.buffer().drain_before(cutoff);
        let harvested = self.worker.harvest().drain();
        if records.is_empty() && harvested.is_empty() {
            return Ok(StageSummary::default());
        }

        let spec = self.spec.clone();
        let stager = self.stager.clone();
        let outcome = tokio::task::spawn_blocking(move || stage_blocking(&stager, &spec, records, harvested))
            .await
            .map_err(|e| DaqError::Staging(format!("staging task failed: {e}")))?;

        if !outcome.unstaged_records.is_empty() {
            self.worker.buffer().restore(outcome.unstaged_records);
        }
        if !outcome.unstaged_files.is_empty() {
            self.worker.harvest().restore(outcome.unstaged_files);
        }
        if let Some(ledger) = &self.ledger {
            for file in &outcome.staged_files {
                if let Err(e) = ledger.mark_staged(file.key()) {
                    tracing::warn!(instrument = %self.spec.id, file = %file.path.display(), error = %e, "could not record staged file");
                }
            }
        }
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(outcome.summary),
        }
    }
}

struct BlockingOutcome {
    summary: StageSummary,
    staged_files: Vec<HarvestedFile>,
    unstaged_records: Vec<Record>,
    unstaged_files: Vec<HarvestedFile>,
    error: Option<DaqError>,
}

fn stage_blocking(
    stager: &Stager,
    spec: &InstrumentSpec,
    records: Vec<Record>,
    harvested: Vec<HarvestedFile>,
) -> BlockingOutcome {
    let mut outcome = BlockingOutcome {
        summary: StageSummary::default(),
        staged_files: Vec::new(),
        unstaged_records: Vec::new(),
        unstaged_files: Vec::new(),
        error: None,
    };

    let mut bins: BTreeMap<DateTime<Utc>, Vec<Record>> = BTreeMap::new();
    for record in records {
        bins.entry(interval_end(record.timestamp, spec.staging_interval))
            .or_default()
            .push(record);
    }
    for (end, group) in bins {
        if outcome.error.is_some() {
            outcome.unstaged_records.extend(group);
            continue;
        }
        match stager.stage_interval(spec, end, &group) {
            Ok(path) => {
                outcome.summary.records += group.len();
                outcome.summary.files.push(path);
            }
            Err(e) => {
                outcome.error = Some(e);
                outcome.unstaged_records.extend(group);
            }
        }
    }

    for file in harvested {
        if outcome.error.is_some() {
            outcome.unstaged_files.push(file);
            continue;
        }
        match stager.stage_harvested(spec, &file) {
            Ok(path) => {
                outcome.summary.files.push(path);
                outcome.staged_files.push(file);
            }
            Err(DaqError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(instrument = %spec.id, file = %file.path.display(), "harvested file vanished before staging");
            }
            Err(e) => {
                outcome.error = Some(e);
                outcome.unstaged_files.push(file);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 30).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_fire_on_aligned_boundaries() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(origin()));
        let (stop, shutdown) = watch::channel(false);
        let mut scheduler = Scheduler::new(clock, shutdown, Duration::from_secs(1));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        scheduler.add_trigger("test", Duration::from_secs(60), Duration::from_secs(10), move |at| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(at);
            }
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2026, 10, 16, 12, 1, 10).unwrap());
        assert_eq!(second, Utc.with_ymd_and_hms(2026, 10, 16, 12, 2, 10).unwrap());

        stop.send_replace(true);
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn busy_trigger_skips_instead_of_queueing() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(origin()));
        let (stop, shutdown) = watch::channel(false);
        let mut scheduler = Scheduler::new(clock, shutdown, Duration::from_secs(1));
        let started = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        {
            let (started, concurrent, max_concurrent) = (started.clone(), concurrent.clone(), max_concurrent.clone());
            scheduler.add_trigger("slow", Duration::from_secs(60), Duration::ZERO, move |_| {
                let (started, concurrent, max_concurrent) =
                    (started.clone(), concurrent.clone(), max_concurrent.clone());
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    // each run spans two and a half intervals
                    tokio::time::sleep(Duration::from_secs(150)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }

        // boundaries at 12:01 .. 12:10: runs start at 12:01, 12:04, 12:07, 12:10
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(started.load(Ordering::SeqCst), 4);

        stop.send_replace(true);
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn shutdown_aborts_jobs_after_grace() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(origin()));
        let mut slot = TriggerSlot::new("stuck");
        assert!(slot.try_start(clock.now(), std::future::pending::<()>()));
        assert!(slot.is_busy());
        assert!(!slot.try_start(clock.now(), async {}));
        assert_eq!(slot.skipped(), 1);
        assert!(logs_contain("previous run still active, skipping tick"));
        slot.finish(Duration::from_secs(5)).await;
        assert!(!slot.is_busy());
    }
}
