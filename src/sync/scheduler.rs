use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::catalog::ItemCatalog;
use crate::config::{Config, HOURLY_HISTORY_DAYS};
use crate::db::{BatchRecords, OrderBookStore};
use crate::error::Result;
use crate::fetcher::{FetchClient, FetchError};
use crate::locations::LocationRegistry;
use crate::sync::jobs::{
    build_batches, current_bucket_start, daily_plan, decode_history, decode_latest, hourly_plan,
    last_complete_hour, time_scale, BatchRequest, HistorySeries, PassPlan, PriceRow,
};
use crate::sync::lock::{Acquire, ApiLock};
use crate::sync::status::{Outcome, SyncStatusBoard};
use crate::types::{JobKind, SyncCheckpoint, TimeScale};

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything the job tasks share.
pub struct SyncContext {
    pub store: OrderBookStore,
    pub client: Arc<FetchClient>,
    pub lock: Arc<ApiLock>,
    pub status: Arc<SyncStatusBoard>,
    pub registry: Arc<LocationRegistry>,
    pub catalog: Arc<ItemCatalog>,
    pub base_url: String,
    pub max_url_length: usize,
    pub retention_days: i64,
    wakers: HashMap<JobKind, Arc<Notify>>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: OrderBookStore,
        client: Arc<FetchClient>,
        lock: Arc<ApiLock>,
        status: Arc<SyncStatusBoard>,
        registry: Arc<LocationRegistry>,
        catalog: Arc<ItemCatalog>,
        base_url: String,
        max_url_length: usize,
        retention_days: i64,
    ) -> Self {
        let wakers = JobKind::ALL
            .into_iter()
            .map(|k| (k, Arc::new(Notify::new())))
            .collect();
        Self {
            store,
            client,
            lock,
            status,
            registry,
            catalog,
            base_url,
            max_url_length,
            retention_days,
            wakers,
        }
    }

    fn waker(&self, job: JobKind) -> Arc<Notify> {
        self.wakers
            .get(&job)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    /// Tell `job` that it now holds the lock.
    fn wake(&self, job: JobKind) {
        if let Some(n) = self.wakers.get(&job) {
            n.notify_one();
        }
    }

    /// Catalog items if a catalog was loaded, otherwise every item the store has seen.
    async fn item_universe(&self) -> Result<Vec<String>> {
        if !self.catalog.is_empty() {
            return Ok(self.catalog.items().to_vec());
        }
        self.store.distinct_items().await
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Spawns one independently-timed task per sync job.
pub struct SyncScheduler {
    ctx: Arc<SyncContext>,
    jobs: Vec<(JobKind, Duration)>,
}

impl SyncScheduler {
    pub fn new(cfg: &Config, ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            jobs: vec![
                (JobKind::LatestPrices, cfg.latest_prices_interval),
                (JobKind::HourlyHistory, cfg.hourly_history_interval),
                (JobKind::DailyHistory, cfg.daily_history_interval),
            ],
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|(kind, every)| {
                self.ctx.status.register(kind, every);
                let runner = JobRunner::new(kind, every, Arc::clone(&self.ctx), shutdown.clone());
                tokio::spawn(runner.run())
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Job runner
// ---------------------------------------------------------------------------

/// Counters owned by one job task.
#[derive(Debug, Default)]
struct JobState {
    passes: u64,
    records: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub outcome: Outcome,
    pub batches: usize,
    pub records: u64,
    pub skipped: u64,
}

pub struct JobRunner {
    kind: JobKind,
    every: Duration,
    ctx: Arc<SyncContext>,
    shutdown: watch::Receiver<bool>,
    state: JobState,
}

impl JobRunner {
    pub fn new(kind: JobKind, every: Duration, ctx: Arc<SyncContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            kind,
            every,
            ctx,
            shutdown,
            state: JobState::default(),
        }
    }

    pub async fn run(mut self) {
        let waker = self.ctx.waker(self.kind);
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every_secs = self.every.as_secs(), "[SYNC] {} scheduled", self.kind);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_due().await,
                _ = waker.notified() => {
                    if self.ctx.lock.is_held_by(self.kind) {
                        info!("[SYNC] {} received the API lock", self.kind);
                        self.run_held().await;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let Some(next) = self.ctx.lock.withdraw(self.kind) {
            self.ctx.wake(next);
        }
        info!(
            passes = self.state.passes,
            records = self.state.records,
            "[SYNC] {} stopped",
            self.kind
        );
    }

    async fn on_due(&mut self) {
        if self.ctx.lock.is_queued(self.kind) {
            debug!("[SYNC] {} still queued for the API lock", self.kind);
            return;
        }

        match self.is_fresh(Utc::now()).await {
            Ok(fresh) => {
                self.ctx.status.checked(self.kind, fresh);
                if fresh {
                    debug!("[SYNC] {} is fresh", self.kind);
                    return;
                }
            }
            Err(e) => {
                error!("[SYNC] {} freshness check failed: {e}", self.kind);
                return;
            }
        }

        match self.ctx.lock.try_acquire(self.kind) {
            Acquire::Granted => self.run_held().await,
            Acquire::Queued => {
                self.ctx.status.set_queued(self.kind, true);
                info!(holder = ?self.ctx.lock.view().holder, "[SYNC] {} queued for the API lock", self.kind);
            }
            Acquire::AlreadyQueued => debug!("[SYNC] {} already queued", self.kind),
        }
    }

    /// Run one pass while holding the lock, then hand the lock on.
    async fn run_held(&mut self) {
        self.ctx.status.started(self.kind);
        match self.run_pass().await {
            Ok(report) => {
                self.ctx
                    .status
                    .finished(self.kind, report.outcome, report.records, report.skipped, None);
            }
            Err(e) => {
                error!("[SYNC] {} pass aborted, checkpoint kept: {e}", self.kind);
                self.ctx
                    .status
                    .finished(self.kind, Outcome::Failed, 0, 0, Some(e.to_string()));
            }
        }
        if let Some(next) = self.ctx.lock.release(self.kind) {
            info!("[SYNC] {} handing the API lock to {next}", self.kind);
            self.ctx.wake(next);
        }
    }

    /// A pending checkpoint always means there is work to resume.
    pub async fn is_fresh(&self, now: DateTime<Utc>) -> Result<bool> {
        let store = &self.ctx.store;
        if store.load_checkpoint(self.kind).await?.is_some() {
            return Ok(false);
        }
        Ok(match self.kind {
            JobKind::LatestPrices => store
                .latest_prices_fetched_at()
                .await?
                .is_some_and(|t| (now - t).to_std().map_or(true, |age| age < self.every)),
            JobKind::HourlyHistory => store
                .latest_history_date(TimeScale::Hourly)
                .await?
                .is_some_and(|t| t >= last_complete_hour(now)),
            JobKind::DailyHistory => store
                .missing_history_dates(self.ctx.retention_days, now.date_naive())
                .await?
                .is_empty(),
        })
    }

    async fn build_plan(&self, now: DateTime<Utc>) -> Result<PassPlan> {
        let today = now.date_naive();
        let store = &self.ctx.store;
        Ok(match self.kind {
            JobKind::LatestPrices => PassPlan::default(),
            JobKind::HourlyHistory => {
                let newest = store.latest_history_date(TimeScale::Hourly).await?;
                hourly_plan(newest, today, HOURLY_HISTORY_DAYS.min(self.ctx.retention_days))
            }
            JobKind::DailyHistory => {
                let missing = store.missing_history_dates(self.ctx.retention_days, today).await?;
                daily_plan(&missing)
            }
        })
    }

    /// One full pass, resuming from the persisted checkpoint if there is one.
    ///
    /// The checkpoint is written before each batch and advanced in the same
    /// transaction as the batch's records. A batch that fails with a
    /// non-retryable error is skipped; exhausted retries abort the pass with the
    /// checkpoint still pointing at the failed batch. Shutdown is honoured between
    /// batches, so a batch already in flight is fetched and committed first.
    ///
    /// The item list is frozen into the plan when the pass starts. A resumed pass
    /// works through the same items even if the store's universe moved since.
    pub async fn run_pass(&mut self) -> Result<PassReport> {
        let kind = self.kind;
        let now = Utc::now();
        let store = self.ctx.store.clone();
        let locations = self.ctx.registry.api_names();

        let resume = store.load_checkpoint(kind).await?;
        let resumed_plan = resume
            .as_ref()
            .and_then(|cp| PassPlan::from_json(&cp.plan).map(|plan| (plan, cp.current_batch, cp.started_at)));
        let (mut plan, mut start, started_at) = match resumed_plan {
            Some(p) => p,
            None => (self.build_plan(now).await?, 0, now),
        };
        if plan.items.is_empty() {
            plan.items = self.ctx.item_universe().await?;
        }

        let batches = build_batches(
            kind,
            &plan,
            &plan.items,
            &self.ctx.base_url,
            &locations,
            self.ctx.max_url_length,
        )?;
        let total = batches.len();

        if let Some(cp) = &resume {
            if cp.total_batches != total {
                warn!(
                    was = cp.total_batches,
                    now = total,
                    "[SYNC] {kind} batch count changed since checkpoint, restarting pass"
                );
                start = 0;
            } else if start > 0 {
                info!("[SYNC] {kind} resuming at batch {}/{total}", start + 1);
            }
        }

        let plan_json = plan.to_json();
        let mut records = 0u64;
        let mut skipped = 0u64;

        for (idx, batch) in batches.iter().enumerate().skip(start) {
            if *self.shutdown.borrow() {
                info!(records, "[SYNC] {kind} stopping at batch {}/{total}, checkpoint kept", idx + 1);
                return Ok(PassReport {
                    outcome: Outcome::Interrupted,
                    batches: total,
                    records,
                    skipped,
                });
            }

            let cp = SyncCheckpoint {
                job: kind,
                current_batch: idx,
                total_batches: total,
                started_at,
                plan: plan_json.clone(),
            };
            store.save_checkpoint(&cp).await?;
            self.ctx.status.progress(kind, idx, total);

            let fetched = self.fetch_batch(batch).await;

            let next = SyncCheckpoint {
                current_batch: idx + 1,
                ..cp
            };
            match fetched {
                Ok(recs) => {
                    let n = recs.len() as u64;
                    store.commit_batch(&recs, &next).await?;
                    records += n;
                    debug!(records = n, "[SYNC] {kind} batch {}/{total} committed", idx + 1);
                }
                Err(e) if !e.is_retryable() => {
                    warn!("[SYNC] {kind} batch {}/{total} skipped: {e}", idx + 1);
                    store.save_checkpoint(&next).await?;
                    skipped += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        store.clear_checkpoint(kind).await?;
        self.ctx.status.progress(kind, total, total);
        self.state.passes += 1;
        self.state.records += records;
        info!(
            batches = total,
            records,
            skipped,
            "[SYNC] {kind} pass complete"
        );
        Ok(PassReport {
            outcome: Outcome::Completed,
            batches: total,
            records,
            skipped,
        })
    }

    async fn fetch_batch(&self, batch: &BatchRequest) -> std::result::Result<BatchRecords, FetchError> {
        let registry = &self.ctx.registry;
        match (time_scale(self.kind), batch.range) {
            (Some(scale), Some(range)) => {
                let series: Vec<HistorySeries> = self.ctx.client.fetch_json(&batch.url).await?;
                let cutoff = current_bucket_start(scale, Utc::now());
                Ok(BatchRecords::History(decode_history(series, scale, range, cutoff, registry)))
            }
            (Some(_), None) => Ok(BatchRecords::History(Vec::new())),
            (None, _) => {
                let rows: Vec<PriceRow> = self.ctx.client.fetch_json(&batch.url).await?;
                Ok(BatchRecords::Latest(decode_latest(rows, Utc::now(), registry)))
            }
        }
    }
}
