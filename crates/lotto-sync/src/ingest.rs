//! Concurrent backfill of historical draws.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lotto_adapters::{fetch_by_id, latest_draw_id, DataError, DrawError, DrawSource};
use lotto_storage::{
    BackoffPolicy, DrawStore, FetchError, FetchOutcome, RateLimitConfig, RateLimiter,
    RetryDisposition, StoreError, UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub workers: usize,
    pub fetch_timeout: Duration,
    /// Once elapsed, no further ids are dispatched; in-flight tasks still finish.
    pub deadline: Option<Duration>,
    pub backoff: BackoffPolicy,
    /// Request pacing. A token is taken before each attempt's timeout starts.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            fetch_timeout: Duration::from_secs(30),
            deadline: None,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug)]
pub enum SkipReason {
    NotFound,
    Data(DataError),
}

#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Fetch(FetchError),
    #[error("fetch exceeded {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(StoreError),
    #[error("task aborted: {0}")]
    Aborted(String),
}

impl TaskFailure {
    fn retryable(&self) -> bool {
        match self {
            Self::Fetch(err) => err.retry_disposition() == RetryDisposition::Retryable,
            Self::Timeout(_) => true,
            Self::Store(_) | Self::Aborted(_) => false,
        }
    }
}

/// Terminal state of one draw id.
#[derive(Debug)]
pub enum TaskOutcome {
    Persisted(UpsertOutcome),
    Skipped(SkipReason),
    Failed(TaskFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionCounts {
    pub inserted: usize,
    pub already_present: usize,
    pub not_found: usize,
    pub wrong_game_type: usize,
    pub incomplete: usize,
    pub invalid: usize,
    pub failed: usize,
    pub not_dispatched: usize,
}

impl IngestionCounts {
    fn add(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Persisted(UpsertOutcome::Inserted) => self.inserted += 1,
            TaskOutcome::Persisted(UpsertOutcome::AlreadyPresent) => self.already_present += 1,
            TaskOutcome::Skipped(SkipReason::NotFound) => self.not_found += 1,
            TaskOutcome::Skipped(SkipReason::Data(DataError::WrongGameType { .. })) => {
                self.wrong_game_type += 1
            }
            TaskOutcome::Skipped(SkipReason::Data(DataError::IncompleteData(_))) => {
                self.incomplete += 1
            }
            TaskOutcome::Skipped(SkipReason::Data(_)) => self.invalid += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn persisted(&self) -> usize {
        self.inserted + self.already_present
    }
}

#[derive(Debug)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub first_id: u32,
    pub last_id: u32,
    pub outcomes: Vec<(u32, TaskOutcome)>,
    pub counts: IngestionCounts,
}

impl IngestionSummary {
    pub fn failed_ids(&self) -> Vec<u32> {
        let mut ids = self
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Failed(_)))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }
}

pub struct IngestionPipeline {
    source: Arc<dyn DrawSource>,
    store: Arc<dyn DrawStore>,
    limiter: Option<Arc<RateLimiter>>,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(
        source: Arc<dyn DrawSource>,
        store: Arc<dyn DrawStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            source,
            store,
            limiter: config.rate_limit.map(|c| Arc::new(RateLimiter::new(c))),
            config,
        }
    }

    /// Backfills `1..=latest`, where `latest` is resolved once up front.
    pub async fn run(&self) -> Result<IngestionSummary, DrawError> {
        let latest = latest_draw_id(self.source.as_ref()).await?;
        info!(latest, source = self.source.source_id(), "latest draw id resolved");
        Ok(self.run_range(1..=latest).await)
    }

    pub async fn run_range(&self, ids: RangeInclusive<u32>) -> IngestionSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, first = *ids.start(), last = *ids.end());
        self.run_range_inner(run_id, ids).instrument(span).await
    }

    async fn run_range_inner(&self, run_id: Uuid, ids: RangeInclusive<u32>) -> IngestionSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = self.config.deadline.map(|d| clock + d);
        let total = ids.clone().count();
        let (first_id, last_id) = (*ids.start(), *ids.end());

        let workers = self.config.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<(u32, TaskOutcome)> = JoinSet::new();
        let mut tally = Tally::new(total);

        info!(total, workers, "ingestion started");

        let mut pending = ids;
        while let Some(id) = pending.next() {
            let Some(permit) = acquire(&permits, deadline).await else {
                tally.counts.not_dispatched = 1 + pending.by_ref().count();
                warn!(
                    not_dispatched = tally.counts.not_dispatched,
                    "deadline reached; stopping dispatch"
                );
                break;
            };

            while let Some(joined) = tasks.try_join_next() {
                tally.settle(joined);
            }

            let source = Arc::clone(&self.source);
            let store = Arc::clone(&self.store);
            let limiter = self.limiter.clone();
            let config = self.config.clone();
            tally.dispatched(id);
            tasks.spawn(async move {
                let _permit: OwnedSemaphorePermit = permit;
                let worker = tokio::spawn(ingest_one(source, store, limiter, id, config));
                let outcome = match worker.await {
                    Ok(outcome) => outcome,
                    Err(err) => TaskOutcome::Failed(TaskFailure::Aborted(err.to_string())),
                };
                (id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            tally.settle(joined);
        }
        let Tally {
            outcomes, counts, ..
        } = tally.close();

        let duration = clock.elapsed();
        let finished_at = Utc::now();
        info!(
            %run_id,
            inserted = counts.inserted,
            already_present = counts.already_present,
            not_found = counts.not_found,
            wrong_game_type = counts.wrong_game_type,
            incomplete = counts.incomplete,
            invalid = counts.invalid,
            failed = counts.failed,
            not_dispatched = counts.not_dispatched,
            "ingestion finished in {:.2}s",
            duration.as_secs_f64()
        );

        IngestionSummary {
            run_id,
            started_at,
            finished_at,
            duration,
            first_id,
            last_id,
            outcomes,
            counts,
        }
    }
}

async fn acquire(
    permits: &Arc<Semaphore>,
    deadline: Option<Instant>,
) -> Option<OwnedSemaphorePermit> {
    let permit = match deadline {
        Some(at) => tokio::time::timeout_at(at, Arc::clone(permits).acquire_owned())
            .await
            .ok()?
            .ok()?,
        None => Arc::clone(permits).acquire_owned().await.ok()?,
    };
    match deadline {
        Some(at) if Instant::now() >= at => None,
        _ => Some(permit),
    }
}

/// Outcomes collected so far, plus the ids still awaiting one.
struct Tally {
    outcomes: Vec<(u32, TaskOutcome)>,
    counts: IngestionCounts,
    in_flight: BTreeSet<u32>,
    total: usize,
}

impl Tally {
    fn new(total: usize) -> Self {
        Self {
            outcomes: Vec::with_capacity(total),
            counts: IngestionCounts::default(),
            in_flight: BTreeSet::new(),
            total,
        }
    }

    fn dispatched(&mut self, id: u32) {
        self.in_flight.insert(id);
    }

    fn settle(&mut self, joined: Result<(u32, TaskOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((id, outcome)) => self.record(id, outcome),
            // The id is unknown here; `close` accounts for it.
            Err(err) => warn!("ingestion wrapper task failed: {err}"),
        }
    }

    /// Every dispatched id that never reported back is recorded as aborted.
    fn close(mut self) -> Self {
        for id in std::mem::take(&mut self.in_flight) {
            self.record(
                id,
                TaskOutcome::Failed(TaskFailure::Aborted("task lost before reporting".into())),
            );
        }
        self
    }

    fn record(&mut self, id: u32, outcome: TaskOutcome) {
        self.in_flight.remove(&id);
        match &outcome {
            TaskOutcome::Persisted(o) => debug!(id, outcome = ?o, "draw persisted"),
            TaskOutcome::Skipped(SkipReason::NotFound) => debug!(id, "draw not found; skipped"),
            TaskOutcome::Skipped(SkipReason::Data(err)) => info!(id, "draw skipped: {err}"),
            TaskOutcome::Failed(err) => warn!(id, "draw failed: {err}"),
        }

        self.counts.add(&outcome);
        self.outcomes.push((id, outcome));
        let done = self.outcomes.len();
        if done % PROGRESS_EVERY == 0 || done == self.total {
            info!(done, total = self.total, "ingestion progress");
        }
    }
}

async fn ingest_one(
    source: Arc<dyn DrawSource>,
    store: Arc<dyn DrawStore>,
    limiter: Option<Arc<RateLimiter>>,
    id: u32,
    config: IngestionConfig,
) -> TaskOutcome {
    let mut attempt = 0;
    loop {
        if let Some(limiter) = &limiter {
            limiter.acquire().await;
        }
        let fetched = tokio::time::timeout(config.fetch_timeout, fetch_by_id(source.as_ref(), id))
            .await;

        let failure = match fetched {
            Ok(Ok(FetchOutcome::Found(record))) => {
                return match store.upsert_if_absent(&record).await {
                    Ok(outcome) => TaskOutcome::Persisted(outcome),
                    Err(err) => TaskOutcome::Failed(TaskFailure::Store(err)),
                };
            }
            Ok(Ok(FetchOutcome::NotFound)) => return TaskOutcome::Skipped(SkipReason::NotFound),
            Ok(Err(DrawError::Data(err))) => return TaskOutcome::Skipped(SkipReason::Data(err)),
            Ok(Err(DrawError::Fetch(err))) => TaskFailure::Fetch(err),
            Err(_) => TaskFailure::Timeout(config.fetch_timeout),
        };

        if !failure.retryable() || attempt >= config.backoff.max_retries {
            return TaskOutcome::Failed(failure);
        }
        let delay = config.backoff.delay_for_attempt(attempt);
        debug!(id, attempt, ?delay, "retrying after transient failure: {failure}");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
