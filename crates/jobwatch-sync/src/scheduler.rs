//! Polling scheduler that runs search cycles inside the operating window.
//!
//! One cycle walks the [`QueryPlan`] in order: each query's results are fingerprinted,
//! checked against the [`DedupCache`], and new ones go to the [`ReportSink`]. A failing
//! query only ends that query. Shutdown is checked at every poll and between queries;
//! a query in flight is allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use jobwatch_core::{fingerprint, NewJobEvent, ScheduleState};
use jobwatch_search::{SearchProvider, SearchQuery};
use jobwatch_storage::{DedupCache, PersistPolicy};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{ConfigError, QueryPlan, WatchConfig};
use crate::report::ReportSink;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    WaitingForWindow,
    RunningCycle,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How often the loop re-checks the window and the interval timer.
    pub poll_interval: Duration,
    /// Pause after each processed record.
    pub record_delay: Duration,
    /// Pause between consecutive queries of a cycle.
    pub title_delay: Duration,
    pub run_until: Option<DateTime<Utc>>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            record_delay: Duration::from_secs(1),
            title_delay: Duration::from_secs(2),
            run_until: None,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &WatchConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            poll_interval: config.poll_interval(),
            record_delay: config.record_delay(),
            title_delay: config.title_delay(),
            run_until: config.run_until_utc()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub started_at: DateTime<Utc>,
    pub look_back: DateTime<Utc>,
    pub queries: usize,
    pub queries_failed: usize,
    pub candidates: usize,
    pub duplicates: usize,
    pub new_jobs: usize,
    pub cancelled: bool,
}

pub struct Scheduler {
    state: SchedulerState,
    schedule: ScheduleState,
    plan: QueryPlan,
    settings: SchedulerSettings,
    cache: DedupCache,
    provider: Box<dyn SearchProvider>,
    sink: Box<dyn ReportSink>,
    clock: Arc<dyn Clock>,
    window_open: Option<bool>,
}

/// Sleeps for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl Scheduler {
    pub fn new(
        schedule: ScheduleState,
        plan: QueryPlan,
        settings: SchedulerSettings,
        cache: DedupCache,
        provider: Box<dyn SearchProvider>,
        sink: Box<dyn ReportSink>,
    ) -> Self {
        Self {
            state: SchedulerState::WaitingForWindow,
            schedule,
            plan,
            settings,
            cache,
            provider,
            sink,
            clock: Arc::new(SystemClock),
            window_open: None,
        }
    }

    pub fn from_config(
        config: &WatchConfig,
        cache: DedupCache,
        provider: Box<dyn SearchProvider>,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.schedule_state()?,
            config.query_plan(),
            SchedulerSettings::from_config(config)?,
            cache,
            provider,
            sink,
        ))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub fn into_cache(self) -> DedupCache {
        self.cache
    }

    /// Whether a cycle should start at `now`: window open and interval elapsed.
    pub fn is_cycle_due(&self, now: DateTime<Utc>) -> bool {
        self.schedule.is_window_open(now) && self.schedule.is_due(now)
    }

    fn note_window(&mut self, now: DateTime<Utc>) {
        let open = self.schedule.is_window_open(now);
        if self.window_open != Some(open) {
            let local = self.schedule.local_time(now);
            if open {
                info!(%local, "operating window open");
            } else {
                info!(
                    %local,
                    start = %self.schedule.window.start,
                    end = %self.schedule.window.end,
                    "outside operating window; waiting"
                );
            }
            self.window_open = Some(open);
        }
    }

    /// Polls until `cancel` fires or `run_until` passes. Always ends in `Stopped`.
    pub async fn run(&mut self, cancel: CancellationToken) -> SchedulerState {
        info!(
            queries = self.plan.job_titles.len(),
            poll_secs = self.settings.poll_interval.as_secs_f64(),
            interval_secs = self.schedule.run_interval.as_secs(),
            cache_entries = self.cache.len(),
            "scheduler started"
        );
        self.state = SchedulerState::WaitingForWindow;

        loop {
            if cancel.is_cancelled() {
                info!("shutdown requested");
                break;
            }
            let now = self.clock.now();
            if let Some(until) = self.settings.run_until {
                if now >= until {
                    info!(%until, "reached run_until; stopping");
                    break;
                }
            }

            self.note_window(now);
            if self.is_cycle_due(now) {
                self.state = SchedulerState::RunningCycle;
                let summary = self.run_cycle(&cancel).await;
                self.state = SchedulerState::WaitingForWindow;
                if summary.cancelled {
                    continue;
                }
            }

            if !pause(self.settings.poll_interval, &cancel).await {
                info!("shutdown requested");
                break;
            }
        }

        self.cache.flush().await;
        self.state = SchedulerState::Stopped;
        info!(cache_entries = self.cache.len(), "scheduler stopped");
        self.state
    }

    /// Runs every planned query once, regardless of the operating window.
    ///
    /// `last_run` advances to the cycle start only when the cycle was not cancelled.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleSummary {
        let started_at = self.clock.now();
        let look_back = self.schedule.look_back(started_at);
        let queries = self.plan.queries(look_back);
        let span = info_span!("search_cycle", %started_at, %look_back);

        async {
            info!(queries = queries.len(), first_run = self.schedule.last_run.is_none(), "starting search cycle");
            let mut summary = CycleSummary {
                started_at,
                look_back,
                queries: 0,
                queries_failed: 0,
                candidates: 0,
                duplicates: 0,
                new_jobs: 0,
                cancelled: false,
            };

            for (idx, query) in queries.iter().enumerate() {
                if cancel.is_cancelled() || (idx > 0 && !pause(self.settings.title_delay, cancel).await) {
                    summary.cancelled = true;
                    break;
                }
                summary.queries += 1;
                self.run_query(query, &mut summary, cancel).await;
            }

            if self.cache.policy() == PersistPolicy::EndOfCycle {
                self.cache.flush().await;
            }
            if summary.cancelled {
                warn!(
                    completed_queries = summary.queries,
                    new_jobs = summary.new_jobs,
                    "search cycle interrupted by shutdown"
                );
            } else {
                self.schedule.record_run(started_at);
                info!(
                    queries = summary.queries,
                    failed = summary.queries_failed,
                    candidates = summary.candidates,
                    duplicates = summary.duplicates,
                    new_jobs = summary.new_jobs,
                    "search cycle complete; found {} new jobs",
                    summary.new_jobs
                );
            }
            summary
        }
        .instrument(span)
        .await
    }

    async fn run_query(&mut self, query: &SearchQuery, summary: &mut CycleSummary, cancel: &CancellationToken) {
        let label = query.label();
        info!(query = %label, provider = self.provider.name(), "searching");

        let mut found = 0usize;
        let mut results = self.provider.search(query);
        while let Some(item) = results.next().await {
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    summary.queries_failed += 1;
                    warn!(query = %label, error = %err, kept = found, "search failed; skipping remaining results");
                    break;
                }
            };
            found += 1;
            summary.candidates += 1;

            let fp = fingerprint(&record);
            if self.cache.is_duplicate_fingerprint(fp).await {
                summary.duplicates += 1;
                debug!(query = %label, fingerprint = %fp, "already seen");
            } else {
                summary.new_jobs += 1;
                let event = NewJobEvent {
                    sequence: summary.new_jobs,
                    job_title: label.clone(),
                    query: query.text(),
                    record,
                    fingerprint: fp,
                    found_at: self.clock.now(),
                };
                if let Err(err) = self.sink.report(&event).await {
                    warn!(query = %label, error = %err, "failed to report new job");
                }
            }

            // Shutdown waits for the query boundary; only the throttle is skipped.
            if !cancel.is_cancelled() {
                pause(self.settings.record_delay, cancel).await;
            }
        }
        info!(query = %label, found, "query finished");
    }
}

/// Helpers for driving a [`Scheduler`] deterministically in tests.
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Clock whose time only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self { now: Mutex::new(now) }
        }

        pub fn set(&self, now: DateTime<Utc>) {
            if let Ok(mut guard) = self.now.lock() {
                *guard = now;
            }
        }

        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut guard) = self.now.lock() {
                *guard += by;
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            match self.now.lock() {
                Ok(guard) => *guard,
                Err(poisoned) => *poisoned.into_inner(),
            }
        }
    }

    /// Sink that keeps every event in memory.
    #[derive(Debug, Default, Clone)]
    pub struct RecordingSink {
        events: Arc<Mutex<Vec<NewJobEvent>>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<NewJobEvent> {
            match self.events.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }

        pub fn take(&self) -> Vec<NewJobEvent> {
            match self.events.lock() {
                Ok(mut guard) => std::mem::take(&mut *guard),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ReportSink for RecordingSink {
        async fn report(&self, event: &NewJobEvent) -> anyhow::Result<()> {
            if let Ok(mut guard) = self.events.lock() {
                guard.push(event.clone());
            }
            Ok(())
        }
    }
}
