//! Fixed-interval triage loop.
//!
//! Each pass takes the window `[now - interval, now]`, streams subject
//! statuses and then report events through the decision procedure, and
//! sleeps for `interval`. Shutdown is cooperative: it is checked before
//! each pass and during the sleep, never mid-pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{Stream, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Error, ModerationError, TriageError};
use crate::moderation::{REPORT_EVENT_TYPE, REVIEW_OPEN, ReportEvent, SubjectStatus, TimeWindow};
use crate::pipeline::paginate::paginate;
use crate::pipeline::triage::{TriageDecision, TriageOutcome, TriageProcessor};

// ── Shutdown ────────────────────────────────────────────────────────

/// Cooperative shutdown signal shared between the loop and its owner.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Sleep for `duration` unless shutdown is triggered first.
    /// Returns `true` when woken by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a trigger in between is not lost.
        notified.as_mut().enable();
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            _ = notified => true,
        }
    }
}

// ── Pass summary ────────────────────────────────────────────────────

/// What one pass saw and did.
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub window: TimeWindow,
    pub statuses_seen: usize,
    pub events_seen: usize,
    pub actions_emitted: usize,
    pub actions_failed: usize,
    pub items_failed: usize,
    pub pagination_errors: usize,
    pub decisions: HashMap<TriageDecision, usize>,
}

impl PassSummary {
    fn new(run_id: Uuid, window: TimeWindow) -> Self {
        Self {
            run_id,
            window,
            statuses_seen: 0,
            events_seen: 0,
            actions_emitted: 0,
            actions_failed: 0,
            items_failed: 0,
            pagination_errors: 0,
            decisions: HashMap::new(),
        }
    }

    fn record(&mut self, outcome: &TriageOutcome) {
        self.actions_emitted += outcome.actions_emitted;
        self.actions_failed += outcome.actions_failed;
        *self.decisions.entry(outcome.decision).or_default() += 1;
    }

    pub fn count(&self, decision: TriageDecision) -> usize {
        self.decisions.get(&decision).copied().unwrap_or(0)
    }
}

/// Counters from draining one stream.
#[derive(Default)]
struct Drained {
    seen: usize,
    page_error: Option<ModerationError>,
}

// ── Scheduler ───────────────────────────────────────────────────────

pub struct TriageScheduler {
    processor: Arc<TriageProcessor>,
    interval: Duration,
    max_concurrent_items: usize,
}

impl TriageScheduler {
    pub fn new(processor: Arc<TriageProcessor>) -> Self {
        let config = processor.config();
        let interval = config.interval;
        let max_concurrent_items = config.max_concurrent_items.max(1);
        Self {
            processor,
            interval,
            max_concurrent_items,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run passes until shutdown or a fatal error.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), Error> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Triage scheduler started"
        );

        loop {
            if shutdown.is_triggered() {
                info!("Triage scheduler shutting down");
                return Ok(());
            }

            let window = TimeWindow::ending_now(self.interval);
            match self.run_pass(window).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, stopping triage scheduler");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Triage pass failed"),
            }

            if shutdown.sleep(self.interval).await {
                info!("Triage scheduler shutting down");
                return Ok(());
            }
        }
    }

    /// Triage every status and report in `window`.
    pub async fn run_pass(&self, window: TimeWindow) -> Result<PassSummary, Error> {
        let run_id = Uuid::new_v4();
        let span = info_span!("triage_pass", %run_id);
        self.pass(run_id, window).instrument(span).await
    }

    async fn pass(&self, run_id: Uuid, window: TimeWindow) -> Result<PassSummary, Error> {
        info!(after = %window.after, before = %window.before, "Triage pass started");
        let mut summary = PassSummary::new(run_id, window);
        let processor = &self.processor;
        let service = processor.service();
        let dispatcher = processor.dispatcher();

        let statuses = paginate(move |cursor: Option<String>| async move {
            dispatcher
                .run(|| service.query_statuses(&window, Some(REVIEW_OPEN), cursor.as_deref()))
                .await
        });
        let drained = self
            .drain(statuses, &mut summary, |status: SubjectStatus| async move {
                processor.triage_status(&status).await
            })
            .await?;
        summary.statuses_seen = drained.seen;
        self.page_failure("statuses", drained.page_error, &mut summary)?;

        let events = paginate(move |cursor: Option<String>| async move {
            dispatcher
                .run(|| service.query_events(&window, REPORT_EVENT_TYPE, cursor.as_deref()))
                .await
        });
        let drained = self
            .drain(events, &mut summary, |event: ReportEvent| async move {
                processor.triage_report(&event).await
            })
            .await?;
        summary.events_seen = drained.seen;
        self.page_failure("events", drained.page_error, &mut summary)?;

        info!(
            statuses = summary.statuses_seen,
            events = summary.events_seen,
            actions_emitted = summary.actions_emitted,
            actions_failed = summary.actions_failed,
            items_failed = summary.items_failed,
            pagination_errors = summary.pagination_errors,
            "Triage pass complete"
        );
        Ok(summary)
    }

    /// Triage every item of `stream`, up to `max_concurrent_items` at once.
    ///
    /// Item failures are counted and logged; a fatal one ends the pass.
    async fn drain<S, T, F, Fut>(
        &self,
        stream: S,
        summary: &mut PassSummary,
        triage: F,
    ) -> Result<Drained, Error>
    where
        S: Stream<Item = Result<T, ModerationError>>,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<TriageOutcome, TriageError>>,
    {
        enum Step {
            Triaged(Result<TriageOutcome, TriageError>),
            PageFailed(ModerationError),
        }

        let triage = &triage;
        let steps = stream
            .map(|item| async move {
                match item {
                    Ok(item) => Step::Triaged(triage(item).await),
                    Err(e) => Step::PageFailed(e),
                }
            })
            .buffer_unordered(self.max_concurrent_items);
        let mut steps = std::pin::pin!(steps);

        let mut drained = Drained::default();
        while let Some(step) = steps.next().await {
            match step {
                Step::Triaged(Ok(outcome)) => {
                    drained.seen += 1;
                    summary.record(&outcome);
                }
                Step::Triaged(Err(e)) if e.is_fatal() => return Err(e.into()),
                Step::Triaged(Err(e)) => {
                    drained.seen += 1;
                    summary.items_failed += 1;
                    warn!(error = %e, "Skipping item for this pass");
                }
                Step::PageFailed(e) => drained.page_error = Some(e),
            }
        }
        Ok(drained)
    }

    /// A failed page fetch ends that stream only, unless it is fatal.
    fn page_failure(
        &self,
        stream: &str,
        error: Option<ModerationError>,
        summary: &mut PassSummary,
    ) -> Result<(), Error> {
        match error {
            None => Ok(()),
            Some(e) if e.is_fatal() => Err(e.into()),
            Some(e) => {
                summary.pagination_errors += 1;
                warn!(stream, error = %e, "Pagination failed, continuing with partial results");
                Ok(())
            }
        }
    }
}

/// Spawn the triage loop on the runtime.
///
/// Returns the task handle and the shutdown signal that stops it.
pub fn spawn_triage_scheduler(
    scheduler: TriageScheduler,
) -> (JoinHandle<Result<(), Error>>, Arc<Shutdown>) {
    let shutdown = Arc::new(Shutdown::new());
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move { scheduler.run(&shutdown).await });

    (handle, shutdown_flag)
}
