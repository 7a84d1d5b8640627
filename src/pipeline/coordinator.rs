//! Pull loop and per-event workers
//!
//! The coordinator owns the event source. It pulls batches, filters
//! duplicates, and hands each remaining event to a worker task once a slot in
//! the bounded pool is free. Workers run analysis with retries, build the
//! notification, dispatch it and remember the key. The coordinator then
//! commits offsets per partition in order as workers finish.

use crate::ai::AnalysisEngine;
use crate::alerts::{NotificationDispatcher, NotificationPayload};
use crate::config::Config;
use crate::dedup::Deduplicator;
use crate::error::ErrorKind;
use crate::events::{FailureEvent, Offset, Timestamp};
use crate::monitoring::HealthMonitor;
use crate::pipeline::commit::CommitTracker;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::EventSource;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;

/// Longest pause between polls while the source keeps failing
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// Tunables of the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub max_in_flight: usize,
    pub analysis_timeout: Duration,
    pub shutdown_grace: Duration,
    /// How long one poll may wait; also the first backoff after a failed poll
    pub poll_timeout: Duration,
    pub notification_title: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_in_flight: config.pipeline.max_in_flight,
            analysis_timeout: config.pipeline.analysis_timeout(),
            shutdown_grace: config.pipeline.shutdown_grace(),
            poll_timeout: config.source.poll_timeout(),
            notification_title: config.notification.title.clone(),
        }
    }
}

/// Components shared by every worker
pub struct PipelineParts {
    pub engine: AnalysisEngine,
    pub retry: RetryPolicy,
    pub dispatcher: NotificationDispatcher,
    pub dedup: Arc<Deduplicator>,
    pub health: Arc<HealthMonitor>,
}

/// Why the pull loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The source will not produce more events; all work was drained
    SourceClosed,
    /// Shutdown was requested
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: StopReason,
    /// Workers aborted after the grace period; their offsets stay uncommitted
    pub abandoned: usize,
}

/// Per-event bookkeeping, owned by that event's worker
#[derive(Debug)]
struct ProcessingState {
    attempts: u32,
    first_seen_at: Timestamp,
    last_error: Option<ErrorKind>,
}

impl ProcessingState {
    fn new() -> Self {
        Self {
            attempts: 0,
            first_seen_at: Utc::now(),
            last_error: None,
        }
    }
}

struct WorkerContext {
    parts: PipelineParts,
    analysis_timeout: Duration,
    notification_title: String,
}

/// What a worker reports back when it is done with an event
struct Finished {
    offset: Offset,
    key: String,
}

/// The event a running task is working on
struct Assignment {
    event: FailureEvent,
    /// Set for the task that sends the fallback after a worker panicked
    recovering: bool,
}

/// Drives events from the source through analysis and notification
pub struct PipelineCoordinator<S: EventSource> {
    source: S,
    context: Arc<WorkerContext>,
    max_in_flight: usize,
    shutdown_grace: Duration,
    poll_timeout: Duration,
    tracker: CommitTracker,
    in_flight: HashSet<String>,
    assignments: HashMap<Id, Assignment>,
}

impl<S: EventSource> PipelineCoordinator<S> {
    pub fn new(mut source: S, parts: PipelineParts, settings: PipelineSettings) -> Self {
        let health = Arc::clone(&parts.health);
        source.on_disconnect(Box::new(move |reason: &str| {
            warn!("Event source disconnected: {}", reason);
            health.set_event_source_connected(false);
        }));

        Self {
            source,
            context: Arc::new(WorkerContext {
                parts,
                analysis_timeout: settings.analysis_timeout,
                notification_title: settings.notification_title,
            }),
            max_in_flight: settings.max_in_flight.max(1),
            shutdown_grace: settings.shutdown_grace,
            poll_timeout: settings.poll_timeout,
            tracker: CommitTracker::new(),
            in_flight: HashSet::new(),
            assignments: HashMap::new(),
        }
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.context.parts.health)
    }

    /// Run until the source closes or `shutdown` turns true
    ///
    /// On shutdown no further events are pulled. In-flight workers get the
    /// grace period to finish; the rest are aborted and their offsets are not
    /// committed, so the bus redelivers them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut workers: JoinSet<Finished> = JoinSet::new();
        let mut pending: VecDeque<FailureEvent> = VecDeque::new();
        let mut poll_backoff = self.poll_timeout;

        info!(
            "Pipeline started (max_in_flight={}, analysis_timeout={:?})",
            self.max_in_flight, self.context.analysis_timeout
        );

        let reason = loop {
            while let Some(result) = workers.try_join_next_with_id() {
                self.finish(&mut workers, result).await;
            }

            if *shutdown.borrow() {
                break StopReason::Shutdown;
            }

            let Some(event) = pending.pop_front() else {
                if self.source.is_closed() {
                    break StopReason::SourceClosed;
                }

                let polled = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => continue,
                    polled = self.source.poll(self.poll_timeout) => polled,
                };

                match polled {
                    Ok(events) => {
                        if !self.source.is_closed() {
                            self.context.parts.health.set_event_source_connected(true);
                        }
                        poll_backoff = self.poll_timeout;
                        for event in &events {
                            debug!("Received event '{}' at {}", event.key, event.offset);
                            self.context.parts.health.record_event_received();
                        }
                        pending.extend(events);
                    }
                    Err(e) => {
                        self.context.parts.health.set_event_source_connected(false);
                        warn!(
                            "Polling the event source failed: {}; retrying in {:?}",
                            e, poll_backoff
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown_requested(&mut shutdown) => {}
                            _ = tokio::time::sleep(poll_backoff) => {}
                        }
                        poll_backoff = (poll_backoff * 2).min(MAX_POLL_BACKOFF);
                    }
                }
                continue;
            };

            if self.is_duplicate(&event) {
                info!(
                    "Skipping duplicate event '{}' at {}",
                    event.key, event.offset
                );
                self.context.parts.health.record_duplicate();
                self.tracker.register(event.offset);
                self.complete(event.offset).await;
                continue;
            }

            // Wait for a free slot, reaping finished workers meanwhile
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(result) = workers.join_next_with_id(), if !workers.is_empty() => {
                        self.finish(&mut workers, result).await;
                    }
                    permit = Arc::clone(&slots).acquire_owned() => break permit.ok(),
                    _ = shutdown_requested(&mut shutdown) => break None,
                }
            };
            let Some(permit) = permit else {
                break StopReason::Shutdown;
            };

            info!("Dispatching event '{}' at {} to a worker", event.key, event.offset);
            self.tracker.register(event.offset);
            self.in_flight.insert(event.key.clone());

            let context = Arc::clone(&self.context);
            let assignment = Assignment {
                event: event.clone(),
                recovering: false,
            };
            let handle = workers.spawn(async move {
                let finished = process_event(&context, event).await;
                drop(permit);
                finished
            });
            self.assignments.insert(handle.id(), assignment);
        };

        let abandoned = match reason {
            StopReason::SourceClosed => {
                info!("Event source closed, draining {} worker(s)", workers.len());
                while let Some(result) = workers.join_next_with_id().await {
                    self.finish(&mut workers, result).await;
                }
                0
            }
            StopReason::Shutdown => self.drain_with_grace(&mut workers).await,
        };

        if !pending.is_empty() {
            info!(
                "{} pulled event(s) were not started and will be redelivered",
                pending.len()
            );
        }
        info!("Pipeline stopped ({:?}), {} worker(s) abandoned", reason, abandoned);

        RunSummary { reason, abandoned }
    }

    /// Already notified within the window, or currently being processed
    fn is_duplicate(&self, event: &FailureEvent) -> bool {
        self.in_flight.contains(&event.key) || self.context.parts.dedup.seen(&event.key)
    }

    async fn drain_with_grace(&mut self, workers: &mut JoinSet<Finished>) -> usize {
        if workers.is_empty() {
            return 0;
        }
        info!(
            "Shutdown requested, waiting up to {:?} for {} worker(s)",
            self.shutdown_grace,
            workers.len()
        );

        let deadline = Instant::now() + self.shutdown_grace;
        while !workers.is_empty() {
            match tokio::time::timeout_at(deadline, workers.join_next_with_id()).await {
                Ok(Some(result)) => self.finish(workers, result).await,
                Ok(None) => break,
                Err(_) => {
                    let abandoned = workers.len();
                    warn!(
                        "Grace period elapsed, aborting {} worker(s); their offsets stay uncommitted",
                        abandoned
                    );
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return abandoned;
                }
            }
        }
        0
    }

    async fn finish(
        &mut self,
        workers: &mut JoinSet<Finished>,
        result: Result<(Id, Finished), JoinError>,
    ) {
        let error = match result {
            Ok((id, finished)) => {
                self.assignments.remove(&id);
                self.in_flight.remove(&finished.key);
                self.complete(finished.offset).await;
                return;
            }
            Err(e) => e,
        };

        let Some(assignment) = self.assignments.remove(&error.id()) else {
            error!("Untracked worker failed: {}", error);
            return;
        };
        let event = assignment.event;

        if error.is_cancelled() {
            // Aborted at shutdown; left uncommitted for redelivery
            return;
        }

        if assignment.recovering {
            error!(
                "Fallback for event '{}' at {} failed too ({}); committing without a notification",
                event.key, event.offset, error
            );
            self.context.parts.health.record_dispatch(false);
            self.in_flight.remove(&event.key);
            self.complete(event.offset).await;
            return;
        }

        error!(
            "Worker for event '{}' at {} panicked ({}); sending a fallback",
            event.key, event.offset, error
        );
        let detail = format!("processing aborted: {}", error);
        let context = Arc::clone(&self.context);
        let recovery = event.clone();
        let handle = workers.spawn(async move { recover_event(&context, recovery, detail).await });
        self.assignments.insert(
            handle.id(),
            Assignment {
                event,
                recovering: true,
            },
        );
    }

    async fn complete(&mut self, offset: Offset) {
        let Some(commit) = self.tracker.complete(offset) else {
            debug!("Offset {} done, waiting on lower offsets", offset);
            return;
        };

        match self.source.commit(commit).await {
            Ok(()) => {
                self.context.parts.health.record_commit();
                info!("Committed offset {}", commit);
            }
            Err(e) => warn!("Failed to commit offset {}: {}", commit, e),
        }
    }
}

/// Resolves once shutdown has been requested; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Analyze with retries, notify, then remember the key
async fn process_event(context: &WorkerContext, event: FailureEvent) -> Finished {
    let parts = &context.parts;
    let mut state = ProcessingState::new();

    let payload = loop {
        state.attempts += 1;
        debug!(
            "Analyzing event '{}' at {} (attempt {})",
            event.key, event.offset, state.attempts
        );

        let outcome = parts.engine.analyze(&event, context.analysis_timeout).await;
        match outcome.into_diagnosis() {
            Ok(diagnosis) => {
                parts.health.record_analysis(true);
                parts.health.record_diagnosis();
                break NotificationPayload::diagnosed(
                    &event,
                    &diagnosis,
                    state.attempts,
                    &context.notification_title,
                );
            }
            Err((reason, detail)) => {
                parts.health.record_analysis(false);
                state.last_error = Some(reason);

                match parts.retry.decide(state.attempts, reason) {
                    RetryDecision::RetryAfter(delay) => {
                        info!(
                            "Retrying event '{}' in {:?} after {} (attempt {})",
                            event.key, delay, reason, state.attempts
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        warn!(
                            "Giving up on analysis of event '{}' after {} attempt(s), last error {}; sending fallback",
                            event.key, state.attempts, reason
                        );
                        parts.health.record_fallback();
                        break NotificationPayload::fallback(
                            &event,
                            reason,
                            &detail,
                            state.attempts,
                            &context.notification_title,
                        );
                    }
                }
            }
        }
    };

    notify_and_remember(parts, &event, &payload).await;

    let elapsed = Utc::now().signed_duration_since(state.first_seen_at);
    info!(
        "Finished event '{}' at {} in {} ms (attempts={}, last_error={:?})",
        event.key,
        event.offset,
        elapsed.num_milliseconds(),
        state.attempts,
        state.last_error
    );

    Finished {
        offset: event.offset,
        key: event.key,
    }
}

/// Send a fallback for an event whose worker panicked
async fn recover_event(context: &WorkerContext, event: FailureEvent, detail: String) -> Finished {
    let parts = &context.parts;
    parts.health.record_fallback();
    let payload = NotificationPayload::fallback(
        &event,
        ErrorKind::Unknown,
        &detail,
        1,
        &context.notification_title,
    );
    notify_and_remember(parts, &event, &payload).await;
    info!("Recovered event '{}' at {} with a fallback", event.key, event.offset);

    Finished {
        offset: event.offset,
        key: event.key,
    }
}

async fn notify_and_remember(parts: &PipelineParts, event: &FailureEvent, payload: &NotificationPayload) {
    match parts.dispatcher.dispatch(payload).await {
        Ok(()) => parts.health.record_dispatch(true),
        Err(e) => {
            error!("Notification for event '{}' was not delivered: {}", event.key, e);
            parts.health.record_dispatch(false);
        }
    }
    parts.dedup.remember(&event.key);
}
