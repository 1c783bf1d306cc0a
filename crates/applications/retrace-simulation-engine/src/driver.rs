//! Replay driver
//!
//! Reads a trace front to back and turns each event's trace-relative start
//! offset into a virtual-clock deadline. The first event anchors trace time to
//! the clock, so it fires immediately and later events keep their spacing.
//!
//! Each submission runs as its own task in a [`JoinSet`]; the replay loop never
//! waits on one, so a slow workload cannot delay the events behind it. All
//! handles are drained once the trace is exhausted.

use retrace_core::{Clock, SchedulingTarget, SimError, SubmissionError, TraceError, TraceSource};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::duration_to_ms;

/// Alignment between trace time and the virtual clock.
///
/// The origin is set by the first event and never recomputed. It is kept
/// wider than the offsets so anchoring on any `i64` offset is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayState {
    origin_offset_ms: Option<i128>,
}

impl ReplayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the first event has been seen
    pub fn origin_offset_ms(&self) -> Option<i128> {
        self.origin_offset_ms
    }

    /// Anchor on `start_offset_ms` if not yet anchored; returns the origin
    pub fn anchor(&mut self, start_offset_ms: i64, now_ms: u64) -> i128 {
        *self
            .origin_offset_ms
            .get_or_insert_with(|| i128::from(start_offset_ms) - i128::from(now_ms))
    }

    /// Virtual-clock deadline for an event, anchoring on the first call.
    ///
    /// Offsets before the anchor clamp to zero, which is already in the past.
    pub fn deadline(&mut self, start_offset_ms: i64, now_ms: u64) -> Duration {
        let origin = self.anchor(start_offset_ms, now_ms);
        let deadline_ms = (i128::from(start_offset_ms) - origin).clamp(0, i128::from(u64::MAX));
        Duration::from_millis(u64::try_from(deadline_ms).unwrap_or(u64::MAX))
    }
}

/// When one event was handed to the scheduling target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchRecord {
    pub index: usize,
    pub start_offset_ms: i64,
    pub deadline_ms: u64,
    pub dispatched_at_ms: u64,
}

/// A submission that did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionFailure {
    /// Trace position of the event; unknown when the submission task panicked
    pub index: Option<usize>,
    pub error: SubmissionError,
}

/// Outcome of one replay
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub dispatches: Vec<DispatchRecord>,
    pub completed: usize,
    pub failures: Vec<SubmissionFailure>,
    pub cancelled: bool,
    pub aborted: usize,
}

impl ReplayReport {
    /// Number of events dispatched
    pub fn submissions(&self) -> usize {
        self.dispatches.len()
    }

    fn record(&mut self, joined: Result<(usize, Result<(), SubmissionError>), JoinError>) {
        match joined {
            Ok((_, Ok(()))) => self.completed += 1,
            Ok((index, Err(error))) => {
                warn!(event = index, error = %error, "Submission failed");
                self.failures.push(SubmissionFailure {
                    index: Some(index),
                    error,
                });
            }
            Err(e) if e.is_cancelled() => self.aborted += 1,
            Err(e) => {
                warn!(error = %e, "Submission task panicked");
                self.failures.push(SubmissionFailure {
                    index: None,
                    error: SubmissionError::Panicked(e.to_string()),
                });
            }
        }
    }
}

/// The trace source failed part way through a replay
#[derive(Debug, Error)]
#[error("replay stopped after {} submission(s): {source}", report.submissions())]
pub struct ReplayError {
    pub source: TraceError,
    /// Everything dispatched and settled before the failure
    pub report: ReplayReport,
}

impl From<ReplayError> for SimError {
    fn from(e: ReplayError) -> Self {
        SimError::Trace(e.source)
    }
}

/// Feeds trace events into a scheduling target at their virtual times
pub struct ReplayDriver {
    clock: Arc<dyn Clock>,
    state: ReplayState,
    cancel: CancellationToken,
}

impl ReplayDriver {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: ReplayState::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop replay early when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    /// Replay `trace` into `target` and wait for every submission to settle.
    ///
    /// Submission failures are collected in the report. Only a broken trace
    /// source aborts the replay; its outstanding submissions are aborted and
    /// drained first, and the partial report travels with the error.
    pub async fn replay<S, T>(
        &mut self,
        trace: &mut S,
        target: Arc<T>,
    ) -> Result<ReplayReport, ReplayError>
    where
        S: TraceSource,
        S::Workload: Send + 'static,
        T: SchedulingTarget<S::Workload> + ?Sized + 'static,
    {
        let mut report = ReplayReport::default();
        let mut submissions = JoinSet::new();

        while trace.has_next() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let event = match trace.next_event() {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        error = %e,
                        outstanding = submissions.len(),
                        "Trace source failed, aborting outstanding submissions"
                    );
                    submissions.abort_all();
                    while let Some(joined) = submissions.join_next().await {
                        report.record(joined);
                    }
                    return Err(ReplayError {
                        source: e,
                        report,
                    });
                }
            };
            let index = report.dispatches.len();
            let deadline = self.state.deadline(event.start_offset_ms, duration_to_ms(self.clock.now()));

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = self.clock.suspend_until(deadline) => {}
            }

            let record = DispatchRecord {
                index,
                start_offset_ms: event.start_offset_ms,
                deadline_ms: duration_to_ms(deadline),
                dispatched_at_ms: duration_to_ms(self.clock.now()),
            };
            debug!(
                event = index,
                deadline_ms = record.deadline_ms,
                at_ms = record.dispatched_at_ms,
                "Dispatching submission"
            );
            report.dispatches.push(record);

            let target = Arc::clone(&target);
            let workload = event.workload;
            submissions.spawn(async move { (index, target.submit(workload).await) });

            while let Some(joined) = submissions.try_join_next() {
                report.record(joined);
            }
        }

        if report.cancelled {
            info!(
                dispatched = report.submissions(),
                outstanding = submissions.len(),
                "Replay cancelled, aborting outstanding submissions"
            );
            submissions.abort_all();
        } else {
            debug!(outstanding = submissions.len(), "Trace exhausted, draining submissions");
        }

        loop {
            let joined = if report.cancelled {
                submissions.join_next().await
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        info!(outstanding = submissions.len(), "Replay cancelled during drain");
                        report.cancelled = true;
                        submissions.abort_all();
                        continue;
                    }
                    joined = submissions.join_next() => joined,
                }
            };
            match joined {
                Some(joined) => report.record(joined),
                None => break,
            }
        }

        info!(
            submissions = report.submissions(),
            completed = report.completed,
            failed = report.failures.len(),
            aborted = report.aborted,
            "Replay finished"
        );
        Ok(report)
    }
}
