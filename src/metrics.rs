//! Step outcome events and end-of-run rollups.
//!
//! Every executed or skipped step produces exactly one [`StepOutcome`], delivered
//! from the virtual user thread to the parent over a channel. The parent folds
//! outcomes into a [`LoadTestMetrics`] structure which is returned when the load
//! test finishes, and optionally forwards each outcome to a user-provided
//! [`MetricsSink`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::runner::{AbortReason, TerminalState, UserReport};

/// How a single step execution was classified.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
pub enum StepClassification {
    /// The response status was expected and the body predicate (if any) held.
    Success,
    /// A response was received but the status or body predicate did not match.
    ValidationFailure,
    /// No usable response: timeout, connection failure, or any dispatch error.
    TransportError,
    /// A declared precondition was unmet; the request was never sent.
    Skipped,
}

/// The result of executing (or skipping) one step, sent to the metrics channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Which virtual user produced this outcome.
    pub user: usize,
    /// The step name, used for metrics labeling.
    pub step_name: String,
    /// How the step was classified.
    pub classification: StepClassification,
    /// How many milliseconds the step took.
    pub elapsed_ms: u64,
    /// Optional detail, set for everything but Success.
    pub message: Option<String>,
}

impl StepOutcome {
    pub(crate) fn new(
        user: usize,
        step_name: &str,
        classification: StepClassification,
        elapsed_ms: u64,
        message: Option<String>,
    ) -> Self {
        StepOutcome {
            user,
            step_name: step_name.to_string(),
            classification,
            elapsed_ms,
            message,
        }
    }
}

/// Receives a copy of every [`StepOutcome`] as it arrives at the parent.
///
/// Implementations must tolerate concurrent delivery: the parent invokes
/// `record` from a single task, but a sink may also be shared with other
/// consumers. Register with `LoadTest::set_metrics_sink`.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, outcome: StepOutcome);
}

/// A [`MetricsSink`] forwarding outcomes into a flume channel.
pub struct ChannelSink {
    sender: flume::Sender<StepOutcome>,
}

impl ChannelSink {
    pub fn new(sender: flume::Sender<StepOutcome>) -> Self {
        ChannelSink { sender }
    }
}

#[async_trait]
impl MetricsSink for ChannelSink {
    async fn record(&self, outcome: StepOutcome) {
        // Best effort: a dropped receiver only loses the external copy.
        let _ = self.sender.send_async(outcome).await;
    }
}

/// Per-step-name rollup of all outcomes seen during the load test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Total number of Success outcomes.
    pub success_count: usize,
    /// Total number of ValidationFailure outcomes.
    pub validation_failure_count: usize,
    /// Total number of TransportError outcomes.
    pub transport_error_count: usize,
    /// Total number of Skipped outcomes.
    pub skipped_count: usize,
    /// The fastest response time seen so far, in milliseconds.
    pub min_elapsed: u64,
    /// The slowest response time seen so far, in milliseconds.
    pub max_elapsed: u64,
    /// Total combined response times, excluding skipped steps.
    pub total_elapsed: u64,
    /// How many response times have been recorded.
    pub elapsed_counter: usize,
}

impl StepMetrics {
    /// Total outcomes recorded for this step, regardless of classification.
    pub fn total_count(&self) -> usize {
        self.success_count
            + self.validation_failure_count
            + self.transport_error_count
            + self.skipped_count
    }

    /// How many outcomes of the given classification have been recorded.
    pub fn count(&self, classification: StepClassification) -> usize {
        match classification {
            StepClassification::Success => self.success_count,
            StepClassification::ValidationFailure => self.validation_failure_count,
            StepClassification::TransportError => self.transport_error_count,
            StepClassification::Skipped => self.skipped_count,
        }
    }

    fn record(&mut self, outcome: &StepOutcome) {
        match outcome.classification {
            StepClassification::Success => self.success_count += 1,
            StepClassification::ValidationFailure => self.validation_failure_count += 1,
            StepClassification::TransportError => self.transport_error_count += 1,
            StepClassification::Skipped => {
                // Skipped steps never dispatched a request, don't track elapsed time.
                self.skipped_count += 1;
                return;
            }
        }

        if self.min_elapsed == 0 || outcome.elapsed_ms < self.min_elapsed {
            self.min_elapsed = outcome.elapsed_ms;
        }
        if outcome.elapsed_ms > self.max_elapsed {
            self.max_elapsed = outcome.elapsed_ms;
        }
        self.total_elapsed += outcome.elapsed_ms;
        self.elapsed_counter += 1;
    }
}

/// What the ramp was doing when a [`RampHistory`] entry was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RampAction {
    /// Virtual users were being launched toward the target concurrency.
    Increasing,
    /// The target concurrency was reached and is being maintained.
    Maintaining,
    /// The load test was canceled before completing normally.
    Canceling,
    /// The load test finished.
    Finished,
}

/// A historical record of one ramp phase change.
#[derive(Clone, Debug)]
pub struct RampHistory {
    /// What action happened at this point.
    pub action: RampAction,
    /// A timestamp of when the phase change happened.
    pub timestamp: DateTime<Utc>,
    /// The number of active users at that time.
    pub users: usize,
}

impl RampHistory {
    pub(crate) fn step(action: RampAction, users: usize) -> RampHistory {
        RampHistory {
            action,
            timestamp: Utc::now(),
            users,
        }
    }
}

/// All metrics collected during a load test, derived purely from the stream of
/// [`StepOutcome`]s plus each runner's terminal state.
#[derive(Debug, Clone, Default)]
pub struct LoadTestMetrics {
    /// When the load test started.
    pub started: Option<DateTime<Utc>>,
    /// How long the load test ran, in seconds.
    pub duration: usize,
    /// Rollups keyed by step name.
    pub steps: BTreeMap<String, StepMetrics>,
    /// How many virtual users were launched.
    pub users_started: usize,
    /// How many virtual users reached the Stopped terminal state.
    pub users_stopped: usize,
    /// How many virtual users reached the Aborted terminal state.
    pub users_aborted: usize,
    /// Abort counts keyed by reason.
    pub abort_reasons: BTreeMap<String, usize>,
    /// Total completed task iterations across all users.
    pub total_iterations: usize,
    /// Ramp phase changes, in order.
    pub history: Vec<RampHistory>,
}

impl LoadTestMetrics {
    pub(crate) fn record_outcome(&mut self, outcome: &StepOutcome) {
        self.steps
            .entry(outcome.step_name.clone())
            .or_insert_with(StepMetrics::default)
            .record(outcome);
    }

    pub(crate) fn record_terminal(&mut self, report: &UserReport) {
        self.total_iterations += report.iterations;
        match report.state {
            TerminalState::Stopped => self.users_stopped += 1,
            TerminalState::Aborted(reason) => {
                self.users_aborted += 1;
                *self.abort_reasons.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
    }

    /// How many users aborted for the given reason.
    pub fn aborted_for(&self, reason: AbortReason) -> usize {
        self.abort_reasons
            .get(&reason.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Total outcomes recorded across all steps, regardless of classification.
    pub fn total_count(&self) -> usize {
        self.steps.values().map(|step| step.total_count()).sum()
    }
}

impl fmt::Display for LoadTestMetrics {
    // Summarize the load test in a text table, the final report an external
    // reporting layer would otherwise derive from the outcome stream.
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "\n === PER STEP METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>7} | {:>7} | {:>7} | {:>8} | {:>8}",
            "Name", "# reqs", "# fails", "# skip", "avg (ms)", "max (ms)"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for (name, step) in &self.steps {
            let failures = step.validation_failure_count + step.transport_error_count;
            let average = if step.elapsed_counter > 0 {
                step.total_elapsed / step.elapsed_counter as u64
            } else {
                0
            };
            writeln!(
                fmt,
                " {:<24} | {:>7} | {:>7} | {:>7} | {:>8} | {:>8}",
                name,
                step.success_count + failures,
                failures,
                step.skipped_count,
                average,
                step.max_elapsed
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for classification in StepClassification::iter() {
            let total: usize = self
                .steps
                .values()
                .map(|step| step.count(classification))
                .sum();
            writeln!(fmt, " {:<24}: {}", classification.to_string(), total)?;
        }
        writeln!(
            fmt,
            " users: {} started, {} stopped, {} aborted",
            self.users_started, self.users_stopped, self.users_aborted
        )?;
        for (reason, count) in &self.abort_reasons {
            writeln!(fmt, "   aborted with {}: {}", reason, count)?;
        }
        writeln!(
            fmt,
            " iterations: {} total in {} seconds",
            self.total_iterations, self.duration
        )?;

        Ok(())
    }
}
