//! Maps a step outcome to the action the runner takes next.

use crate::metrics::StepClassification;
use crate::runner::AbortReason;

/// Default maximum consecutive failures before a session is aborted.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 10;

/// What the runner does after classifying a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Proceed to the next step.
    Continue,
    /// Terminate this session; other sessions are unaffected.
    AbortSession(AbortReason),
}

/// A pure function of (abort-on-failure flag, classification, consecutive
/// failure count). Success and Skipped reset the count; failures on a step
/// without the abort flag accumulate until a configured threshold aborts the
/// session anyway, preventing an endlessly-failing user from pinning a worker.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    max_consecutive_failures: usize,
}

impl FailurePolicy {
    pub fn new(max_consecutive_failures: usize) -> Self {
        FailurePolicy {
            max_consecutive_failures,
        }
    }

    pub fn evaluate(
        &self,
        abort_on_failure: bool,
        classification: StepClassification,
        consecutive_failures: &mut usize,
    ) -> PolicyAction {
        match classification {
            StepClassification::Success | StepClassification::Skipped => {
                *consecutive_failures = 0;
                PolicyAction::Continue
            }
            StepClassification::ValidationFailure | StepClassification::TransportError => {
                if abort_on_failure {
                    return PolicyAction::AbortSession(AbortReason::StepAbort);
                }
                *consecutive_failures += 1;
                if *consecutive_failures > self.max_consecutive_failures {
                    PolicyAction::AbortSession(AbortReason::ThresholdAbort)
                } else {
                    PolicyAction::Continue
                }
            }
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::new(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }
}
