//! Drives one virtual user's lifecycle.
//!
//! A runner moves through `New → SettingUp → Ready → RunningStep → (Ready |
//! Aborted | Stopped)`. The setup chain runs strictly in order and any failure
//! aborts the session before a single task step executes. Task steps then
//! repeat, in declared order or weighted-random per the scenario, with a
//! think-time pause between steps, until the parent signals exit, the iteration
//! budget runs out, a one-shot cycle completes, or the failure policy aborts
//! the session. Termination is an ordinary return value reported to the parent,
//! never a panic or a thrown signal.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use strum_macros::Display;
use url::Url;

use crate::config::Configuration;
use crate::metrics::{StepClassification, StepOutcome};
use crate::policy::{FailurePolicy, PolicyAction};
use crate::scenario::{CredentialsSource, Scenario, SelectionPolicy, StepSpec};
use crate::session::{Credentials, SessionState};
use crate::step;
use crate::{LoadTestError, APP_USER_AGENT, DEFAULT_TIMEOUT_SECONDS};

// Never sleep more than 500 milliseconds at once, allowing a waiting user to
// observe shutdown quickly.
const MAXIMUM_SLEEP_MS: u128 = 500;

/// Commands sent from the parent to a virtual user thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Tell the user thread to stop after the step currently in flight.
    Exit,
}

/// Where a runner is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum UserLifecycle {
    /// Launched, setup chain not yet started.
    New,
    /// Running the setup chain.
    SettingUp,
    /// Between steps, able to observe the exit signal.
    Ready,
    /// Exactly one step in flight.
    RunningStep,
    /// Finished normally; terminal.
    Stopped,
    /// Session aborted; terminal.
    Aborted,
}

/// Why a session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum AbortReason {
    /// A setup-chain step failed; always fatal to the session.
    SetupAbort,
    /// A task step flagged abort-on-failure failed.
    StepAbort,
    /// Too many consecutive failures on unflagged steps.
    ThresholdAbort,
}

/// How a runner finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Stopped,
    Aborted(AbortReason),
}

/// A runner's final account of itself, sent to the parent exactly once.
#[derive(Debug, Clone)]
pub struct UserReport {
    /// Which virtual user this report describes.
    pub user: usize,
    /// The terminal state the runner reached.
    pub state: TerminalState,
    /// How many full task iterations the runner completed.
    pub iterations: usize,
}

/// One simulated concurrent actor replaying a scenario.
pub struct VirtualUser {
    /// Numbered from 1, as shown in the logs.
    pub user_number: usize,
    /// This user's exclusively-owned session context.
    pub session: SessionState,
    /// Where the runner is in its lifecycle.
    pub lifecycle: UserLifecycle,
    /// Completed task iterations.
    pub iterations: usize,
    pub(crate) client: Client,
    pub(crate) base_url: Url,
    pub(crate) timeout: Duration,
    pub(crate) iteration_budget: usize,
    pub(crate) consecutive_failures: usize,
    pub(crate) metrics_tx: flume::Sender<StepOutcome>,
}

impl VirtualUser {
    pub(crate) fn new(
        user_number: usize,
        host: &str,
        scenario: &Scenario,
        configuration: &Configuration,
        metrics_tx: flume::Sender<StepOutcome>,
    ) -> Result<Self, LoadTestError> {
        let base_url = Url::parse(host).map_err(|parse_error| LoadTestError::InvalidHost {
            host: host.to_string(),
            detail: "failed to parse host".to_string(),
            parse_error,
        })?;
        // Each user gets its own client so cookies and connection pools are
        // never shared across sessions.
        let client = Client::builder().user_agent(APP_USER_AGENT).build()?;
        let credentials = match &scenario.credentials {
            CredentialsSource::Generated => Credentials::generate(),
            CredentialsSource::Fixed { email, password } => Credentials::fixed(email, password),
        };
        let timeout =
            Duration::from_secs(configuration.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS) as u64);

        Ok(VirtualUser {
            user_number,
            session: SessionState::new(credentials),
            lifecycle: UserLifecycle::New,
            iterations: 0,
            client,
            base_url,
            timeout,
            iteration_budget: configuration.iterations,
            consecutive_failures: 0,
            metrics_tx,
        })
    }

    // Execute one step, delivering its outcome before control returns.
    async fn execute(&mut self, step: &StepSpec) -> StepClassification {
        self.lifecycle = UserLifecycle::RunningStep;
        debug!(
            "[user {}]: launching {} step",
            self.user_number, step.name
        );
        let outcome = step::execute_step(
            &self.client,
            &self.base_url,
            self.timeout,
            self.user_number,
            step,
            &mut self.session,
        )
        .await;
        let classification = outcome.classification;
        if let Err(error) = self.metrics_tx.send(outcome) {
            debug!("failed to deliver step outcome: {}", error);
        }
        self.lifecycle = UserLifecycle::Ready;
        classification
    }

    // Reach a terminal state, report it, and release the session.
    fn finish(mut self, state: TerminalState, report_tx: &flume::Sender<UserReport>) {
        self.lifecycle = match state {
            TerminalState::Stopped => UserLifecycle::Stopped,
            TerminalState::Aborted(_) => UserLifecycle::Aborted,
        };
        info!(
            "exiting user {} ({})...",
            self.user_number, self.lifecycle
        );
        let report = UserReport {
            user: self.user_number,
            state,
            iterations: self.iterations,
        };
        if let Err(error) = report_tx.send(report) {
            debug!("failed to deliver user report: {}", error);
        }
        // Dropping self releases the SessionState and per-user client, once.
    }
}

// What the iteration loop does after one task step.
enum StepFlow {
    Continue,
    Exit,
    Abort(AbortReason),
}

pub(crate) async fn user_main(
    mut user: VirtualUser,
    scenario: Scenario,
    policy: FailurePolicy,
    command_receiver: flume::Receiver<RunnerCommand>,
    report_tx: flume::Sender<UserReport>,
) {
    info!(
        "launching user {} from {}...",
        user.user_number, scenario.name
    );

    // Setup steps run strictly in order; any failure is fatal to the session
    // and no task step ever executes.
    user.lifecycle = UserLifecycle::SettingUp;
    for step in &scenario.setup {
        let classification = user.execute(step).await;
        if classification != StepClassification::Success {
            warn!(
                "[user {}]: setup step {} classified {}, aborting session",
                user.user_number, step.name, classification
            );
            user.finish(TerminalState::Aborted(AbortReason::SetupAbort), &report_tx);
            return;
        }
        user.lifecycle = UserLifecycle::SettingUp;
    }
    user.lifecycle = UserLifecycle::Ready;

    let mut terminal = TerminalState::Stopped;
    if !scenario.tasks.is_empty() {
        'iterations: loop {
            // The exit signal and budgets are observed between iterations and
            // steps, never mid-request.
            if received_exit(&command_receiver) {
                break 'iterations;
            }
            if user.iteration_budget > 0 && user.iterations >= user.iteration_budget {
                debug!(
                    "[user {}]: completed {} iterations",
                    user.user_number, user.iterations
                );
                break 'iterations;
            }

            match scenario.selection {
                SelectionPolicy::SequentialCyclic => {
                    for (index, step) in scenario.tasks.iter().enumerate() {
                        if index > 0 && received_exit(&command_receiver) {
                            break 'iterations;
                        }
                        // A one-shot cycle ends after its last step; thinking
                        // past it could only lose the completed iteration.
                        let think = !(scenario.one_shot && index + 1 == scenario.tasks.len());
                        match run_task_step(
                            &mut user,
                            &scenario,
                            step,
                            &policy,
                            &command_receiver,
                            think,
                        )
                        .await
                        {
                            StepFlow::Continue => (),
                            StepFlow::Exit => break 'iterations,
                            StepFlow::Abort(reason) => {
                                terminal = TerminalState::Aborted(reason);
                                break 'iterations;
                            }
                        }
                    }
                }
                SelectionPolicy::WeightedRandom => {
                    // Validation guarantees at least one non-zero weight.
                    let index = match scenario.pick_weighted_task() {
                        Some(index) => index,
                        None => break 'iterations,
                    };
                    match run_task_step(
                        &mut user,
                        &scenario,
                        &scenario.tasks[index],
                        &policy,
                        &command_receiver,
                        !scenario.one_shot,
                    )
                    .await
                    {
                        StepFlow::Continue => (),
                        StepFlow::Exit => break 'iterations,
                        StepFlow::Abort(reason) => {
                            terminal = TerminalState::Aborted(reason);
                            break 'iterations;
                        }
                    }
                }
            }
            user.iterations += 1;

            if scenario.one_shot {
                debug!(
                    "[user {}]: one-shot scenario complete",
                    user.user_number
                );
                break 'iterations;
            }
        }
    }

    user.finish(terminal, &report_tx);
}

// Run one task step: execute, apply the failure policy, then think-time
// unless the cycle is already over.
async fn run_task_step(
    user: &mut VirtualUser,
    scenario: &Scenario,
    step: &StepSpec,
    policy: &FailurePolicy,
    command_receiver: &flume::Receiver<RunnerCommand>,
    think: bool,
) -> StepFlow {
    let classification = user.execute(step).await;

    match policy.evaluate(
        step.abort_on_failure,
        classification,
        &mut user.consecutive_failures,
    ) {
        PolicyAction::AbortSession(reason) => {
            warn!(
                "[user {}]: task step {} classified {}, aborting session ({})",
                user.user_number, step.name, classification, reason
            );
            StepFlow::Abort(reason)
        }
        PolicyAction::Continue => {
            if think && wait_think_time(user, scenario.wait_time, command_receiver).await {
                StepFlow::Exit
            } else {
                StepFlow::Continue
            }
        }
    }
}

// Suspend for a think-time duration sampled uniformly from the configured
// interval, waking regularly to detect shutdown. Returns true when an exit
// command arrived while sleeping.
async fn wait_think_time(
    user: &VirtualUser,
    wait_time: Option<(Duration, Duration)>,
    command_receiver: &flume::Receiver<RunnerCommand>,
) -> bool {
    if let Some((min, max)) = wait_time {
        let mut remaining = if max > min {
            rand::thread_rng().gen_range(min..=max).as_millis()
        } else {
            min.as_millis()
        };

        while remaining > 0 {
            if received_exit(command_receiver) {
                return true;
            }
            let sleep_duration = if remaining > MAXIMUM_SLEEP_MS {
                remaining -= MAXIMUM_SLEEP_MS;
                Duration::from_millis(MAXIMUM_SLEEP_MS as u64)
            } else {
                let sleep_duration = Duration::from_millis(remaining as u64);
                remaining = 0;
                sleep_duration
            };
            debug!(
                "user {} sleeping {:?} ...",
                user.user_number, sleep_duration
            );
            tokio::time::sleep(sleep_duration).await;
        }
    }
    false
}

// Determine if the parent has sent a RunnerCommand::Exit message.
fn received_exit(command_receiver: &flume::Receiver<RunnerCommand>) -> bool {
    while let Ok(command) = command_receiver.try_recv() {
        match command {
            RunnerCommand::Exit => return true,
        }
    }
    false
}
