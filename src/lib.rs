//! # Stampede
//!
//! Stampede is a load testing engine inspired by [Locust](https://locust.io/).
//! It simulates many concurrent virtual users, each replaying a scripted
//! multi-step business transaction (signup → login → browse → cart → pay →
//! order) against a target HTTP service, measuring throughput, latency and
//! failure rate under load.
//!
//! User behavior is defined declaratively: a [`Scenario`](scenario::Scenario)
//! is an ordered registration list of [`StepSpec`](scenario::StepSpec) values.
//! Each step carries a templated request, the statuses and body predicate that
//! classify it as a success, the session fields it updates, and its failure
//! policy flags. Stampede uses [`reqwest`](https://docs.rs/reqwest/) to provide
//! a convenient HTTP client.
//!
//! ## Creating a load test
//!
//! ```rust,no_run
//! use stampede::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), LoadTestError> {
//!     let scenario = Scenario::new("CheckoutFlow")
//!         .register_setup(
//!             StepSpec::post("Login", "/api/users/login", json!({
//!                 "email": "{email}",
//!                 "password": "{password}",
//!             }))
//!             .set_predicate(BodyPredicate::HasField("accessToken".to_string()))
//!             .set_state_update(StateUpdate::StoreAuthToken("accessToken".to_string())),
//!         )
//!         .register_setup(
//!             StepSpec::get("List Products", "/api/products")
//!                 .set_predicate(BodyPredicate::ArrayOfRecordsWith("_id".to_string()))
//!                 .set_state_update(StateUpdate::StoreCatalog),
//!         )
//!         .register_task(
//!             StepSpec::get("Get Product", "/api/products/{product_id}")
//!                 .set_precondition(Precondition::NonEmptyCatalog),
//!         )
//!         .register_task(StepSpec::get("View Cart", "/api/cart/view"));
//!
//!     let metrics = LoadTest::initialize()?
//!         .register_scenario(scenario)
//!         .execute()
//!         .await?;
//!     println!("{}", metrics);
//!
//!     Ok(())
//! }
//! ```
//!
//! Every virtual user runs fully concurrently and independently, owning its
//! [`SessionState`](session::SessionState) exclusively. The only shared state
//! is the metrics channel and a single cancellation signal polled between
//! steps, never mid-request. Canned steps for a storefront-style target
//! service live in the [`storefront`] module.

#[macro_use]
extern crate log;

pub mod config;
pub mod metrics;
pub mod policy;
pub mod prelude;
pub mod runner;
pub mod scenario;
pub mod session;
mod step;
pub mod storefront;
pub mod util;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, io, time};

use chrono::prelude::*;
use gumdrop::Options;

use crate::config::Configuration;
use crate::metrics::{LoadTestMetrics, MetricsSink, RampAction, RampHistory, StepOutcome};
use crate::policy::{FailurePolicy, DEFAULT_MAX_CONSECUTIVE_FAILURES};
use crate::runner::{RunnerCommand, TerminalState, UserReport, VirtualUser};
use crate::scenario::Scenario;

/// User agent attached to every request.
static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Default bounded per-request timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: usize = 60;

// How often the parent wakes to schedule spawns and drain channels.
const SCHEDULER_TICK_MS: u64 = 50;

/// An enumeration of all errors a [`LoadTest`] can return.
#[derive(Debug)]
pub enum LoadTestError {
    /// Wraps a [`std::io::Error`].
    Io(io::Error),
    /// Wraps a [`reqwest::Error`].
    Reqwest(reqwest::Error),
    /// Wraps a [`tokio::task::JoinError`].
    TokioJoin(tokio::task::JoinError),
    /// Failed to parse a hostname.
    InvalidHost {
        /// The invalid hostname that caused this error.
        host: String,
        /// An optional explanation of the error.
        detail: String,
        /// Wraps a [`url::ParseError`].
        parse_error: url::ParseError,
    },
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error.
        option: String,
        /// The invalid value that caused this error.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid think time specified.
    InvalidWaitTime {
        /// The specified minimum wait time.
        min_wait: time::Duration,
        /// The specified maximum wait time.
        max_wait: time::Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid step weight specified.
    InvalidWeight {
        /// The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A step template references a session field no prior step produces.
    InvalidTemplate {
        /// The step whose template failed validation.
        step: String,
        /// The unresolvable template variable.
        variable: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A [`LoadTest`] has no [`Scenario`] defined.
    NoScenarios {
        /// An optional explanation of the error.
        detail: String,
    },
}

impl LoadTestError {
    fn describe(&self) -> &str {
        match *self {
            LoadTestError::Io(_) => "io::Error",
            LoadTestError::Reqwest(_) => "reqwest::Error",
            LoadTestError::TokioJoin(_) => "tokio::task::JoinError",
            LoadTestError::InvalidHost { .. } => "invalid host",
            LoadTestError::InvalidOption { .. } => "invalid option",
            LoadTestError::InvalidWaitTime { .. } => "invalid wait_time",
            LoadTestError::InvalidWeight { .. } => "invalid weight",
            LoadTestError::InvalidTemplate { .. } => "invalid template",
            LoadTestError::NoScenarios { .. } => "no scenarios defined",
        }
    }
}

impl fmt::Display for LoadTestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadTestError::Io(source) => write!(f, "LoadTestError: {} ({})", self.describe(), source),
            LoadTestError::Reqwest(source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::TokioJoin(source) => {
                write!(f, "LoadTestError: {} ({})", self.describe(), source)
            }
            LoadTestError::InvalidHost {
                host,
                detail,
                parse_error,
            } => write!(
                f,
                "LoadTestError: {} `{}` ({}): {}",
                self.describe(),
                host,
                detail,
                parse_error
            ),
            LoadTestError::InvalidOption {
                option,
                value,
                detail,
            } => write!(
                f,
                "LoadTestError: {} {}={} ({})",
                self.describe(),
                option,
                value,
                detail
            ),
            LoadTestError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail,
            } => write!(
                f,
                "LoadTestError: {} {:?}..{:?} ({})",
                self.describe(),
                min_wait,
                max_wait,
                detail
            ),
            LoadTestError::InvalidWeight { weight, detail } => {
                write!(f, "LoadTestError: {} {} ({})", self.describe(), weight, detail)
            }
            LoadTestError::InvalidTemplate {
                step,
                variable,
                detail,
            } => write!(
                f,
                "LoadTestError: {} in step `{}`, variable `{}` ({})",
                self.describe(),
                step,
                variable,
                detail
            ),
            LoadTestError::NoScenarios { detail } => {
                write!(f, "LoadTestError: {} ({})", self.describe(), detail)
            }
        }
    }
}

impl std::error::Error for LoadTestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadTestError::Io(source) => Some(source),
            LoadTestError::Reqwest(source) => Some(source),
            LoadTestError::TokioJoin(source) => Some(source),
            LoadTestError::InvalidHost { parse_error, .. } => Some(parse_error),
            _ => None,
        }
    }
}

impl From<io::Error> for LoadTestError {
    fn from(source: io::Error) -> LoadTestError {
        LoadTestError::Io(source)
    }
}

impl From<reqwest::Error> for LoadTestError {
    fn from(source: reqwest::Error) -> LoadTestError {
        LoadTestError::Reqwest(source)
    }
}

impl From<tokio::task::JoinError> for LoadTestError {
    fn from(source: tokio::task::JoinError) -> LoadTestError {
        LoadTestError::TokioJoin(source)
    }
}

/// The phases a load test moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// No load test is running.
    Idle,
    /// Virtual users are launching toward the target concurrency.
    Increase,
    /// All users are launched; load is maintained until a budget expires.
    Maintain,
    /// Users are being told to exit and the parent waits for them.
    Shutdown,
}

/// Owns the population of virtual users: ramps them up at the configured spawn
/// rate, supplies the shared cancellation signal, enforces the run budget, and
/// tears everything down at run end.
pub struct LoadTest {
    /// Runtime configuration, consumed not produced by the core.
    configuration: Configuration,
    /// All registered scenarios, assigned to users round robin.
    scenarios: Vec<Scenario>,
    /// Metrics folded from the outcome stream and terminal states.
    metrics: LoadTestMetrics,
    /// Optional sink receiving a copy of every outcome.
    sink: Option<Arc<dyn MetricsSink>>,
    /// Which phase the load test is currently in.
    phase: RunPhase,
}

impl LoadTest {
    /// Load configuration from command line and initialize a [`LoadTest`].
    ///
    /// # Example
    /// ```rust,no_run
    /// use stampede::prelude::*;
    ///
    /// fn main() -> Result<(), LoadTestError> {
    ///     let _load_test = LoadTest::initialize()?;
    ///     Ok(())
    /// }
    /// ```
    pub fn initialize() -> Result<LoadTest, LoadTestError> {
        LoadTest::initialize_with_config(Configuration::parse_args_default_or_exit())
    }

    /// Initialize a [`LoadTest`] with an already-built configuration. This is
    /// the preferred way to drive a load test from tests.
    pub fn initialize_with_config(
        configuration: Configuration,
    ) -> Result<LoadTest, LoadTestError> {
        Ok(LoadTest {
            configuration,
            scenarios: Vec::new(),
            metrics: LoadTestMetrics::default(),
            sink: None,
            phase: RunPhase::Idle,
        })
    }

    /// A reference to the configuration consumed by this load test.
    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Register a [`Scenario`]. When more than one scenario is registered,
    /// users are assigned scenarios round robin in registration order.
    pub fn register_scenario(mut self, scenario: Scenario) -> Self {
        trace!("register_scenario: {}", scenario.name);
        self.scenarios.push(scenario);
        self
    }

    /// Register a sink receiving a copy of every [`StepOutcome`] as it reaches
    /// the parent, in addition to the built-in rollup.
    pub fn set_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Execute the load test, returning the collected metrics when it ends.
    pub async fn execute(mut self) -> Result<LoadTestMetrics, LoadTestError> {
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            return Ok(self.metrics);
        }

        self.configuration.validate()?;
        self.configuration.initialize_logger()?;

        if self.scenarios.is_empty() {
            return Err(LoadTestError::NoScenarios {
                detail: "register at least one scenario before executing".to_string(),
            });
        }
        for scenario in &self.scenarios {
            scenario.validate()?;
        }

        // Scenarios without their own think time inherit the configured default.
        let default_wait = match (
            self.configuration.think_time_min,
            self.configuration.think_time_max,
        ) {
            (None, None) => None,
            (min, max) => {
                let min = min.unwrap_or(0);
                let max = max.unwrap_or(min);
                Some((
                    time::Duration::from_secs(min as u64),
                    time::Duration::from_secs(max as u64),
                ))
            }
        };
        for scenario in &mut self.scenarios {
            if scenario.wait_time.is_none() {
                scenario.wait_time = default_wait;
            }
        }

        // Resolve and confirm the host each scenario runs against.
        let mut hosts = Vec::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            let host = if !self.configuration.host.is_empty() {
                self.configuration.host.clone()
            } else if let Some(host) = &scenario.host {
                host.clone()
            } else {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.host`".to_string(),
                    value: "".to_string(),
                    detail: format!(
                        "a host must be configured, or set on scenario {}",
                        scenario.name
                    ),
                });
            };
            util::is_valid_host(&host)?;
            hosts.push(host);
        }

        self.run_attack(hosts).await?;

        if !self.configuration.no_print_metrics {
            print!("{}", self.metrics);
        }

        Ok(self.metrics)
    }

    // Ramp up, maintain, and tear down the virtual user population.
    async fn run_attack(&mut self, hosts: Vec<String>) -> Result<(), LoadTestError> {
        let target_users = self.configuration.users.unwrap_or(1);
        let hatch_rate = util::get_hatch_rate(self.configuration.hatch_rate.clone());
        let spawn_interval_ms = (1_000.0 / hatch_rate) as usize;
        let run_time_ms = util::parse_timespan(&self.configuration.run_time) * 1_000;
        let policy = FailurePolicy::new(
            self.configuration
                .max_consecutive_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
        );

        // The single shared cancellation signal, observed by the scheduler and
        // flipped by ctrl-c; runners observe it indirectly via Exit commands.
        let canceled = Arc::new(AtomicBool::new(false));
        util::setup_ctrlc_handler(&canceled);

        // Channels shared by all users: outcomes and terminal reports in,
        // one command channel per user out.
        let (metrics_tx, metrics_rx) = flume::unbounded::<StepOutcome>();
        let (report_tx, report_rx) = flume::unbounded::<UserReport>();
        let mut user_channels: Vec<flume::Sender<RunnerCommand>> = Vec::new();
        let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();

        self.metrics.started = Some(Utc::now());
        self.metrics
            .history
            .push(RampHistory::step(RampAction::Increasing, 0));
        self.set_phase(RunPhase::Increase);
        info!(
            "launching {} users at {} per second...",
            target_users, hatch_rate
        );

        let started = time::Instant::now();
        let mut spawn_timer = time::Instant::now();
        let mut spawn_next_in_ms = 0;
        let mut spawned = 0;
        let mut active_users = 0;

        loop {
            match self.phase {
                RunPhase::Increase => {
                    if canceled.load(Ordering::SeqCst) {
                        self.metrics
                            .history
                            .push(RampHistory::step(RampAction::Canceling, active_users));
                        self.set_phase(RunPhase::Shutdown);
                    } else if spawned >= target_users {
                        info!("launched {} users...", spawned);
                        self.metrics
                            .history
                            .push(RampHistory::step(RampAction::Maintaining, active_users));
                        self.set_phase(RunPhase::Maintain);
                    } else if spawn_next_in_ms == 0
                        || util::ms_timer_expired(spawn_timer, spawn_next_in_ms)
                    {
                        spawn_timer = time::Instant::now();
                        spawn_next_in_ms = spawn_interval_ms;
                        self.spawn_user(
                            spawned + 1,
                            &hosts,
                            policy,
                            &metrics_tx,
                            &report_tx,
                            &mut user_channels,
                            &mut handles,
                        )?;
                        spawned += 1;
                        active_users += 1;
                    }
                }
                RunPhase::Maintain => {
                    if canceled.load(Ordering::SeqCst) {
                        self.metrics
                            .history
                            .push(RampHistory::step(RampAction::Canceling, active_users));
                        self.set_phase(RunPhase::Shutdown);
                    } else if run_time_ms > 0 && util::ms_timer_expired(started, run_time_ms) {
                        info!("run time expired, stopping...");
                        self.set_phase(RunPhase::Shutdown);
                    } else if active_users == 0 {
                        info!("all users finished, stopping...");
                        self.set_phase(RunPhase::Shutdown);
                    }
                }
                RunPhase::Shutdown => {
                    // Tell every runner to stop after its in-flight step.
                    for channel in &user_channels {
                        let _ = channel.send(RunnerCommand::Exit);
                    }
                    break;
                }
                RunPhase::Idle => unreachable!("load test is running"),
            }

            // Fold in whatever arrived since the last tick.
            self.receive_outcomes(&metrics_rx).await;
            while let Ok(report) = report_rx.try_recv() {
                active_users -= 1;
                let aborted = matches!(report.state, TerminalState::Aborted(_));
                self.metrics.record_terminal(&report);
                // Backfill is an explicit opt-in; an aborted user is otherwise
                // counted and not replaced.
                if aborted && self.configuration.backfill {
                    self.spawn_user(
                        spawned + 1,
                        &hosts,
                        policy,
                        &metrics_tx,
                        &report_tx,
                        &mut user_channels,
                        &mut handles,
                    )?;
                    spawned += 1;
                    active_users += 1;
                }
            }

            tokio::time::sleep(time::Duration::from_millis(SCHEDULER_TICK_MS)).await;
        }

        // Wait for every in-flight step to finish; each join also guarantees
        // the runner's session was released exactly once.
        for joined in futures::future::join_all(handles).await {
            joined?;
        }

        // Nothing can send anymore; drain what was delivered while stopping so
        // no outcome is ever silently dropped.
        self.receive_outcomes(&metrics_rx).await;
        while let Ok(report) = report_rx.try_recv() {
            self.metrics.record_terminal(&report);
        }

        self.metrics.duration = started.elapsed().as_secs() as usize;
        self.metrics
            .history
            .push(RampHistory::step(RampAction::Finished, 0));
        self.set_phase(RunPhase::Idle);

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_user(
        &mut self,
        user_number: usize,
        hosts: &[String],
        policy: FailurePolicy,
        metrics_tx: &flume::Sender<StepOutcome>,
        report_tx: &flume::Sender<UserReport>,
        user_channels: &mut Vec<flume::Sender<RunnerCommand>>,
        handles: &mut Vec<tokio::task::JoinHandle<()>>,
    ) -> Result<(), LoadTestError> {
        // Users are assigned scenarios round robin in registration order.
        let scenario_index = (user_number - 1) % self.scenarios.len();
        let scenario = self.scenarios[scenario_index].clone();
        let user = VirtualUser::new(
            user_number,
            &hosts[scenario_index],
            &scenario,
            &self.configuration,
            metrics_tx.clone(),
        )?;

        // A per-user channel lets the parent tell this one runner to exit.
        let (parent_sender, thread_receiver) = flume::unbounded::<RunnerCommand>();
        user_channels.push(parent_sender);
        handles.push(tokio::spawn(runner::user_main(
            user,
            scenario,
            policy,
            thread_receiver,
            report_tx.clone(),
        )));
        self.metrics.users_started += 1;

        Ok(())
    }

    async fn receive_outcomes(&mut self, metrics_rx: &flume::Receiver<StepOutcome>) {
        while let Ok(outcome) = metrics_rx.try_recv() {
            self.metrics.record_outcome(&outcome);
            if let Some(sink) = &self.sink {
                sink.record(outcome).await;
            }
        }
    }

    fn set_phase(&mut self, phase: RunPhase) {
        debug!("phase change: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}
