//! Declarative scenario and step definitions.
//!
//! A [`Scenario`] is the ordered set of steps one virtual user performs: a setup
//! chain run once (signup, login, catalog fetch) followed by a repeating body of
//! task steps. Steps are plain [`StepSpec`] values registered in declaration
//! order, not callbacks: the request template, the success contract, and the
//! session update a step performs are all data, validated when the load test
//! starts.
//!
//! # Example
//! ```rust
//! use stampede::prelude::*;
//! use serde_json::json;
//!
//! let scenario = Scenario::new("CheckoutFlow")
//!     .register_setup(
//!         StepSpec::post("Login", "/api/users/login", json!({
//!             "email": "{email}",
//!             "password": "{password}",
//!         }))
//!         .set_expected_status(&[200])
//!         .set_predicate(BodyPredicate::HasField("accessToken".to_string()))
//!         .set_state_update(StateUpdate::StoreAuthToken("accessToken".to_string())),
//!     )
//!     .register_task(StepSpec::get("View Cart", "/api/cart/view"));
//!
//! assert!(scenario.validate().is_ok());
//! ```

use std::collections::HashSet;
use std::time::Duration;

use http::Method;
use rand::Rng;
use serde_json::Value;

use crate::session;
use crate::LoadTestError;

// Session fields every virtual user can always resolve.
const BASELINE_VARIABLES: [&str; 4] = ["name", "email", "password", "address"];

/// How the next task step is chosen each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Every task step executes exactly once per iteration, in declared order.
    SequentialCyclic,
    /// Exactly one task step is sampled per iteration, proportionally to weight.
    WeightedRandom,
}

/// A condition checked before a step's request is rendered or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// The session catalog must hold at least one product; when it does, a
    /// uniformly random product is selected for this step's templates.
    NonEmptyCatalog,
}

/// A check applied to the response body after the status matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPredicate {
    /// The JSON body must be an object containing the named field.
    HasField(String),
    /// The JSON body must be an array whose records all contain the named field.
    ArrayOfRecordsWith(String),
}

/// How a successful step mutates the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// The step leaves the session untouched.
    None,
    /// Store the named response field as the session auth token.
    StoreAuthToken(String),
    /// Replace the session catalog with the response array, extracting each
    /// record's `_id` field.
    StoreCatalog,
}

/// Where a virtual user's credentials come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsSource {
    /// Unique throwaway credentials generated per user.
    Generated,
    /// One pre-provisioned account shared by every user.
    Fixed { email: String, password: String },
}

/// One templated request plus its classification contract.
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// The name of the step, used for metrics labeling.
    pub name: String,
    /// The HTTP method used to dispatch the request.
    pub method: Method,
    /// Path template, may reference session fields (ie `/api/products/{product_id}`).
    pub path: String,
    /// Optional JSON payload template, placeholders allowed in string values.
    pub payload: Option<Value>,
    /// Response statuses classified as Success.
    pub expected_status: Vec<u16>,
    /// Optional check applied to the response body.
    pub predicate: Option<BodyPredicate>,
    /// Session mutation applied when the step succeeds.
    pub state_update: StateUpdate,
    /// Optional condition gating the request; unmet means Skipped.
    pub precondition: Option<Precondition>,
    /// Whether a failure of this step aborts the whole session.
    pub abort_on_failure: bool,
    /// Relative sampling weight under Weighted-Random; 0 excludes the step.
    pub weight: usize,
}

impl StepSpec {
    /// Create a GET step expecting a 200 response.
    pub fn get(name: &str, path: &str) -> Self {
        StepSpec::new(name, Method::GET, path, None)
    }

    /// Create a POST step with a JSON payload template, expecting a 200 response.
    pub fn post(name: &str, path: &str, payload: Value) -> Self {
        StepSpec::new(name, Method::POST, path, Some(payload))
    }

    fn new(name: &str, method: Method, path: &str, payload: Option<Value>) -> Self {
        trace!("new step: name: {}", name);
        StepSpec {
            name: name.to_string(),
            method,
            path: path.to_string(),
            payload,
            expected_status: vec![200],
            predicate: None,
            state_update: StateUpdate::None,
            precondition: None,
            abort_on_failure: false,
            weight: 1,
        }
    }

    /// Replace the set of response statuses classified as Success.
    pub fn set_expected_status(mut self, statuses: &[u16]) -> Self {
        self.expected_status = statuses.to_vec();
        self
    }

    /// Require a body check in addition to the status check.
    pub fn set_predicate(mut self, predicate: BodyPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Declare how the session changes when this step succeeds.
    pub fn set_state_update(mut self, update: StateUpdate) -> Self {
        self.state_update = update;
        self
    }

    /// Gate the request on a session precondition.
    pub fn set_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Abort the session when this step fails. Setup steps always abort.
    pub fn set_abort_on_failure(mut self, abort: bool) -> Self {
        self.abort_on_failure = abort;
        self
    }

    /// Set the relative weight used under Weighted-Random selection. A weight
    /// of zero excludes the step from selection.
    pub fn set_weight(mut self, weight: usize) -> Self {
        trace!("{} set_weight: {}", self.name, weight);
        self.weight = weight;
        self
    }

    // All template variables this step references, across path and payload.
    fn referenced_variables(&self) -> Vec<String> {
        let mut variables = session::template_variables(&self.path);
        if let Some(payload) = &self.payload {
            variables.extend(session::payload_variables(payload));
        }
        variables
    }

    // Which variables a Success outcome of this step makes resolvable.
    fn provided_variables(&self) -> Vec<&'static str> {
        match self.state_update {
            StateUpdate::None => Vec::new(),
            StateUpdate::StoreAuthToken(_) => vec!["access_token"],
            StateUpdate::StoreCatalog => vec!["product_id"],
        }
    }
}

/// The ordered, weighted set of steps a virtual user performs. Immutable once
/// the load test starts; validated before any user is launched.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// The name of the scenario, used in logs.
    pub name: String,
    /// An optional default host to run this scenario against.
    pub host: Option<String>,
    /// Where each user's credentials come from.
    pub credentials: CredentialsSource,
    pub(crate) setup: Vec<StepSpec>,
    pub(crate) tasks: Vec<StepSpec>,
    pub(crate) selection: SelectionPolicy,
    pub(crate) wait_time: Option<(Duration, Duration)>,
    pub(crate) one_shot: bool,
}

impl Scenario {
    /// Creates a new Scenario. Once created, steps must be registered with it,
    /// and finally it must be registered with the LoadTest object.
    pub fn new(name: &str) -> Self {
        trace!("new scenario: name: {}", name);
        Scenario {
            name: name.to_string(),
            host: None,
            credentials: CredentialsSource::Generated,
            setup: Vec::new(),
            tasks: Vec::new(),
            selection: SelectionPolicy::SequentialCyclic,
            wait_time: None,
            one_shot: false,
        }
    }

    /// Append a step to the setup chain, run once and in order before any task
    /// step. Setup steps are unconditionally abort-on-failure.
    pub fn register_setup(mut self, mut step: StepSpec) -> Self {
        trace!("{} register_setup: {}", self.name, step.name);
        step.abort_on_failure = true;
        self.setup.push(step);
        self
    }

    /// Append a step to the repeatable task body.
    pub fn register_task(mut self, step: StepSpec) -> Self {
        trace!("{} register_task: {}", self.name, step.name);
        self.tasks.push(step);
        self
    }

    /// Choose how task steps are selected each iteration.
    pub fn set_selection_policy(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    /// Set a default host for the scenario, used when the `--host` option is
    /// not set at run time.
    pub fn set_host(mut self, host: &str) -> Self {
        trace!("{} set_host: {}", self.name, host);
        self.host = Some(host.to_string());
        self
    }

    /// Configure where each user's credentials come from.
    pub fn set_credentials(mut self, credentials: CredentialsSource) -> Self {
        self.credentials = credentials;
        self
    }

    /// Configure users to pause after each step, for a duration sampled
    /// uniformly from `min_wait..=max_wait`.
    pub fn set_wait_time(
        mut self,
        min_wait: Duration,
        max_wait: Duration,
    ) -> Result<Self, LoadTestError> {
        trace!(
            "{} set_wait_time: min: {:?} max: {:?}",
            self.name,
            min_wait,
            max_wait
        );
        if min_wait > max_wait {
            return Err(LoadTestError::InvalidWaitTime {
                min_wait,
                max_wait,
                detail: "`min_wait` can't be larger than `max_wait`".to_string(),
            });
        }
        self.wait_time = Some((min_wait, max_wait));
        Ok(self)
    }

    /// Stop each user after exactly one full cycle of task steps, instead of
    /// repeating until the run budget is exhausted.
    pub fn set_one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Confirm every template variable is producible by some prior step and
    /// the selection policy has at least one eligible step. Configuration
    /// errors surface here, before any user is launched.
    pub fn validate(&self) -> Result<(), LoadTestError> {
        let mut available: HashSet<&str> = BASELINE_VARIABLES.iter().copied().collect();

        for step in &self.setup {
            self.validate_step(step, &available)?;
            available.extend(step.provided_variables());
        }

        // Under Weighted-Random tasks run in no guaranteed order, so a task may
        // only rely on variables provided by the setup chain. Under
        // Sequential-Cyclic earlier tasks also count.
        let sequential = self.selection == SelectionPolicy::SequentialCyclic;
        let mut task_available = available.clone();
        for step in &self.tasks {
            self.validate_step(step, &task_available)?;
            if sequential {
                task_available.extend(step.provided_variables());
            }
        }

        if self.selection == SelectionPolicy::WeightedRandom
            && !self.tasks.is_empty()
            && self.tasks.iter().all(|step| step.weight == 0)
        {
            return Err(LoadTestError::InvalidWeight {
                weight: 0,
                detail: format!(
                    "scenario {} has no task step with a non-zero weight",
                    self.name
                ),
            });
        }

        Ok(())
    }

    fn validate_step(
        &self,
        step: &StepSpec,
        available: &HashSet<&str>,
    ) -> Result<(), LoadTestError> {
        for variable in step.referenced_variables() {
            let producible = match variable.as_str() {
                // The selected product only exists when this step is gated on a
                // non-empty catalog filled by a prior step; without the gate an
                // empty catalog would fail instead of skipping.
                "product_id" => {
                    available.contains("product_id")
                        && step.precondition == Some(Precondition::NonEmptyCatalog)
                }
                other => available.contains(other),
            };
            if !producible {
                return Err(LoadTestError::InvalidTemplate {
                    step: step.name.clone(),
                    variable: variable.clone(),
                    detail: format!(
                        "template variable {{{}}} is not producible by any prior step",
                        variable
                    ),
                });
            }
        }
        Ok(())
    }

    /// Sample one task step index, with probability proportional to weight.
    /// Returns None when no task step carries a non-zero weight.
    pub(crate) fn pick_weighted_task(&self) -> Option<usize> {
        self.pick_weighted_task_with(&mut rand::thread_rng())
    }

    pub(crate) fn pick_weighted_task_with<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let total: usize = self.tasks.iter().map(|step| step.weight).sum();
        if total == 0 {
            return None;
        }
        // Walk the cumulative weights; equal weights tie-break in declaration
        // order by construction.
        let mut remaining = rng.gen_range(0..total);
        for (index, step) in self.tasks.iter().enumerate() {
            if remaining < step.weight {
                return Some(index);
            }
            remaining -= step.weight;
        }
        unreachable!("weighted sample exceeded total weight");
    }
}
