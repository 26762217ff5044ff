//! A list of things that typically must be imported to build a Stampede load
//! test.
//!
//! Instead of manually importing everything each time you build a load test,
//! you can simply import this prelude:
//!
//! ```rust
//! use stampede::prelude::*;
//! ```

pub use crate::config::Configuration;
pub use crate::metrics::{
    ChannelSink, LoadTestMetrics, MetricsSink, RampAction, RampHistory, StepClassification,
    StepMetrics, StepOutcome,
};
pub use crate::policy::{FailurePolicy, PolicyAction, DEFAULT_MAX_CONSECUTIVE_FAILURES};
pub use crate::runner::{AbortReason, TerminalState, UserLifecycle, UserReport, VirtualUser};
pub use crate::scenario::{
    BodyPredicate, CredentialsSource, Precondition, Scenario, SelectionPolicy, StateUpdate,
    StepSpec,
};
pub use crate::session::{Credentials, ProductRecord, SessionState};
pub use crate::{LoadTest, LoadTestError, RunPhase};
