//! Functions and structures related to configuring a load test.
//!
//! Stampede is configured at run time by passing in the options and flags
//! defined by the [`Configuration`] structure, derived with
//! [`gumdrop`](https://docs.rs/gumdrop/). Run configuration is consumed by the
//! core, never produced: the scenario decides what each user does, the
//! configuration decides how many users do it, how fast, and for how long.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::path::PathBuf;

use crate::LoadTestError;

/// Runtime options available when launching a load test.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Stampede simulates concurrent virtual users replaying scripted multi-step
HTTP transactions against a target service.

The following runtime options are available when launching a load test:"#
)]
pub struct Configuration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,

    /// Defines host to load test (ie http://10.21.32.33)
    #[options(short = "H")]
    pub host: String,
    /// Sets concurrent virtual users (default: 1)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user spawn rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Stops load test this long after ramp-up completes (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Stops each user after this many task iterations
    #[options(short = "i", meta = "COUNT")]
    pub iterations: usize,
    /// Sets per-request timeout in seconds (default: 60)
    #[options(no_short, meta = "SECONDS")]
    pub timeout: Option<usize>,
    /// Aborts a user after this many consecutive step failures (default: 10)
    #[options(no_short, meta = "COUNT")]
    pub max_consecutive_failures: Option<usize>,
    /// Replaces aborted users while the load test is running
    #[options(no_short)]
    pub backfill: bool,
    /// Default minimum think time between steps, in seconds
    #[options(no_short, meta = "SECONDS")]
    pub think_time_min: Option<usize>,
    /// Default maximum think time between steps, in seconds
    #[options(no_short, meta = "SECONDS")]
    pub think_time_max: Option<usize>,
    /// Doesn't display metrics at end of load test
    #[options(no_short)]
    pub no_print_metrics: bool,

    /// Enables log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases console verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases console verbosity (-v, -vv, etc)
    #[options(count, short = "v")]
    pub verbose: u8,
}

impl Configuration {
    /// Confirm the configuration is internally consistent before launching.
    pub(crate) fn validate(&self) -> Result<(), LoadTestError> {
        if let Some(users) = self.users {
            if users == 0 {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.users`".to_string(),
                    value: "0".to_string(),
                    detail: "`configuration.users` must be set to at least 1.".to_string(),
                });
            }
        }

        if let (Some(min), Some(max)) = (self.think_time_min, self.think_time_max) {
            if min > max {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.think_time_min`".to_string(),
                    value: min.to_string(),
                    detail: "`configuration.think_time_min` can not be larger than `configuration.think_time_max`."
                        .to_string(),
                });
            }
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err(LoadTestError::InvalidOption {
                    option: "`configuration.timeout`".to_string(),
                    value: "0".to_string(),
                    detail: "`configuration.timeout` must be set to at least 1 second.".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Optionally initialize the logger, writing to standard out and/or to a
    /// configurable log file.
    pub(crate) fn initialize_logger(&self) -> Result<(), LoadTestError> {
        // Configure console output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                1 => LevelFilter::Warn,
                _ => LevelFilter::Error,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        if !self.log_file.is_empty() {
            let log_to_file = PathBuf::from(&self.log_file);
            let file = std::fs::File::create(&log_to_file)?;
            match CombinedLogger::init(vec![
                SimpleLogger::new(debug_level, Config::default()),
                WriteLogger::new(log_level, Config::default(), file),
            ]) {
                Ok(_) => (),
                Err(e) => {
                    // Tests initialize the logger repeatedly; only the first wins.
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
            info!("writing to log file: {}", log_to_file.display());
        } else {
            match CombinedLogger::init(vec![SimpleLogger::new(debug_level, Config::default())]) {
                Ok(_) => (),
                Err(e) => {
                    info!("failed to initialize CombinedLogger: {}", e);
                }
            }
        }

        Ok(())
    }
}
