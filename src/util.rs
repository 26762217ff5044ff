//! Utility functions used by Stampede, and available when writing load tests.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use regex::Regex;
use url::Url;

use crate::LoadTestError;

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    match usize::from_str(time_str) {
        // If an integer is passed in, assume it's seconds.
        Ok(t) => {
            trace!("{} is integer: {} seconds", time_str, t);
            t
        }
        // Otherwise use a regex to extract hours, minutes and seconds from string.
        Err(_) => {
            let re = Regex::new(r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?")
                .unwrap();
            let time_matches = re.captures(time_str).unwrap();
            let hours = match time_matches.name("hours") {
                Some(_) => usize::from_str(&time_matches["hours"]).unwrap(),
                None => 0,
            };
            let minutes = match time_matches.name("minutes") {
                Some(_) => usize::from_str(&time_matches["minutes"]).unwrap(),
                None => 0,
            };
            let seconds = match time_matches.name("seconds") {
                Some(_) => usize::from_str(&time_matches["seconds"]).unwrap(),
                None => 0,
            };
            let total = hours * 60 * 60 + minutes * 60 + seconds;
            trace!(
                "{} hours {} minutes {} seconds: {} seconds",
                hours,
                minutes,
                seconds,
                total
            );
            total
        }
    }
}

/// Convert the optional `--hatch-rate` string to users-per-second, defaulting
/// to launching one user per second.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// assert_eq!(util::get_hatch_rate(None), 1.0);
/// assert_eq!(util::get_hatch_rate(Some("0.5".to_string())), 0.5);
/// assert_eq!(util::get_hatch_rate(Some("foo".to_string())), 1.0);
/// ```
pub fn get_hatch_rate(hatch_rate: Option<String>) -> f32 {
    match hatch_rate {
        Some(value) => match f32::from_str(&value) {
            Ok(rate) if rate > 0.0 => rate,
            _ => {
                warn!("invalid hatch_rate `{}`, defaulting to 1", value);
                1.0
            }
        },
        None => 1.0,
    }
}

/// Confirm a host can be parsed as a URL.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // IP with port is a valid URL.
/// assert_eq!(util::is_valid_host("http://127.0.0.1:5000").is_ok(), true);
///
/// // Protocol is required.
/// assert_eq!(util::is_valid_host("example.com/").is_ok(), false);
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, LoadTestError> {
    Url::parse(host).map_err(|parse_error| LoadTestError::InvalidHost {
        host: host.to_string(),
        detail: "invalid host".to_string(),
        parse_error,
    })?;
    Ok(true)
}

/// Determine if a timer started at `started` has been running for `elapsed` ms.
pub(crate) fn ms_timer_expired(started: time::Instant, elapsed: usize) -> bool {
    started.elapsed().as_millis() as usize >= elapsed
}

// Internal helper to configure the control-c handler. Shut down cleanly on the
// first ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler(canceled: &Arc<AtomicBool>) {
    let ctrlc_canceled = Arc::clone(canceled);
    match ctrlc::set_handler(move || {
        if ctrlc_canceled.load(Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            ctrlc_canceled.store(true, Ordering::SeqCst);
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            // When running in tests a handler already exists; each load test
            // still observes its own cancellation flag.
            info!("ctrl-c handler not replaced: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0"), 0);
        assert_eq!(parse_timespan("foo"), 0);
        assert_eq!(parse_timespan("1"), 1);
        assert_eq!(parse_timespan("1s"), 1);
        assert_eq!(parse_timespan("1m"), 60);
        assert_eq!(parse_timespan("61"), 61);
        assert_eq!(parse_timespan("1m1s"), 61);
        assert_eq!(parse_timespan("10m"), 600);
        assert_eq!(parse_timespan("10m5s"), 605);
        assert_eq!(parse_timespan("60m"), 3600);
        assert_eq!(parse_timespan("1h"), 3600);
        assert_eq!(parse_timespan("1h15s"), 3615);
        assert_eq!(parse_timespan("1h5m"), 3900);
        assert_eq!(parse_timespan("1h5m13s"), 3913);
        assert_eq!(parse_timespan("2h"), 7200);
    }

    #[test]
    fn hatch_rate() {
        assert_eq!(get_hatch_rate(None), 1.0);
        assert_eq!(get_hatch_rate(Some("2".to_string())), 2.0);
        assert_eq!(get_hatch_rate(Some("0.25".to_string())), 0.25);
        assert_eq!(get_hatch_rate(Some("0".to_string())), 1.0);
        assert_eq!(get_hatch_rate(Some("-1".to_string())), 1.0);
    }

    #[test]
    fn valid_host() {
        assert!(is_valid_host("http://localhost/").is_ok());
        assert!(is_valid_host("http://127.0.0.1:5000").is_ok());
        assert!(is_valid_host("https://example.com/foo").is_ok());
        assert!(is_valid_host("example.com").is_err());
        assert!(is_valid_host("").is_err());
    }
}
