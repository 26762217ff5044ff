use gumdrop::Options;
use httpmock::MockServer;

use stampede::config::Configuration;
use stampede::metrics::LoadTestMetrics;
use stampede::LoadTest;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --host <mock-server>
///  --users 1
///  --hatch-rate 1
///  --no-print-metrics
#[allow(dead_code)]
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> Configuration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];
    // Declare server_url here no matter what, so its lifetime is sufficient when needed.
    let server_url = server.base_url();

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to using the mock server if not otherwise configured.
    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", &server_url]);
    }

    // Default to testing with 1 user if not otherwise configured.
    if !configuration.contains(&"--users") {
        configuration.extend_from_slice(&["--users", "1"]);
    }

    // Default to hatching 1 user per second if not otherwise configured.
    if !configuration.contains(&"--hatch-rate") {
        configuration.extend_from_slice(&["--hatch-rate", "1"]);
    }

    // The tests assert against the metrics object directly.
    if !configuration.contains(&"--no-print-metrics") {
        configuration.push("--no-print-metrics");
    }

    // Parse these options to generate a Configuration.
    Configuration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run the load test to completion, returning the collected metrics.
#[allow(dead_code)]
pub fn run_load_test(load_test: LoadTest) -> LoadTestMetrics {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(load_test.execute())
        .expect("load test failed")
}
