//! Log setup for the `grader` binary.
//!
//! Grader diagnostics (rate limit decisions, guard timeouts, recovered
//! check errors) are operator-facing and go to stderr. The run summary on
//! stdout and the results file are what the submitter sees, so log lines
//! never mix into either.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber; a second call keeps the first one.
///
/// `RUST_LOG` overrides `level`, e.g. `RUST_LOG=grader_core::rate_limit=debug`
/// to trace token accounting. `json` switches to one JSON object per line
/// for platforms that collect grader logs.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
