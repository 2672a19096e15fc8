use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter directives override, e.g. `NAILGUN_RUNNER_LOG=nailgun_runner=trace`.
pub const LOG_ENV: &str = "NAILGUN_RUNNER_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directives in effect: `NAILGUN_RUNNER_LOG`, else `debug` when verbose, else `warn`.
pub fn filter_directives(verbose: bool) -> String {
    env::var(LOG_ENV)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "warn" }.to_string())
}

/// Install the stderr fmt subscriber once per process. Stdout stays reserved for the
/// remote process's output.
pub fn telemetry_init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }

    let directives = filter_directives(verbose);
    let env_filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("nailgun-runner: invalid {LOG_ENV} {directives:?} ({e}); using warn");
        EnvFilter::new("warn")
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("nailgun-runner: logging init skipped (global subscriber already set)");
        return;
    }

    let _ = INIT.set(());
}
