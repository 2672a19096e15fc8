use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Validate a ':'-separated classpath argument.
fn validate_classpath(s: &str) -> Result<String, String> {
    if s.split(':').all(|e| e.is_empty()) {
        Err("classpath must name at least one entry".to_string())
    } else {
        Ok(s.to_string())
    }
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Run a JVM main class on the workspace's warm Nailgun server, starting one if needed
    Run {
        /// Server classpath entries (repeatable; each may itself be ':'-separated)
        #[arg(long = "classpath", short = 'c', required = true, value_parser = validate_classpath)]
        classpath: Vec<String>,

        /// JVM option for the server, e.g. -Xmx1g (repeatable)
        #[arg(long = "jvm-option", short = 'J', allow_hyphen_values = true)]
        jvm_options: Vec<String>,

        /// JVM version string used in the server fingerprint (default: probed from `java -version`)
        #[arg(long = "jvm-version")]
        jvm_version: Option<String>,

        /// Working directory of the remote invocation (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Fully qualified main class to run
        main_class: String,

        /// Arguments passed through to the main class
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Show the warm server owned by the workdir
    Find {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Kill the server owned by the workdir
    Kill,
    /// Kill every server started for this buildroot
    Killall {
        /// Kill servers of every buildroot on this host
        #[arg(long)]
        everywhere: bool,
    },
}

/// `--version` output with the metadata baked in by build.rs.
pub(crate) const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\nbuild: ",
    env!("NAILGUN_RUNNER_BUILD_DATE"),
    "\ntarget: ",
    env!("NAILGUN_RUNNER_BUILD_TARGET"),
    "\nprofile: ",
    env!("NAILGUN_RUNNER_BUILD_PROFILE"),
    "\nrustc: ",
    env!("NAILGUN_RUNNER_BUILD_RUSTC"),
);

const AFTER_LONG_HELP: &str = "Examples:
  nailgun-runner run -c tools.jar:nailgun.jar org.example.Main -- --flag
  nailgun-runner find --json
  nailgun-runner killall --everywhere

";

#[derive(Parser, Debug)]
#[command(
    name = "nailgun-runner",
    version,
    long_version = LONG_VERSION,
    about = "Run JVM main classes through a warm, per-workspace Nailgun server.",
    after_long_help = AFTER_LONG_HELP
)]
pub(crate) struct Cli {
    /// Print detailed execution info
    #[arg(long, global = true)]
    pub(crate) verbose: bool,

    /// Build root the servers belong to (default: current directory)
    #[arg(long, global = true)]
    pub(crate) buildroot: Option<PathBuf>,

    /// Directory holding server logs and the spawn lock (default: <buildroot>/.nailgun)
    #[arg(long, global = true)]
    pub(crate) workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Command,
}
