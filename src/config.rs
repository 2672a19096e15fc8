//! Executor settings: defaults plus `NAILGUN_RUNNER_*` environment overrides.
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use which::which;

use crate::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_NG_HOST};

pub const DEFAULT_SERVER_MAIN: &str = "com.martiansoftware.nailgun.NGServer";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEBUG_STARTUP_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CONNECT_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub java: PathBuf,
    pub server_main: String,
    pub host: String,
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_retry_sleep: Duration,
    pub startup_timeout: Duration,
    pub debug_startup_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            java: PathBuf::from("java"),
            server_main: DEFAULT_SERVER_MAIN.to_string(),
            host: DEFAULT_NG_HOST.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_retry_sleep: DEFAULT_CONNECT_RETRY_SLEEP,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            debug_startup_timeout: DEFAULT_DEBUG_STARTUP_TIMEOUT,
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_duration(name: &str, default: Duration) -> Duration {
    match env_nonempty(name) {
        None => default,
        Some(raw) => humantime::parse_duration(&raw).unwrap_or_else(|e| {
            warn!("ignoring {name}={raw:?}: {e}; using {default:?}");
            default
        }),
    }
}

fn env_parsed<N: FromStr + std::fmt::Debug>(name: &str, default: N) -> N
where
    N::Err: std::fmt::Display,
{
    match env_nonempty(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("ignoring {name}={raw:?}: {e}; using {default:?}");
            default
        }),
    }
}

/// The JVM launcher: NAILGUN_RUNNER_JAVA, else $JAVA_HOME/bin/java, else `java` on PATH.
pub fn resolve_java() -> PathBuf {
    if let Some(java) = env_nonempty("NAILGUN_RUNNER_JAVA") {
        return PathBuf::from(java);
    }
    if let Some(home) = env_nonempty("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join("java");
        if candidate.is_file() {
            return candidate;
        }
    }
    which("java").unwrap_or_else(|_| PathBuf::from("java"))
}

static JAVA_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"version\s+"([^"]+)""#).expect("valid java version pattern"));

/// Version from `java -version` output, e.g. `openjdk version "17.0.9" 2023-10-17`.
pub fn parse_java_version(output: &str) -> Option<String> {
    JAVA_VERSION_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Ask `java` for its version; None when it cannot be run or its output is unrecognized.
pub fn detect_jvm_version(java: &Path) -> Option<String> {
    let out = Command::new(java)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| debug!("failed to run {} -version: {e}", java.display()))
        .ok()?;
    // The JVM prints its version banner on stderr.
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&out.stderr),
        String::from_utf8_lossy(&out.stdout)
    );
    parse_java_version(&text)
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let mut connect_attempts =
            env_parsed("NAILGUN_RUNNER_CONNECT_ATTEMPTS", d.connect_attempts);
        if connect_attempts == 0 {
            warn!("NAILGUN_RUNNER_CONNECT_ATTEMPTS must be at least 1; using 1");
            connect_attempts = 1;
        }
        Self {
            java: resolve_java(),
            server_main: env_nonempty("NAILGUN_RUNNER_SERVER_MAIN").unwrap_or(d.server_main),
            host: env_nonempty("NAILGUN_RUNNER_HOST").unwrap_or(d.host),
            connect_timeout: env_duration("NAILGUN_RUNNER_CONNECT_TIMEOUT", d.connect_timeout),
            connect_attempts,
            connect_retry_sleep: d.connect_retry_sleep,
            startup_timeout: env_duration("NAILGUN_RUNNER_STARTUP_TIMEOUT", d.startup_timeout),
            debug_startup_timeout: env_duration(
                "NAILGUN_RUNNER_DEBUG_STARTUP_TIMEOUT",
                d.debug_startup_timeout,
            ),
        }
    }
}
