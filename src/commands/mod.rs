mod signals;

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::cli::{Cli, Command};
use nailgun_runner::{
    detect_jvm_version, split_classpath, ExecutorConfig, NailgunError, NailgunExecutor,
    NailgunStdio, ServerRequest,
};

/// Default workdir name under the buildroot.
const WORKDIR_NAME: &str = ".nailgun";

fn exit_code_from_remote(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn executor(cli: &Cli) -> Result<NailgunExecutor> {
    let buildroot = match &cli.buildroot {
        Some(p) => p.clone(),
        None => env::current_dir().context("failed to determine the current directory")?,
    };
    let buildroot = buildroot
        .canonicalize()
        .with_context(|| format!("buildroot {} is not accessible", buildroot.display()))?;
    let workdir = cli
        .workdir
        .clone()
        .unwrap_or_else(|| buildroot.join(WORKDIR_NAME));
    debug!(
        "buildroot {} workdir {}",
        buildroot.display(),
        workdir.display()
    );
    Ok(NailgunExecutor::new(buildroot, workdir, ExecutorConfig::from_env()))
}

pub(crate) fn dispatch(cli: &Cli) -> Result<ExitCode> {
    debug!(
        "nailgun-runner build={} target={} profile={} rust={} ver={}",
        env!("NAILGUN_RUNNER_BUILD_DATE"),
        env!("NAILGUN_RUNNER_BUILD_TARGET"),
        env!("NAILGUN_RUNNER_BUILD_PROFILE"),
        env!("NAILGUN_RUNNER_BUILD_RUSTC"),
        env!("CARGO_PKG_VERSION")
    );
    let executor = executor(cli)?;
    match &cli.command {
        Command::Run {
            classpath,
            jvm_options,
            jvm_version,
            cwd,
            main_class,
            args,
        } => {
            let classpath: Vec<String> =
                classpath.iter().flat_map(|c| split_classpath(c)).collect();
            let jvm_version = match jvm_version {
                Some(v) => v.clone(),
                None => detect_jvm_version(&executor.config().java).unwrap_or_else(|| {
                    warn!(
                        "could not determine the version of {}; \
                         servers will not be told apart by JVM version",
                        executor.config().java.display()
                    );
                    "unknown".to_string()
                }),
            };
            let request = ServerRequest {
                jvm_options: jvm_options.clone(),
                classpath,
                jvm_version,
            };
            run(&executor, &request, main_class, args, cwd.clone())
        }
        Command::Find { json } => find(&executor, *json),
        Command::Kill => {
            let pids = executor.kill()?;
            report_killed(&pids);
            Ok(ExitCode::SUCCESS)
        }
        Command::Killall { everywhere } => {
            let pids = executor.killall(*everywhere)?;
            report_killed(&pids);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn report_killed(pids: &[u32]) {
    if pids.is_empty() {
        eprintln!("nailgun-runner: no nailgun servers to kill");
    }
    for pid in pids {
        eprintln!("nailgun-runner: killed nailgun server pid {pid}");
    }
}

fn find(executor: &NailgunExecutor, json: bool) -> Result<ExitCode> {
    let found = executor.find()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(ExitCode::SUCCESS);
    }
    match found {
        Some(endpoint) => {
            println!("{endpoint}");
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!(
                "nailgun-runner: no nailgun server running for {}",
                executor.workdir().display()
            );
            Ok(ExitCode::from(1))
        }
    }
}

fn run(
    executor: &NailgunExecutor,
    request: &ServerRequest,
    main_class: &str,
    args: &[String],
    cwd: Option<PathBuf>,
) -> Result<ExitCode> {
    signals::install_signal_handlers();
    let stdio = NailgunStdio::inherit().context("failed to attach local stdio")?;
    let mut client = executor.get_client(request, stdio)?;
    let canceller = client.canceller();

    let env: BTreeMap<String, String> = env::vars().collect();
    let result = {
        let _watcher = signals::InterruptWatcher::start(canceller.clone())
            .context("failed to start interrupt watcher")?;
        client.execute(main_class, args, &env, cwd.as_deref())
    };

    match result {
        Ok(code) => Ok(exit_code_from_remote(code)),
        Err(e @ NailgunError::Cancelled { .. }) => {
            warn!("{e}; killing nailgun server");
            canceller.maybe_send_signal(Signal::SIGKILL);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
