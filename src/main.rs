mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use nailgun_runner::{exit_code_for_nailgun_error, telemetry_init, NailgunError};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    telemetry_init(cli.verbose);

    match commands::dispatch(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nailgun-runner: {e:#}");
            match e.downcast_ref::<NailgunError>() {
                Some(ng) => ExitCode::from(exit_code_for_nailgun_error(ng)),
                None => ExitCode::from(1),
            }
        }
    }
}
