//! Entrypoint for the quay connection daemon.
//!
//! Delegates to [`quayd::run_daemon`]. Launch failures are written to
//! stderr because telemetry may not be installed when they occur.

use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match quayd::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let mut stderr = io::stderr().lock();
            let _ = writeln!(stderr, "quayd: {error}");
            ExitCode::FAILURE
        }
    }
}
