// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tracing::info;

use crate::{cfg::cli::SignalCommand, process::pid::PidFile};

/// `-s <signal>` mode: read the pid file, deliver the mapped signal to
/// the running master (or single) and return its exit code.
pub fn run_signaller(
    pid_file: &PidFile,
    command: SignalCommand,
) -> Result<i32> {
    let pid = match pid_file.read() {
        Ok(pid) => pid,
        Err(e) => {
            // Nothing to signal is not an error for `stop`/`quit`.
            if matches!(
                command,
                SignalCommand::Stop | SignalCommand::Quit
            ) {
                info!(error = %e, "no running instance");
                return Ok(0);
            }
            return Err(e);
        },
    };

    let signal = command.signal();
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => {
            info!(pid, signal = %signal, "signal sent");
            Ok(0)
        },
        Err(Errno::ESRCH) => {
            info!(pid, "process not running");
            Ok(0)
        },
        Err(e) => {
            Err(e).with_context(|| format!("cannot signal pid {pid}"))
        },
    }
}

/// Sends `signal` to a child, tolerating an already-gone process.
pub fn signal_child(pid: Pid, signal: Signal) -> Result<()> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => bail!("kill({pid}, {signal}) failed: {e}"),
    }
}
