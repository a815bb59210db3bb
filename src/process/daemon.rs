// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use nix::{
    fcntl::{OFlag, open},
    sys::stat::Mode,
    unistd::{ForkResult, chdir, close, dup2, fork, setsid},
};

/// Classic double-fork daemonisation: detach from the controlling
/// terminal, become a session leader, drop into `/` and point stdio at
/// `/dev/null`. The intermediate parents exit immediately.
pub fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {},
    }

    chdir("/").context("chdir / failed")?;

    let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .context("cannot open /dev/null")?;
    for stdio in 0..=2 {
        dup2(devnull, stdio).context("dup2 stdio failed")?;
    }
    if devnull > 2 {
        let _ = close(devnull);
    }
    Ok(())
}
