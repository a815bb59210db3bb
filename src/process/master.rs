// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    ffi::CString,
    os::unix::ffi::OsStrExt,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};

use anyhow::{Context, Result};
use nix::{
    sys::{
        signal::Signal,
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, execve, fork},
};
use tracing::{error, info, warn};

use crate::{
    cfg::{config::Config, logger::LoggerHandle},
    event::{EventLoop, TimerId},
    net::TcpListener,
    process::{
        app::SetupFn,
        pid::PidFile,
        signals::signal_child,
        worker::{self, ServiceKind, ServiceProcess},
    },
};

/// Environment variable carrying the listener fds (`fd1;fd2;…;`) across
/// a binary-upgrade exec.
pub const LISTENER_ENV: &str = "PORTICO";

struct Child {
    pid: Pid,
    kind: ServiceKind,
    /// Set once the master asked this child to exit; children gone
    /// without it are respawned.
    exiting: bool,
}

struct MasterInner {
    cfg: Config,
    config_path: Option<PathBuf>,
    directives: Vec<String>,
    setup: Option<SetupFn>,
    logger: Rc<LoggerHandle>,
    pid_file: PidFile,
    listener: TcpListener,
    children: Vec<Child>,
    kill_timer: Option<TimerId>,
    shutting_down: bool,
    /// Pid of an exec'ed replacement binary; its early death means the
    /// upgrade failed and the pid file comes back.
    new_binary: Option<Pid>,
}

/// The supervising master process.
///
/// Owns the listening socket (shared with workers across fork) but no
/// client connections. Runs its own EventLoop whose only inputs are
/// signals: child reaping and respawn, fast/graceful stop with SIGKILL
/// escalation, configuration reload by generation swap, log reopen and
/// binary upgrade.
#[derive(Clone)]
pub struct Master {
    inner: Rc<RefCell<MasterInner>>,
}

impl Master {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        config_path: Option<PathBuf>,
        directives: Vec<String>,
        setup: Option<SetupFn>,
        logger: Rc<LoggerHandle>,
        pid_file: PidFile,
        listener: TcpListener,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(MasterInner {
                cfg,
                config_path,
                directives,
                setup,
                logger,
                pid_file,
                listener,
                children: Vec::new(),
                kill_timer: None,
                shutting_down: false,
                new_binary: None,
            })),
        }
    }

    pub fn run(&self) -> Result<()> {
        let mut el = EventLoop::new()?;
        info!(pid = std::process::id(), "master starting");

        self.spawn_generation()?;
        self.install_signals(&mut el)?;

        el.run()?;

        info!("master stopped");
        Ok(())
    }

    fn install_signals(&self, el: &mut EventLoop) -> Result<()> {
        let master = self.clone();
        el.add_signal(Signal::SIGCHLD, move |el, _| {
            master.reap_children(el);
        })?;

        for signal in [Signal::SIGTERM, Signal::SIGINT] {
            let master = self.clone();
            el.add_signal(signal, move |el, _| {
                master.fast_stop(el);
            })?;
        }

        let master = self.clone();
        el.add_signal(Signal::SIGQUIT, move |el, _| {
            master.graceful_stop(el);
        })?;

        let master = self.clone();
        el.add_signal(Signal::SIGHUP, move |el, _| {
            master.reload(el);
        })?;

        let master = self.clone();
        el.add_signal(Signal::SIGUSR1, move |_el, _| {
            master.reopen_logs();
        })?;

        let master = self.clone();
        el.add_signal(Signal::SIGUSR2, move |_el, _| {
            master.upgrade_binary();
        })?;
        Ok(())
    }

    // ── child management ─────────────────────────────────────────────────

    fn spawn_generation(&self) -> Result<()> {
        let (workers, helper) = {
            let inner = self.inner.borrow();
            (inner.cfg.process.workers, inner.cfg.process.helper)
        };
        for _ in 0..workers {
            self.spawn_child(ServiceKind::Worker)?;
        }
        if helper {
            self.spawn_child(ServiceKind::Helper)?;
        }
        Ok(())
    }

    fn spawn_child(&self, kind: ServiceKind) -> Result<()> {
        // Copy everything the child needs before forking; the child
        // never touches the master state.
        let (cfg, setup, logger, listener_fd) = {
            let inner = self.inner.borrow();
            (
                inner.cfg.clone(),
                inner.setup.clone(),
                Rc::clone(&inner.logger),
                inner.listener.fd(),
            )
        };

        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { child } => {
                info!(pid = child.as_raw(), role = ?kind, "child spawned");
                self.inner.borrow_mut().children.push(Child {
                    pid: child,
                    kind,
                    exiting: false,
                });
                Ok(())
            },
            ForkResult::Child => {
                let inherited = match kind {
                    ServiceKind::Helper => None,
                    _ => Some(listener_fd),
                };
                let code = match worker::run(ServiceProcess {
                    cfg,
                    kind,
                    setup,
                    logger,
                    inherited_fd: inherited,
                }) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(error = %e, "service process failed");
                        1
                    },
                };
                std::process::exit(code);
            },
        }
    }

    /// SIGCHLD: reap with WNOHANG, respawn abnormal deaths, finish the
    /// shutdown when the last child is gone.
    fn reap_children(&self, el: &mut EventLoop) {
        loop {
            let status =
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG))
                {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(status) => status,
                    Err(_) => break,
                };
            let (pid, abnormal) = match status {
                WaitStatus::Exited(pid, code) => (pid, code != 0),
                WaitStatus::Signaled(pid, signal, _) => {
                    warn!(pid = pid.as_raw(), signal = %signal,
                          "child killed by signal");
                    (pid, true)
                },
                _ => continue,
            };
            self.on_child_gone(el, pid, abnormal);
        }

        let (done, timer) = {
            let mut inner = self.inner.borrow_mut();
            let done = inner.shutting_down && inner.children.is_empty();
            (done, if done { inner.kill_timer.take() } else { None })
        };
        if done {
            if let Some(timer) = timer {
                el.cancel_timer(timer);
            }
            info!("all children exited");
            el.stop();
        }
    }

    fn on_child_gone(&self, _el: &mut EventLoop, pid: Pid, abnormal: bool) {
        let respawn_kind = {
            let mut inner = self.inner.borrow_mut();

            if inner.new_binary == Some(pid) {
                // The exec'ed replacement died before taking over.
                inner.new_binary = None;
                error!("new binary exited, restoring pid file");
                if let Err(e) = inner.pid_file.restore_from_oldbin() {
                    error!(error = %e, "pid file restore failed");
                }
                return;
            }

            let Some(pos) =
                inner.children.iter().position(|c| c.pid == pid)
            else {
                return;
            };
            let child = inner.children.remove(pos);
            info!(pid = pid.as_raw(), role = ?child.kind, abnormal,
                  "child reaped");

            if !child.exiting && abnormal && !inner.shutting_down {
                Some(child.kind)
            } else {
                None
            }
        };

        if let Some(kind) = respawn_kind {
            warn!(role = ?kind, "respawning child");
            if let Err(e) = self.spawn_child(kind) {
                error!(error = %e, "respawn failed");
            }
        }
    }

    // ── stop paths ───────────────────────────────────────────────────────

    /// TERM/INT: TERM the children and arm the SIGKILL escalation timer;
    /// the timer is cancelled when the last child is reaped first.
    fn fast_stop(&self, el: &mut EventLoop) {
        let arm = {
            let mut inner = self.inner.borrow_mut();
            if inner.shutting_down {
                false
            } else {
                inner.shutting_down = true;
                for child in &mut inner.children {
                    child.exiting = true;
                    let _ = signal_child(child.pid, Signal::SIGTERM);
                }
                !inner.children.is_empty()
            }
        };
        if !arm {
            if self.inner.borrow().children.is_empty() {
                el.stop();
            }
            return;
        }

        info!("fast stop: TERM sent, kill timer armed");
        let timeout = Duration::from_secs(
            self.inner.borrow().cfg.process.kill_timeout_secs,
        );
        let master = self.clone();
        let timer = el.add_timer(timeout, move |_el| {
            let inner = master.inner.borrow();
            for child in &inner.children {
                warn!(pid = child.pid.as_raw(), "escalating to SIGKILL");
                let _ = signal_child(child.pid, Signal::SIGKILL);
            }
        });
        self.inner.borrow_mut().kill_timer = Some(timer);
    }

    /// QUIT: ask children to drain and wait indefinitely.
    fn graceful_stop(&self, el: &mut EventLoop) {
        let empty = {
            let mut inner = self.inner.borrow_mut();
            inner.shutting_down = true;
            for child in &mut inner.children {
                child.exiting = true;
                let _ = signal_child(child.pid, Signal::SIGQUIT);
            }
            inner.children.is_empty()
        };
        info!("graceful stop: QUIT sent");
        if empty {
            el.stop();
        }
    }

    /// HUP: re-read the config, spawn a fresh generation, drain the old.
    fn reload(&self, _el: &mut EventLoop) {
        info!("reload requested");
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(path) = inner.config_path.clone() {
                match Config::load_from_file(&path, &inner.directives) {
                    Ok(cfg) => inner.cfg = cfg,
                    Err(e) => {
                        error!(error = %e,
                               "reload aborted, keeping old config");
                        return;
                    },
                }
            }
            for child in &mut inner.children {
                child.exiting = true;
            }
        }

        let old: Vec<Pid> = self
            .inner
            .borrow()
            .children
            .iter()
            .map(|c| c.pid)
            .collect();

        if let Err(e) = self.spawn_generation() {
            error!(error = %e, "reload spawn failed");
            return;
        }

        for pid in old {
            let _ = signal_child(pid, Signal::SIGQUIT);
        }
    }

    /// USR1: reopen our own sink and tell the children.
    fn reopen_logs(&self) {
        info!("reopening logs");
        let inner = self.inner.borrow();
        inner.logger.reopen();
        for child in &inner.children {
            let _ = signal_child(child.pid, Signal::SIGUSR1);
        }
    }

    /// USR2: exec the (possibly replaced) binary, handing the listening
    /// socket over through the environment.
    fn upgrade_binary(&self) {
        info!("binary upgrade requested");
        let inner = self.inner.borrow();
        if let Err(e) = inner.pid_file.rename_to_oldbin() {
            error!(error = %e, "upgrade aborted");
            return;
        }
        if let Err(e) = inner.listener.clear_cloexec() {
            error!(error = %e, "upgrade aborted");
            let _ = inner.pid_file.restore_from_oldbin();
            return;
        }
        let listener_fd = inner.listener.fd();
        drop(inner);

        match spawn_new_binary(listener_fd) {
            Ok(pid) => {
                info!(pid = pid.as_raw(), "new binary started");
                // The replacement owns the port now; shed our workers
                // gracefully and let them finish in-flight requests.
                let mut inner = self.inner.borrow_mut();
                inner.new_binary = Some(pid);
                for child in &mut inner.children {
                    child.exiting = true;
                    let _ = signal_child(child.pid, Signal::SIGQUIT);
                }
            },
            Err(e) => {
                error!(error = %e, "exec of new binary failed");
                let _ =
                    self.inner.borrow().pid_file.restore_from_oldbin();
            },
        }
    }
}

/// Forks and execs the current executable with `PORTICO=fd;` in its
/// environment, inheriting the listening socket.
fn spawn_new_binary(listener_fd: i32) -> Result<Pid> {
    let exe = std::env::current_exe()
        .context("cannot resolve current executable")?;
    let exe_c = CString::new(exe.as_os_str().as_bytes())
        .context("executable path contains NUL")?;

    let args: Vec<CString> = std::env::args()
        .map(CString::new)
        .collect::<Result<_, _>>()
        .context("argv contains NUL")?;

    let mut env: Vec<CString> = std::env::vars()
        .filter(|(key, _)| key != LISTENER_ENV)
        .map(|(key, value)| CString::new(format!("{key}={value}")))
        .collect::<Result<_, _>>()
        .context("environment contains NUL")?;
    env.push(
        CString::new(format!("{LISTENER_ENV}={listener_fd};"))
            .context("listener env contains NUL")?,
    );

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let err = execve(&exe_c, &args, &env)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            // Only reached when exec failed.
            eprintln!("execve failed: {err}");
            std::process::exit(1);
        },
    }
}

/// Parses the inherited-listener environment (`fd1;fd2;…;`), consuming
/// the variable so children do not re-adopt it.
pub fn take_inherited_listeners() -> Vec<i32> {
    let Ok(value) = std::env::var(LISTENER_ENV) else {
        return Vec::new();
    };
    // Remove before any fork happens; safe this early in startup.
    unsafe { std::env::remove_var(LISTENER_ENV) };
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
