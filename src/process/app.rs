// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::Result;
use tracing::info;

use crate::{
    cfg::{
        cli::Options,
        config::Config,
        logger::LoggerHandle,
    },
    event::EventLoop,
    net::TcpListener,
    pg::PgPool,
    process::{
        daemon::daemonize,
        master::{Master, take_inherited_listeners},
        pid::PidFile,
        worker::{self, ServiceKind, ServiceProcess},
    },
    server::HttpServer,
};

/// The role this invocation plays, resolved from configuration (the
/// signaller is selected earlier, from the command line).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Single,
    Master,
    Worker,
    Helper,
    Signaller,
}

impl ProcessRole {
    pub fn role_name(self) -> &'static str {
        match self {
            ProcessRole::Single => "single",
            ProcessRole::Master => "master",
            ProcessRole::Worker => "worker",
            ProcessRole::Helper => "helper",
            ProcessRole::Signaller => "signaller",
        }
    }

    /// `master=false` means a single process unless `helper=true` makes
    /// it a standalone helper; `master=true` always wins.
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.process.master {
            ProcessRole::Master
        } else if cfg.process.helper {
            ProcessRole::Helper
        } else {
            ProcessRole::Single
        }
    }
}

/// What a worker-setup hook gets to wire the service together: register
/// modules on the server, start pool subscriptions, arm timers.
pub struct WorkerContext<'a> {
    pub cfg: &'a Config,
    pub el: &'a mut EventLoop,
    pub server: &'a HttpServer,
    pub pool: Option<&'a PgPool>,
}

/// Per-worker service wiring, invoked in every worker/helper/single
/// process after its EventLoop and pool exist but before serving starts.
pub type SetupFn = Rc<dyn Fn(&mut WorkerContext<'_>) -> Result<()>>;

/// Top-level application: applies CLI overrides, selects the role and
/// runs it to completion.
pub struct Application {
    cfg: Config,
    config_path: Option<PathBuf>,
    directives: Vec<String>,
    setup: Option<SetupFn>,
}

impl Application {
    /// Folds the command-line overrides into the loaded configuration.
    pub fn new(mut cfg: Config, opts: &Options) -> Self {
        if let Some(workers) = opts.workers {
            cfg.process.workers = workers;
        }
        if opts.foreground {
            cfg.process.daemon = false;
        }
        if let Some(locale) = &opts.locale {
            cfg.process.locale = locale.clone();
        }
        if let Some(prefix) = &opts.prefix {
            cfg.process.prefix = prefix.to_string_lossy().into_owned();
        }
        Self {
            cfg,
            config_path: opts.config_path.clone(),
            directives: opts.directives.clone(),
            setup: None,
        }
    }

    /// Installs the per-worker service wiring.
    pub fn on_worker_setup<F>(&mut self, setup: F)
    where F: Fn(&mut WorkerContext<'_>) -> Result<()> + 'static {
        self.setup = Some(Rc::new(setup));
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn role(&self) -> ProcessRole {
        ProcessRole::from_config(&self.cfg)
    }

    pub fn pid_file(&self) -> PidFile {
        PidFile::new(resolve_path(
            &self.cfg.process.prefix,
            &self.cfg.process.pid_file,
        ))
    }

    /// Runs the selected role. Blocks until the service stops.
    pub fn run(self, logger: Rc<LoggerHandle>) -> Result<()> {
        let role = self.role();
        info!(role = role.role_name(), "process role selected");

        if self.cfg.process.daemon {
            daemonize()?;
        }

        // A binary upgrade hands the bound sockets down through the
        // environment; adopt instead of binding afresh.
        let inherited = take_inherited_listeners();

        match role {
            ProcessRole::Master => {
                let listener = match inherited.first() {
                    Some(&fd) => TcpListener::from_inherited(fd)?,
                    None => worker::bind_listener(&self.cfg)?,
                };
                let pid_file = self.pid_file();
                pid_file.write(std::process::id() as i32)?;
                let master = Master::new(
                    self.cfg,
                    self.config_path,
                    self.directives,
                    self.setup,
                    logger,
                    pid_file.clone(),
                    listener,
                );
                let result = master.run();
                pid_file.remove();
                result
            },
            ProcessRole::Helper => worker::run(ServiceProcess {
                cfg: self.cfg,
                kind: ServiceKind::Helper,
                setup: self.setup,
                logger,
                inherited_fd: None,
            }),
            _ => {
                let pid_file = self.pid_file();
                pid_file.write(std::process::id() as i32)?;
                let result = worker::run(ServiceProcess {
                    cfg: self.cfg,
                    kind: ServiceKind::Single,
                    setup: self.setup,
                    logger,
                    inherited_fd: inherited.first().copied(),
                });
                pid_file.remove();
                result
            },
        }
    }
}

/// Resolves a possibly-relative path against the installation prefix.
pub fn resolve_path(prefix: &str, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() || prefix.is_empty() {
        p.to_path_buf()
    } else {
        Path::new(prefix).join(p)
    }
}
