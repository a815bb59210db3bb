// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, os::fd::RawFd, rc::Rc, time::Duration};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;
use tracing::info;

use crate::{
    cfg::{config::Config, logger::LoggerHandle},
    event::EventLoop,
    net::TcpListener,
    pg::{PgPool, pool::PgPoolConfig},
    process::app::{SetupFn, WorkerContext},
    server::HttpServer,
};

/// Which flavour of service process this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Standalone process: serves and handles terminal signals itself.
    Single,
    /// Forked child of a master; serves client traffic.
    Worker,
    /// Forked (or standalone) background process; no listening socket.
    Helper,
}

/// Everything one service process needs to run.
pub struct ServiceProcess {
    pub cfg: Config,
    pub kind: ServiceKind,
    pub setup: Option<SetupFn>,
    pub logger: Rc<LoggerHandle>,
    /// A listening socket inherited from the master (fork) or from the
    /// old binary (upgrade); `None` means bind afresh.
    pub inherited_fd: Option<RawFd>,
}

/// Runs one worker/helper/single service loop to completion.
///
/// TERM stops accepting and drains in-flight work; QUIT additionally
/// closes idle connections first; USR1 reopens the log sink. Resource
/// teardown order is fixed: server and pool unregister their watches
/// before the EventLoop is dropped.
pub fn run(service: ServiceProcess) -> Result<()> {
    let ServiceProcess { cfg, kind, setup, logger, inherited_fd } = service;
    info!(role = role_name(kind), pid = std::process::id(), "starting");

    let mut el = EventLoop::new()?;
    let server = HttpServer::new();

    let pool = match &cfg.postgres {
        Some(pg) => {
            let pool = PgPool::new(PgPoolConfig {
                info: pg.conninfo(),
                min: pg.min_connections,
                max: pg.max_connections,
            });
            pool.start(&mut el)?;
            Some(pool)
        },
        None => None,
    };

    if let Some(setup) = &setup {
        let mut ctx = WorkerContext {
            cfg: &cfg,
            el: &mut el,
            server: &server,
            pool: pool.as_ref(),
        };
        setup(&mut ctx).context("worker setup failed")?;
    }

    if kind == ServiceKind::Helper {
        server.start_background(&mut el);
    } else {
        let listener = match inherited_fd {
            Some(fd) => TcpListener::from_inherited(fd)?,
            None => bind_listener(&cfg)?,
        };
        server.listen(&mut el, listener)?;
    }

    install_signals(&mut el, kind, &server, &logger)?;

    el.run()?;

    server.shutdown(&mut el);
    if let Some(pool) = &pool {
        pool.shutdown(&mut el);
    }
    info!(role = role_name(kind), "stopped");
    Ok(())
}

fn role_name(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::Single => "single",
        ServiceKind::Worker => "worker",
        ServiceKind::Helper => "helper",
    }
}

/// Binds per the `server` config section; an empty listen address means
/// the dual-stack wildcard.
pub fn bind_listener(cfg: &Config) -> Result<TcpListener> {
    if cfg.server.listen.is_empty() {
        return TcpListener::bind_any(cfg.server.port, cfg.server.backlog);
    }
    let ip = cfg
        .server
        .listen
        .parse()
        .with_context(|| {
            format!("invalid listen address {:?}", cfg.server.listen)
        })?;
    TcpListener::bind(
        SocketAddr::new(ip, cfg.server.port),
        cfg.server.backlog,
    )
}

fn install_signals(
    el: &mut EventLoop,
    kind: ServiceKind,
    server: &HttpServer,
    logger: &Rc<LoggerHandle>,
) -> Result<()> {
    // TERM: stop accepting, finish in-flight requests, exit. Idle
    // keep-alive connections are left alone; if they linger past the
    // master's kill timeout, SIGKILL settles it.
    {
        let server = server.clone();
        el.add_signal(Signal::SIGTERM, move |el, _| {
            info!("TERM received, draining");
            begin_drain(el, &server, false);
        })?;
    }
    // QUIT: drop idle connections, drain the active ones, exit.
    {
        let server = server.clone();
        el.add_signal(Signal::SIGQUIT, move |el, _| {
            info!("QUIT received, closing idle connections");
            begin_drain(el, &server, true);
        })?;
    }
    // Single processes face the terminal directly.
    if kind == ServiceKind::Single {
        let server = server.clone();
        el.add_signal(Signal::SIGINT, move |el, _| {
            info!("INT received, draining");
            begin_drain(el, &server, true);
        })?;
    }
    {
        let logger = Rc::clone(logger);
        el.add_signal(Signal::SIGUSR1, move |_el, _| {
            info!("USR1 received, reopening logs");
            logger.reopen();
        })?;
    }
    Ok(())
}

/// Initiates drain and polls until every connection is gone, then stops
/// the loop.
fn begin_drain(el: &mut EventLoop, server: &HttpServer, close_idle: bool) {
    server.stop_accepting(el);
    if close_idle {
        server.close_idle(el);
    }
    if server.is_drained() {
        el.stop();
        return;
    }
    let server = server.clone();
    el.add_periodic(
        Duration::from_millis(100),
        Duration::from_millis(100),
        move |el| {
            if server.is_drained() {
                el.stop();
            }
        },
    );
}
