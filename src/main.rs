// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::rc::Rc;

use anyhow::{Context, Result};
use portico::{
    cfg::{
        cli::{self, CliAction, Options},
        config::{Config, apply_directives},
        logger::init_logger,
    },
    http::{HttpResponse, HttpStatus, util::reply_error},
    pg::PgPool,
    process::{Application, WorkerContext, signals},
    route::{RouteManager, RoutedModule},
};
use tracing::error;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let opts = match Options::parse(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("portico: {e}");
            eprint!("{}", cli::USAGE);
            return 2;
        },
    };

    match opts.action {
        CliAction::ShowVersion => {
            println!("portico {}", env!("CARGO_PKG_VERSION"));
            0
        },
        CliAction::ShowBuildInfo => {
            println!("{}", cli::build_info());
            0
        },
        CliAction::ShowHelp => {
            print!("{}", cli::USAGE);
            0
        },
        CliAction::TestConfig => match load_config(&opts) {
            Ok(_) => {
                println!("configuration ok");
                0
            },
            Err(e) => {
                eprintln!("configuration invalid: {e:#}");
                1
            },
        },
        CliAction::Signal(command) => {
            let cfg = match load_config(&opts) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("portico: {e:#}");
                    return 1;
                },
            };
            let app = Application::new(cfg, &opts);
            match signals::run_signaller(&app.pid_file(), command) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("portico: {e:#}");
                    1
                },
            }
        },
        CliAction::Run => match serve(opts) {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %format!("{e:#}"), "fatal");
                eprintln!("portico: {e:#}");
                1
            },
        },
    }
}

fn load_config(opts: &Options) -> Result<Config> {
    match &opts.config_path {
        Some(path) => Config::load_from_file(path, &opts.directives)
            .with_context(|| format!("loading {path:?}")),
        None => {
            // No file: defaults plus whatever -g directives supply.
            let mut raw = serde_json::to_value(Config::default())
                .context("cannot serialise default config")?;
            apply_directives(&mut raw, &opts.directives)?;
            Config::from_value(raw)
        },
    }
}

fn serve(opts: Options) -> Result<()> {
    let cfg = load_config(&opts)?;
    let logger = Rc::new(init_logger(&cfg.log)?);

    let mut app = Application::new(cfg, &opts);
    app.on_worker_setup(|ctx: &mut WorkerContext<'_>| {
        ctx.server
            .register_module(Box::new(status_module(ctx.pool.cloned())));
        Ok(())
    });
    app.run(logger)
}

/// The built-in service surface: a health endpoint plus, when a pool is
/// configured, a deferred database round trip.
fn status_module(pool: Option<PgPool>) -> RoutedModule {
    let mut routes = RouteManager::new();
    routes.set_info("portico", env!("CARGO_PKG_VERSION"));

    routes
        .add_route("GET", "/status", |_el, _req, resp, _params| {
            resp.set_status(HttpStatus::Ok)
                .set_body(r#"{"status":"ok"}"#, "application/json");
        })
        .summary("Service health")
        .tag("Health")
        .response(200, "OK");

    if let Some(pool) = pool {
        routes
            .add_route("GET", "/db/now", move |el, _req, resp, _params| {
                let done = resp.defer();
                pool.execute(el, "SELECT now() AS now", move |el, results| {
                    let mut resp = HttpResponse::new();
                    match results.first() {
                        Some(r) if r.ok() => {
                            let now = r.value(0, 0).unwrap_or("");
                            resp.set_status(HttpStatus::Ok).set_body(
                                format!("{{\"now\":\"{now}\"}}"),
                                "application/json",
                            );
                        },
                        Some(r) => {
                            reply_error(&mut resp, 502, r.error_message());
                        },
                        None => {
                            reply_error(&mut resp, 502, "no result");
                        },
                    }
                    done.complete(el, resp);
                });
            })
            .summary("Database clock")
            .tag("Health")
            .response(200, "OK")
            .response(502, "Database unavailable");
    }

    RoutedModule::new("status", routes)
}
