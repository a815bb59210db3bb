// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cfg::enums::{LogFormat, LogOutput, RotationFreq},
    pg::protocol::PgConnInfo,
};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    /// Listening socket parameters.
    #[serde(default)]
    pub server: ServerConfig,
    /// Process model: master/worker/helper split, daemonisation, pid file.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Logging sink and level.
    #[serde(default)]
    pub log: LogConfig,
    /// PostgreSQL broker settings; absent section disables the pool.
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
    /// Per-module configuration blobs, keyed by module name. Opaque to
    /// the core; handed to modules verbatim.
    #[serde(default)]
    pub modules: HashMap<String, Value>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Listen address; empty binds the dual-stack wildcard.
    #[serde(default)]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: String::new(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProcessConfig {
    /// Run a supervising master with forked workers.
    #[serde(default)]
    pub master: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Spawn a background helper process (no listening socket).
    #[serde(default)]
    pub helper: bool,
    /// Detach from the terminal on startup.
    #[serde(default)]
    pub daemon: bool,
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    /// Seconds a fast stop waits before escalating TERM to KILL.
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_secs: u64,
    /// Installation prefix for relative paths.
    #[serde(default)]
    pub prefix: String,
    /// Locale applied at startup (`-l` overrides).
    #[serde(default)]
    pub locale: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            master: false,
            workers: default_workers(),
            helper: false,
            daemon: false,
            pid_file: default_pid_file(),
            kill_timeout_secs: default_kill_timeout(),
            prefix: String::new(),
            locale: String::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_output")]
    pub output: LogOutput,
    #[serde(default = "default_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            output: default_output(),
            format: default_format(),
            file: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFileConfig {
    pub path: String,
    #[serde(default)]
    pub rotation_frequency: Option<RotationFreq>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PostgresConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub dbname: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_pg_min")]
    pub min_connections: usize,
    #[serde(default = "default_pg_max")]
    pub max_connections: usize,
}

impl PostgresConfig {
    /// Conninfo: config values win, unset fields fall back to the PG*
    /// environment.
    pub fn conninfo(&self) -> PgConnInfo {
        let mut info = PgConnInfo::from_env();
        if let Some(host) = &self.host {
            info.host = host.clone();
        }
        if let Some(port) = self.port {
            info.port = port;
        }
        if let Some(dbname) = &self.dbname {
            info.dbname = dbname.clone();
        }
        if let Some(user) = &self.user {
            info.user = user.clone();
        }
        if let Some(password) = &self.password {
            info.password = password.clone();
        }
        info
    }
}

fn default_port() -> u16 {
    8080
}
fn default_backlog() -> i32 {
    511
}
fn default_workers() -> usize {
    2
}
fn default_pid_file() -> String {
    "portico.pid".to_string()
}
fn default_kill_timeout() -> u64 {
    10
}
fn default_level() -> String {
    "info".to_string()
}
fn default_output() -> LogOutput {
    LogOutput::Stderr
}
fn default_format() -> LogFormat {
    LogFormat::Text
}
fn default_pg_min() -> usize {
    1
}
fn default_pg_max() -> usize {
    4
}

impl Config {
    /// Loads the configuration from JSON, applies `-g` directives,
    /// validates it and returns the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(
        path: P,
        directives: &[String],
    ) -> Result<Self> {
        let text = fs::read_to_string(&path).with_context(|| {
            format!("cannot read config {:?}", path.as_ref())
        })?;
        let mut raw: Value = serde_json::from_str(&text)
            .context("failed to parse config JSON")?;
        apply_directives(&mut raw, directives)?;
        let mut cfg: Config = serde_json::from_value(raw)
            .context("config does not match the expected schema")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// In-memory construction for embedders and tests.
    pub fn from_value(raw: Value) -> Result<Self> {
        let mut cfg: Config = serde_json::from_value(raw)
            .context("config does not match the expected schema")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.server.port != 0, "server.port must not be 0");
        ensure!(self.server.backlog > 0, "server.backlog must be positive");

        if self.process.master {
            ensure!(
                self.process.workers >= 1,
                "process.workers must be >= 1 when master is on"
            );
        }
        ensure!(
            self.process.kill_timeout_secs >= 1,
            "process.kill_timeout_secs must be >= 1"
        );
        ensure!(
            !self.process.pid_file.is_empty(),
            "process.pid_file must not be empty"
        );

        if let Some(pg) = &self.postgres {
            ensure!(
                pg.min_connections >= 1,
                "postgres.min_connections must be >= 1"
            );
            ensure!(
                pg.max_connections >= pg.min_connections,
                "postgres.max_connections must be >= min_connections"
            );
        }
        Ok(())
    }

    /// Module section by name, when present.
    pub fn module_config(&self, name: &str) -> Option<&Value> {
        self.modules.get(name)
    }
}

/// Applies `-g` overrides onto a raw config document.
pub fn apply_directives(raw: &mut Value, directives: &[String]) -> Result<()> {
    for directive in directives {
        apply_directive(raw, directive)?;
    }
    Ok(())
}

/// Applies one `-g section.key=value` override onto the raw document.
/// Values parse as JSON when possible and fall back to plain strings.
fn apply_directive(raw: &mut Value, directive: &str) -> Result<()> {
    let Some((path, value)) = directive.split_once('=') else {
        bail!("directive {directive:?} is not of the form key=value");
    };
    let parsed: Value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));

    let parts: Vec<&str> = path.trim().split('.').collect();
    ensure!(
        !parts.iter().any(|p| p.is_empty()),
        "empty path component in {directive:?}"
    );
    let Some((last, parents)) = parts.split_last() else {
        bail!("empty path in {directive:?}");
    };

    let mut node = raw;
    for part in parents {
        let map = node.as_object_mut().with_context(|| {
            format!("{path:?} does not address an object")
        })?;
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    node.as_object_mut()
        .with_context(|| format!("{path:?} does not address an object"))?
        .insert(last.to_string(), parsed);
    Ok(())
}
