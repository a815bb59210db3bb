// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
};

use crate::cfg::{
    config::LogConfig,
    enums::{LogFormat, LogOutput, RotationFreq},
};

/// A file sink that can be re-opened in place, for the SIGUSR1
/// "reopen logs" contract (log rotation via external tools).
#[derive(Clone)]
pub struct ReopenableFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl ReopenableFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = open_append(&path)?;
        Ok(Self { path, file: Arc::new(Mutex::new(file)) })
    }

    /// Closes the current handle and opens the path again; when the
    /// reopen fails the old handle stays in place.
    pub fn reopen(&self) {
        match open_append(&self.path) {
            Ok(new_file) => {
                if let Ok(mut guard) = self.file.lock() {
                    *guard = new_file;
                }
            },
            Err(e) => {
                eprintln!("log reopen failed for {:?}: {e}", self.path);
            },
        }
    }
}

fn open_append(path: &PathBuf) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("cannot create log directory {parent:?}")
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {path:?}"))
}

impl Write for ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut guard) => guard.write(buf),
            Err(_) => Err(io::Error::other("log file lock poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut guard) => guard.flush(),
            Err(_) => Ok(()),
        }
    }
}

/// Keeps the reopen hook for the file sink.
///
/// All sinks write synchronously: a preforking server cannot use a
/// background writer thread, it would not survive fork().
pub struct LoggerHandle {
    reopen: Option<ReopenableFile>,
}

impl LoggerHandle {
    /// Reopens the file sink when one is configured (SIGUSR1).
    pub fn reopen(&self) {
        if let Some(file) = &self.reopen {
            file.reopen();
        }
    }
}

/// Initialises the global tracing subscriber from the `log` config
/// section. Call once per process lifetime, before any fork.
pub fn init_logger(cfg: &LogConfig) -> Result<LoggerHandle> {
    let (writer, reopen) = make_writer(cfg)?;

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    match cfg.format {
        LogFormat::Json => {
            let layer =
                fmt::layer().with_writer(writer).with_ansi(false).json();
            let subscriber =
                Registry::default().with(env_filter).with(layer);
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set global default subscriber")?;
        },
        LogFormat::Text => {
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let subscriber =
                Registry::default().with(env_filter).with(layer);
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to set global default subscriber")?;
        },
    }

    Ok(LoggerHandle { reopen })
}

fn make_writer(
    cfg: &LogConfig,
) -> Result<(BoxMakeWriter, Option<ReopenableFile>)> {
    Ok(match cfg.output {
        LogOutput::Stdout => (BoxMakeWriter::new(io::stdout), None),
        LogOutput::Stderr => (BoxMakeWriter::new(io::stderr), None),
        LogOutput::File => {
            let fcfg = cfg
                .file
                .clone()
                .context("log.file is required for output=file")?;
            let path = PathBuf::from(&fcfg.path);
            let rotation =
                fcfg.rotation_frequency.unwrap_or(RotationFreq::Never);

            match rotation {
                RotationFreq::Never => {
                    let file = ReopenableFile::open(path)?;
                    let writer = file.clone();
                    (
                        BoxMakeWriter::new(move || writer.clone()),
                        Some(file),
                    )
                },
                freq => {
                    let dir = path
                        .parent()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("."));
                    let name = path
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_default();
                    let rotation = match freq {
                        RotationFreq::Minutely => Rotation::MINUTELY,
                        RotationFreq::Hourly => Rotation::HOURLY,
                        RotationFreq::Daily => Rotation::DAILY,
                        RotationFreq::Never => Rotation::NEVER,
                    };
                    let appender = Arc::new(Mutex::new(
                        RollingFileAppender::new(rotation, dir, name),
                    ));
                    let writer = LockedAppender { inner: appender };
                    (
                        BoxMakeWriter::new(move || writer.clone()),
                        None,
                    )
                },
            }
        },
    })
}

/// Serialises writes to the rolling appender across threads.
#[derive(Clone)]
struct LockedAppender {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl Write for LockedAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.lock() {
            Ok(mut guard) => guard.write(buf),
            Err(_) => Err(io::Error::other("appender lock poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.lock() {
            Ok(mut guard) => guard.flush(),
            Err(_) => Ok(()),
        }
    }
}
