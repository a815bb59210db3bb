// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::sys::signal::Signal;

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

/// The `-s` commands understood by signaller mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalCommand {
    Stop,
    Quit,
    Reopen,
    Reload,
    Upgrade,
}

impl SignalCommand {
    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "stop" => Self::Stop,
            "quit" => Self::Quit,
            "reopen" => Self::Reopen,
            "reload" => Self::Reload,
            "upgrade" => Self::Upgrade,
            other => bail!(
                "unknown signal {other:?} \
                 (expected stop|quit|reopen|reload|upgrade)"
            ),
        })
    }

    /// The signal the running master receives.
    pub fn signal(self) -> Signal {
        match self {
            Self::Stop => Signal::SIGTERM,
            Self::Quit => Signal::SIGQUIT,
            Self::Reopen => Signal::SIGUSR1,
            Self::Reload => Signal::SIGHUP,
            Self::Upgrade => Signal::SIGUSR2,
        }
    }
}

/// What the invocation asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliAction {
    /// Normal service start.
    Run,
    /// `-v` / `--version`.
    ShowVersion,
    /// `-V`: build/configure summary.
    ShowBuildInfo,
    /// `-h` / `--help`.
    ShowHelp,
    /// `-t`: validate the config and exit.
    TestConfig,
    /// `-s <signal>`: signal a running instance and exit.
    Signal(SignalCommand),
}

/// Parsed command line.
#[derive(Debug, Clone)]
pub struct Options {
    pub action: CliAction,
    pub config_path: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub workers: Option<usize>,
    /// `-d`: stay in the foreground regardless of the config.
    pub foreground: bool,
    pub locale: Option<String>,
    /// `-g key=value` inline config overrides, applied in order.
    pub directives: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            action: CliAction::Run,
            config_path: None,
            prefix: None,
            workers: None,
            foreground: false,
            locale: None,
            directives: Vec::new(),
        }
    }
}

impl Options {
    /// Parses the argument list (without the program name).
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut opts = Options::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-v" | "--version" => opts.action = CliAction::ShowVersion,
                "-V" => opts.action = CliAction::ShowBuildInfo,
                "-h" | "--help" => opts.action = CliAction::ShowHelp,
                "-t" | "--test" => opts.action = CliAction::TestConfig,
                "-d" => opts.foreground = true,
                "-c" => {
                    let value = args.next().context("-c requires a path")?;
                    opts.config_path = Some(PathBuf::from(value));
                },
                "-p" => {
                    let value =
                        args.next().context("-p requires a prefix")?;
                    opts.prefix = Some(PathBuf::from(value));
                },
                "-w" => {
                    let value = args.next().context("-w requires a count")?;
                    let workers = value.parse().with_context(|| {
                        format!("invalid worker count {value:?}")
                    })?;
                    opts.workers = Some(workers);
                },
                "-l" => {
                    opts.locale =
                        Some(args.next().context("-l requires a locale")?);
                },
                "-g" => {
                    opts.directives.push(
                        args.next().context("-g requires a directive")?,
                    );
                },
                "-s" => {
                    let value =
                        args.next().context("-s requires a signal name")?;
                    opts.action =
                        CliAction::Signal(SignalCommand::parse(&value)?);
                },
                other => bail!("unknown option {other:?}"),
            }
        }
        Ok(opts)
    }
}

pub const USAGE: &str = "\
usage: portico [options]

options:
  -v, --version      print version and exit
  -V                 print build information and exit
  -h, --help         print this help and exit
  -t, --test         validate the configuration and exit
  -c <path>          configuration file
  -p <prefix>        override installation prefix
  -w <n>             override worker count
  -d                 run in the foreground
  -l <locale>        set the locale
  -g <key=value>     set a configuration directive
  -s <signal>        send a signal to a running instance:
                     stop | quit | reopen | reload | upgrade
";

/// One-line build summary for `-V`.
pub fn build_info() -> String {
    format!(
        "portico {} ({} {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}
