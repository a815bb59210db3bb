// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use nix::sys::signal::Signal;
use portico::cfg::cli::{CliAction, Options, SignalCommand};

fn parse(args: &[&str]) -> Result<Options> {
    Options::parse(args.iter().copied())
}

#[test]
fn version_flags() -> Result<()> {
    assert_eq!(parse(&["-v"])?.action, CliAction::ShowVersion);
    assert_eq!(parse(&["--version"])?.action, CliAction::ShowVersion);
    assert_eq!(parse(&["-V"])?.action, CliAction::ShowBuildInfo);
    Ok(())
}

#[test]
fn help_flags() -> Result<()> {
    assert_eq!(parse(&["-h"])?.action, CliAction::ShowHelp);
    assert_eq!(parse(&["--help"])?.action, CliAction::ShowHelp);
    Ok(())
}

#[test]
fn test_config_with_path() -> Result<()> {
    let opts = parse(&["-t", "-c", "/etc/portico.json"])?;
    assert_eq!(opts.action, CliAction::TestConfig);
    assert_eq!(
        opts.config_path.as_deref(),
        Some(std::path::Path::new("/etc/portico.json"))
    );
    Ok(())
}

#[test]
fn run_options() -> Result<()> {
    let opts = parse(&[
        "-c", "cfg.json", "-p", "/opt/portico", "-w", "8", "-d", "-l",
        "en_US.UTF-8", "-g", "server.port=9000", "-g",
        "process.master=true",
    ])?;
    assert_eq!(opts.action, CliAction::Run);
    assert_eq!(opts.workers, Some(8));
    assert!(opts.foreground);
    assert_eq!(opts.locale.as_deref(), Some("en_US.UTF-8"));
    assert_eq!(
        opts.prefix.as_deref(),
        Some(std::path::Path::new("/opt/portico"))
    );
    assert_eq!(opts.directives.len(), 2);
    Ok(())
}

#[test]
fn signaller_commands() -> Result<()> {
    for (name, signal) in [
        ("stop", Signal::SIGTERM),
        ("quit", Signal::SIGQUIT),
        ("reopen", Signal::SIGUSR1),
        ("reload", Signal::SIGHUP),
        ("upgrade", Signal::SIGUSR2),
    ] {
        let opts = parse(&["-s", name])?;
        let CliAction::Signal(command) = opts.action else {
            panic!("expected signaller action for {name}");
        };
        assert_eq!(command.signal(), signal);
    }
    assert!(SignalCommand::parse("explode").is_err());
    Ok(())
}

#[test]
fn bad_arguments_are_errors() {
    assert!(parse(&["-w"]).is_err());
    assert!(parse(&["-w", "lots"]).is_err());
    assert!(parse(&["-c"]).is_err());
    assert!(parse(&["--frobnicate"]).is_err());
}
