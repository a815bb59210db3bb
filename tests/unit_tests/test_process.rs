// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use portico::{
    cfg::config::Config,
    process::{PidFile, ProcessRole, app::resolve_path},
};
use serde_json::json;

#[test]
fn role_routing_matrix() -> Result<()> {
    // master=F helper=F → single
    let cfg = Config::from_value(json!({}))?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Single);

    // master=T helper=F → master
    let cfg = Config::from_value(json!({ "process": { "master": true } }))?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Master);

    // master=F helper=T → standalone helper
    let cfg = Config::from_value(json!({ "process": { "helper": true } }))?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Helper);

    // master=T helper=T → master (the helper becomes a child)
    let cfg = Config::from_value(
        json!({ "process": { "master": true, "helper": true } }),
    )?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Master);
    Ok(())
}

#[test]
fn daemon_flag_is_orthogonal_to_role() -> Result<()> {
    let cfg = Config::from_value(json!({ "process": { "daemon": true } }))?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Single);

    let cfg = Config::from_value(
        json!({ "process": { "daemon": true, "master": true } }),
    )?;
    assert_eq!(ProcessRole::from_config(&cfg), ProcessRole::Master);
    Ok(())
}

#[test]
fn role_names() {
    assert_eq!(ProcessRole::Single.role_name(), "single");
    assert_eq!(ProcessRole::Master.role_name(), "master");
    assert_eq!(ProcessRole::Worker.role_name(), "worker");
    assert_eq!(ProcessRole::Helper.role_name(), "helper");
    assert_eq!(ProcessRole::Signaller.role_name(), "signaller");
}

#[test]
fn pid_file_lifecycle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pid_file = PidFile::new(dir.path().join("svc.pid"));

    pid_file.write(12345)?;
    assert_eq!(pid_file.read()?, 12345);

    pid_file.rename_to_oldbin()?;
    assert!(pid_file.read().is_err());
    assert!(pid_file.oldbin_path().exists());

    pid_file.restore_from_oldbin()?;
    assert_eq!(pid_file.read()?, 12345);

    pid_file.remove();
    assert!(pid_file.read().is_err());
    Ok(())
}

#[test]
fn pid_file_rejects_garbage() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("svc.pid");
    std::fs::write(&path, "not-a-pid\n")?;
    assert!(PidFile::new(path).read().is_err());
    Ok(())
}

#[test]
fn resolve_path_prefixing() {
    assert_eq!(
        resolve_path("/opt/portico", "logs/app.log"),
        std::path::PathBuf::from("/opt/portico/logs/app.log")
    );
    assert_eq!(
        resolve_path("/opt/portico", "/var/log/app.log"),
        std::path::PathBuf::from("/var/log/app.log")
    );
    assert_eq!(
        resolve_path("", "portico.pid"),
        std::path::PathBuf::from("portico.pid")
    );
}
