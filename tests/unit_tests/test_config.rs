// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use portico::cfg::{
    config::{Config, apply_directives},
    enums::{LogFormat, LogOutput, OnOff},
};
use serde_json::json;

#[test]
fn defaults_are_valid() -> Result<()> {
    let mut cfg = Config::default();
    cfg.validate_and_normalize()?;
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.server.backlog, 511);
    assert!(!cfg.process.master);
    assert_eq!(cfg.process.workers, 2);
    assert_eq!(cfg.process.pid_file, "portico.pid");
    assert!(cfg.postgres.is_none());
    Ok(())
}

#[test]
fn full_document_parses() -> Result<()> {
    let cfg = Config::from_value(json!({
        "server": { "listen": "127.0.0.1", "port": 9000, "backlog": 128 },
        "process": {
            "master": true,
            "workers": 4,
            "helper": true,
            "daemon": false,
            "pid_file": "/run/portico.pid",
            "kill_timeout_secs": 5
        },
        "log": { "level": "debug", "output": "stdout", "format": "json" },
        "postgres": {
            "host": "db.internal",
            "port": 5433,
            "dbname": "appdb",
            "user": "svc",
            "password": "secret",
            "min_connections": 2,
            "max_connections": 8
        },
        "modules": {
            "WebServer": { "root": "/var/www" }
        }
    }))?;

    assert_eq!(cfg.server.port, 9000);
    assert!(cfg.process.master);
    assert_eq!(cfg.process.workers, 4);
    assert_eq!(cfg.log.level, "debug");
    assert_eq!(cfg.log.output, LogOutput::Stdout);
    assert_eq!(cfg.log.format, LogFormat::Json);

    let pg = cfg.postgres.as_ref().expect("postgres section");
    assert_eq!(pg.max_connections, 8);
    let info = pg.conninfo();
    assert_eq!(info.host, "db.internal");
    assert_eq!(info.port, 5433);
    assert_eq!(info.dbname, "appdb");

    let module = cfg.module_config("WebServer").expect("module section");
    assert_eq!(module["root"], "/var/www");
    assert!(cfg.module_config("Absent").is_none());
    Ok(())
}

#[test]
fn invalid_documents_are_rejected() {
    // Zero port.
    assert!(Config::from_value(json!({ "server": { "port": 0 } })).is_err());
    // Master with no workers.
    assert!(
        Config::from_value(json!({
            "process": { "master": true, "workers": 0 }
        }))
        .is_err()
    );
    // Pool ceiling below the floor.
    assert!(
        Config::from_value(json!({
            "postgres": { "min_connections": 4, "max_connections": 2 }
        }))
        .is_err()
    );
}

#[test]
fn directives_override_sections() -> Result<()> {
    let mut raw = json!({ "server": { "port": 8080 } });
    apply_directives(
        &mut raw,
        &[
            "server.port=9090".to_string(),
            "process.master=true".to_string(),
            "process.workers=3".to_string(),
            "log.level=warn".to_string(),
        ],
    )?;
    let cfg = Config::from_value(raw)?;

    assert_eq!(cfg.server.port, 9090);
    assert!(cfg.process.master);
    assert_eq!(cfg.process.workers, 3);
    assert_eq!(cfg.log.level, "warn");
    Ok(())
}

#[test]
fn malformed_directives_are_rejected() {
    let mut raw = json!({});
    assert!(apply_directives(&mut raw, &["nonsense".to_string()]).is_err());
    assert!(apply_directives(&mut raw, &["a..b=1".to_string()]).is_err());
}

#[test]
fn on_off_spellings() {
    for spelling in ["\"on\"", "\"true\"", "\"1\""] {
        let v: OnOff = serde_json::from_str(spelling).expect("parses");
        assert!(v.as_bool());
    }
    for spelling in ["\"off\"", "\"false\"", "\"0\""] {
        let v: OnOff = serde_json::from_str(spelling).expect("parses");
        assert!(!v.as_bool());
    }
    assert_eq!(OnOff::from(true).to_string(), "on");
}
