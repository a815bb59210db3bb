// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Suffix the pid file gets during a binary upgrade.
const OLDBIN_SUFFIX: &str = ".oldbin";

/// The master/single pid file.
///
/// Written on startup, removed on clean exit. During a binary upgrade
/// the file is renamed to `<name>.oldbin` so the new master can claim
/// the canonical name; a failed exec renames it back.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn oldbin_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(OLDBIN_SUFFIX);
        PathBuf::from(name)
    }

    pub fn write(&self, pid: i32) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("cannot create pid directory {parent:?}")
            })?;
        }
        fs::write(&self.path, format!("{pid}\n")).with_context(|| {
            format!("cannot write pid file {:?}", self.path)
        })?;
        debug!(path = ?self.path, pid, "pid file written");
        Ok(())
    }

    pub fn read(&self) -> Result<i32> {
        let text = fs::read_to_string(&self.path).with_context(|| {
            format!("cannot read pid file {:?}", self.path)
        })?;
        text.trim().parse().with_context(|| {
            format!("pid file {:?} does not contain a pid", self.path)
        })
    }

    pub fn remove(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "pid file removal failed");
        }
    }

    /// Frees the canonical name for the upgraded binary.
    pub fn rename_to_oldbin(&self) -> Result<()> {
        fs::rename(&self.path, self.oldbin_path()).with_context(|| {
            format!("cannot rename {:?} to .oldbin", self.path)
        })
    }

    /// Undoes [`PidFile::rename_to_oldbin`] after a failed exec.
    pub fn restore_from_oldbin(&self) -> Result<()> {
        fs::rename(self.oldbin_path(), &self.path).with_context(|| {
            format!("cannot restore {:?} from .oldbin", self.path)
        })
    }
}
