// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-project context: root directory, configuration and conventional
//! paths.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{self, Config};

#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root: PathBuf = root.into();
        let root = root.canonicalize().map_err(|e| Error::BadRoot(root, e))?;
        let config = Config::load(&root)?;

        Ok(Self { root, config })
    }

    /// Turn a project-relative workspace path into an absolute one.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    /// Directory next to a workspace holding its metadata files
    /// (audit, log, spec, …).
    pub fn step_dir(&self, workspace: &str) -> PathBuf {
        let abs = self.path(workspace);
        abs.parent().map(Path::to_path_buf).unwrap_or(abs)
    }

    pub fn audit_path(&self, workspace: &str) -> PathBuf {
        self.step_dir(workspace).join("audit.json.gz")
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open project root {0:?}")]
    BadRoot(PathBuf, #[source] std::io::Error),
    #[error("config")]
    Config(#[from] config::Error),
}
