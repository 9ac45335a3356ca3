// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Project configuration.
//!
//! Loaded from `.bob/config.yaml` under the project root, overlaid on
//! builtin defaults. Only variables on the whitelist ever reach step
//! scripts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::default_true;
use crate::scm::ScmSpec;

const CONFIG_FILE: &str = ".bob/config.yaml";

/// Environment variables passed through unless configured otherwise.
const DEFAULT_WHITELIST: &[&str] = &["TERM", "SHELL", "USER", "LOGNAME", "LANG", "SSH_AGENT_PID", "SSH_AUTH_SOCK", "HOME"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Host environment variables forwarded into step scripts.
    #[serde(default)]
    pub env_whitelist: Vec<String>,
    /// Artifact archive backends, tried in order.
    #[serde(default)]
    pub archive: Vec<ArchiveConfig>,
    /// Root of the cross-project shared package location.
    #[serde(default)]
    pub share: Option<ShareConfig>,
    /// Move incompatible checkouts to the attic instead of failing.
    #[serde(default = "default_true")]
    pub attic: bool,
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Recipe layers checked out before parsing, outermost first.
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_whitelist: vec![],
            archive: vec![],
            share: None,
            attic: true,
            jobs: None,
            layers: vec![],
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self, Error> {
        let path = root.join(CONFIG_FILE);
        match fs_err::read_to_string(&path) {
            Ok(text) => Ok(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Effective whitelist: defaults plus configuration.
    pub fn whitelist(&self) -> Vec<String> {
        DEFAULT_WHITELIST
            .iter()
            .map(|&s| s.to_owned())
            .chain(self.env_whitelist.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(flatten)]
    pub backend: ArchiveBackend,
    #[serde(default)]
    pub flags: Vec<ArchiveFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum ArchiveBackend {
    File { path: String },
    Http { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFlag {
    Download,
    Upload,
    NoFail,
    NoLocal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ShareConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LayerConfig {
    pub name: String,
    #[serde(default)]
    pub scm: Option<ScmSpec>,
    /// Lowest engine version able to build this layer.
    #[serde(default)]
    pub requires_version: Option<String>,
    #[serde(default)]
    pub layers: Vec<LayerConfig>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse config")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.attic);
        assert!(config.archive.is_empty());
        assert!(config.whitelist().contains(&"HOME".to_owned()));
    }

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join(".bob")).unwrap();
        fs_err::write(
            dir.path().join(".bob/config.yaml"),
            r#"
envWhitelist: [CC, CXX]
attic: false
jobs: 4
archive:
  - backend: file
    path: /var/cache/artifacts
    flags: [download, upload]
  - backend: http
    url: https://artifacts.example.com/
    flags: [download, nofail]
share:
  path: /var/lib/shared-packages
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert!(!config.attic);
        assert_eq!(config.jobs, Some(4));
        assert_eq!(config.archive.len(), 2);
        assert!(config.whitelist().contains(&"CC".to_owned()));
        assert_eq!(config.share.unwrap().path, "/var/lib/shared-packages");

        match &config.archive[1].backend {
            ArchiveBackend::Http { url } => assert_eq!(url, "https://artifacts.example.com/"),
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(config.archive[1].flags.contains(&ArchiveFlag::NoFail));
    }
}
