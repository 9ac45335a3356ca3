// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Source control drivers behind a uniform capability set.
//!
//! The engine never talks to a particular SCM directly. Checkout steps
//! carry a list of [`ScmSpec`] values; every spec resolves to a driver
//! implementing [`Scm`]. Multiple SCMs may share one checkout workspace
//! as long as their directories form a proper forest.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;

mod git;
mod import;
mod url;

pub use self::git::{GitScm, GitSpec};
pub use self::import::{ImportScm, ImportSpec};
pub use self::url::{UrlScm, UrlSpec};

/// Serializable description of one SCM checkout.
///
/// Specs are persisted in the workspace directory state and in attic
/// records, so the encoding must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scm", rename_all = "lowercase")]
pub enum ScmSpec {
    Git(git::GitSpec),
    Url(url::UrlSpec),
    Import(import::ImportSpec),
}

impl ScmSpec {
    pub fn directory(&self) -> &str {
        match self {
            ScmSpec::Git(spec) => &spec.dir,
            ScmSpec::Url(spec) => &spec.dir,
            ScmSpec::Import(spec) => &spec.dir,
        }
    }

    pub fn set_directory(&mut self, dir: &str) {
        let target = match self {
            ScmSpec::Git(spec) => &mut spec.dir,
            ScmSpec::Url(spec) => &mut spec.dir,
            ScmSpec::Import(spec) => &mut spec.dir,
        };
        *target = dir.to_owned();
    }
}

/// Instantiate the driver for a spec.
pub fn from_spec(spec: &ScmSpec) -> Box<dyn Scm> {
    match spec {
        ScmSpec::Git(spec) => Box::new(GitScm::new(spec.clone())),
        ScmSpec::Url(spec) => Box::new(UrlScm::new(spec.clone())),
        ScmSpec::Import(spec) => Box::new(ImportScm::new(spec.clone())),
    }
}

/// Everything a driver may rely on while working on a checkout.
pub struct ScmContext {
    /// Absolute path of the checkout workspace.
    pub workspace: PathBuf,
    /// Project root; relative source paths resolve against it.
    pub project_root: PathBuf,
}

impl ScmContext {
    /// Absolute directory this SCM operates in.
    pub fn scm_dir(&self, scm: &dyn Scm) -> PathBuf {
        self.workspace.join(scm.directory())
    }
}

#[async_trait(?Send)]
pub trait Scm {
    /// The spec this driver was created from.
    fn spec(&self) -> ScmSpec;

    /// Workspace-relative target directory.
    fn directory(&self) -> &str;

    /// Stable string entering the checkout variant-id. Changing it marks
    /// the checkout as a different recipe.
    fn digest_script(&self) -> String;

    /// Whether the spec always produces the same tree.
    fn is_deterministic(&self) -> bool;

    /// Whether updates work without network access.
    fn is_local(&self) -> bool;

    /// Whether the result hash can be predicted from metadata only.
    fn live_build_id_support(&self) -> bool {
        false
    }

    /// Predict the live-build-id without touching the workspace.
    async fn predict_live_build_id(&self, ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        let _ = ctx;
        Ok(None)
    }

    /// Compute the live-build-id from a finished checkout.
    async fn calc_live_build_id(&self, ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        let _ = ctx;
        Ok(None)
    }

    /// Perform the checkout or update.
    async fn invoke(&self, ctx: &ScmContext, fresh_checkout: bool) -> Result<(), Error>;

    /// Whether an in-place switch from `old` is possible.
    fn can_switch(&self, old: &ScmSpec) -> bool {
        let _ = old;
        false
    }

    /// Switch the existing checkout in place.
    async fn switch(&self, ctx: &ScmContext, old: &ScmSpec) -> Result<(), Error> {
        let _ = (ctx, old);
        Err(Error::SwitchUnsupported)
    }

    /// Inspect the checkout; never fails, errors surface as taints.
    async fn status(&self, ctx: &ScmContext) -> Status;
}

/// Taints reported by [`Scm::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Taint {
    Clean,
    Modified,
    Switched,
    Unpushed,
    #[strum(serialize = "unpushed-local")]
    UnpushedLocal,
    Attic,
    New,
    Collides,
    Overridden,
    Error,
}

/// Aggregated status of one SCM directory.
#[derive(Debug, Default)]
pub struct Status {
    taints: BTreeSet<Taint>,
    description: Vec<String>,
}

impl Status {
    pub fn add(&mut self, taint: Taint, text: impl Into<String>) {
        self.taints.insert(taint);
        self.description.push(text.into());
    }

    pub fn contains(&self, taint: Taint) -> bool {
        self.taints.contains(&taint)
    }

    /// Workspace content deviates from what the spec would produce.
    pub fn dirty(&self) -> bool {
        self.contains(Taint::Modified) || self.contains(Taint::Switched)
    }

    pub fn clean(&self) -> bool {
        self.taints.is_empty()
    }

    pub fn flags(&self) -> String {
        if self.clean() {
            "C".into()
        } else {
            self.taints.iter().map(taint_flag).collect()
        }
    }

    pub fn description(&self) -> &[String] {
        &self.description
    }
}

fn taint_flag(taint: &Taint) -> char {
    match taint {
        Taint::Clean => 'C',
        Taint::Modified => 'M',
        Taint::Switched => 'S',
        Taint::Unpushed => 'U',
        Taint::UnpushedLocal => 'u',
        Taint::Attic => 'A',
        Taint::New => 'N',
        Taint::Collides => 'c',
        Taint::Overridden => 'O',
        Taint::Error => 'E',
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flags())
    }
}

/// Audit record data of one SCM directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmAudit {
    pub dir: String,
    pub spec: ScmSpec,
    pub dirty: bool,
}

/// Capture the audit record for a finished checkout.
pub async fn audit(scm: &dyn Scm, ctx: &ScmContext) -> ScmAudit {
    let status = scm.status(ctx).await;
    ScmAudit {
        dir: scm.directory().to_owned(),
        spec: scm.spec(),
        dirty: status.dirty(),
    }
}

/// Run an external command, collecting its output.
///
/// Used by drivers shelling out to their tooling. Output is returned on
/// success and printed on failure.
pub(crate) async fn run_tool(program: &str, args: &[&str], cwd: Option<&Path>) -> Result<String, Error> {
    use tokio::process;

    let mut command = process::Command::new(program);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let output = command
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Spawn(program.to_owned(), e))?;

    if !output.status.success() {
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
        return Err(Error::CommandFailed(
            format!("{program} {}", args.join(" ")),
            output.status.code().unwrap_or(-1),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("spawn {0}")]
    Spawn(String, #[source] std::io::Error),
    #[error("'{0}' failed with {1}")]
    CommandFailed(String, i32),
    #[error("in-place switch not supported")]
    SwitchUnsupported,
    #[error("fetch {0}")]
    Fetch(String),
    #[error("digest mismatch for {name}, expected {expected} got {got}")]
    DigestMismatch {
        name: String,
        expected: String,
        got: String,
    },
    #[error("malformed revision {0:?}")]
    MalformedRevision(String),
    #[error("request")]
    Request(#[from] reqwest::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spec_roundtrip() {
        let spec = ScmSpec::Git(git::GitSpec {
            url: "https://example.com/repo.git".into(),
            branch: Some("main".into()),
            tag: None,
            commit: None,
            dir: "repo".into(),
        });

        let yaml = serde_yaml::to_string(&spec).unwrap();
        let back: ScmSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn status_flags() {
        let mut status = Status::default();
        assert_eq!(status.flags(), "C");
        assert!(!status.dirty());

        status.add(Taint::Modified, "local changes");
        status.add(Taint::Unpushed, "2 commits ahead");
        assert!(status.dirty());
        assert_eq!(status.flags(), "MU");
    }
}
