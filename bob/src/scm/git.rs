// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Git checkouts via the git command line.
//!
//! Deterministic when pinned to a commit or tag. For branches the
//! upstream tip can be predicted with `ls-remote`, which feeds the
//! live-build-id fast path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{run_tool, Error, Scm, ScmContext, ScmSpec, Status, Taint};
use crate::digest::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default = "default_dir")]
    pub dir: String,
}

fn default_dir() -> String {
    ".".into()
}

impl GitSpec {
    fn rev(&self) -> String {
        if let Some(commit) = &self.commit {
            commit.clone()
        } else if let Some(tag) = &self.tag {
            format!("refs/tags/{tag}")
        } else if let Some(branch) = &self.branch {
            format!("refs/heads/{branch}")
        } else {
            "refs/heads/master".into()
        }
    }
}

pub struct GitScm {
    spec: GitSpec,
}

impl GitScm {
    pub fn new(spec: GitSpec) -> Self {
        Self { spec }
    }

    async fn git(&self, ctx: &ScmContext, args: &[&str]) -> Result<String, Error> {
        let dir = ctx.workspace.join(&self.spec.dir);
        run_tool("git", args, Some(&dir)).await
    }

    async fn clone_fresh(&self, ctx: &ScmContext) -> Result<(), Error> {
        let dir = ctx.workspace.join(&self.spec.dir);
        fs_err::create_dir_all(&dir).map_err(Error::Io)?;

        self.git(ctx, &["init", "."]).await?;
        self.git(ctx, &["remote", "add", "origin", &self.spec.url]).await?;
        self.update(ctx).await
    }

    async fn update(&self, ctx: &ScmContext) -> Result<(), Error> {
        self.git(ctx, &["fetch", "origin", "--tags"]).await?;
        let rev = self.spec.rev();
        self.git(ctx, &["checkout", "-q", "--detach", &rev]).await?;
        Ok(())
    }

    /// Resolve a ref on the remote without a local checkout.
    async fn remote_rev(&self) -> Result<Option<Digest>, Error> {
        if let Some(commit) = &self.spec.commit {
            return Ok(Some(parse_rev(commit)?));
        }

        let out = run_tool("git", &["ls-remote", &self.spec.url, &self.spec.rev()], None).await?;
        match out.split_whitespace().next() {
            Some(hash) => Ok(Some(parse_rev(hash)?)),
            None => Ok(None),
        }
    }
}

fn parse_rev(hash: &str) -> Result<Digest, Error> {
    Digest::from_hex(hash.trim()).ok_or_else(|| Error::MalformedRevision(hash.to_owned()))
}

#[async_trait(?Send)]
impl Scm for GitScm {
    fn spec(&self) -> ScmSpec {
        ScmSpec::Git(self.spec.clone())
    }

    fn directory(&self) -> &str {
        &self.spec.dir
    }

    fn digest_script(&self) -> String {
        format!("git {} {}", self.spec.url, self.spec.rev())
    }

    fn is_deterministic(&self) -> bool {
        self.spec.commit.is_some() || self.spec.tag.is_some()
    }

    fn is_local(&self) -> bool {
        false
    }

    fn live_build_id_support(&self) -> bool {
        true
    }

    async fn predict_live_build_id(&self, _ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        self.remote_rev().await
    }

    async fn calc_live_build_id(&self, ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        let out = self.git(ctx, &["rev-parse", "HEAD"]).await?;
        Ok(Some(parse_rev(&out)?))
    }

    async fn invoke(&self, ctx: &ScmContext, fresh_checkout: bool) -> Result<(), Error> {
        let dir = ctx.workspace.join(&self.spec.dir);
        if fresh_checkout || !dir.join(".git").exists() {
            self.clone_fresh(ctx).await
        } else {
            self.update(ctx).await
        }
    }

    fn can_switch(&self, old: &ScmSpec) -> bool {
        // Same repository, different ref: git handles that in place
        matches!(old, ScmSpec::Git(old) if old.url == self.spec.url)
    }

    async fn switch(&self, ctx: &ScmContext, _old: &ScmSpec) -> Result<(), Error> {
        self.update(ctx).await
    }

    async fn status(&self, ctx: &ScmContext) -> Status {
        let mut status = Status::default();
        let dir = ctx.workspace.join(&self.spec.dir);

        if !dir.join(".git").exists() {
            status.add(Taint::Error, format!("{} is not a git checkout", dir.display()));
            return status;
        }

        match self.git(ctx, &["status", "--porcelain"]).await {
            Ok(out) if !out.trim().is_empty() => {
                status.add(Taint::Modified, "uncommitted local changes");
            }
            Ok(_) => {}
            Err(e) => status.add(Taint::Error, format!("git status failed: {e}")),
        }

        match self.git(ctx, &["remote", "get-url", "origin"]).await {
            Ok(url) if url.trim() != self.spec.url => {
                status.add(Taint::Switched, format!("origin is {}", url.trim()));
            }
            Ok(_) => {}
            Err(e) => status.add(Taint::Error, format!("git remote failed: {e}")),
        }

        // Commits not reachable from any remote branch would be lost on
        // re-checkout.
        if let Ok(out) = self.git(ctx, &["rev-list", "--count", "HEAD", "--not", "--remotes"]).await {
            if out.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false) {
                status.add(Taint::Unpushed, format!("{} unpushed commit(s)", out.trim()));
            }
        }

        status
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rev_priority() {
        let mut spec = GitSpec {
            url: "u".into(),
            branch: Some("dev".into()),
            tag: Some("v1".into()),
            commit: Some("deadbeef".into()),
            dir: ".".into(),
        };
        assert_eq!(spec.rev(), "deadbeef");

        spec.commit = None;
        assert_eq!(spec.rev(), "refs/tags/v1");

        spec.tag = None;
        assert_eq!(spec.rev(), "refs/heads/dev");

        spec.branch = None;
        assert_eq!(spec.rev(), "refs/heads/master");
    }

    #[test]
    fn determinism_requires_pin() {
        let spec = GitSpec {
            url: "u".into(),
            branch: Some("dev".into()),
            tag: None,
            commit: None,
            dir: ".".into(),
        };
        assert!(!GitScm::new(spec.clone()).is_deterministic());

        let pinned = GitSpec {
            tag: Some("v1".into()),
            ..spec
        };
        assert!(GitScm::new(pinned).is_deterministic());
    }

    #[test]
    fn switch_only_within_same_repo() {
        let a = GitSpec {
            url: "https://a".into(),
            branch: None,
            tag: None,
            commit: None,
            dir: ".".into(),
        };
        let b = GitSpec {
            url: "https://b".into(),
            ..a.clone()
        };

        let scm = GitScm::new(a.clone());
        assert!(scm.can_switch(&ScmSpec::Git(GitSpec {
            branch: Some("next".into()),
            ..a
        })));
        assert!(!scm.can_switch(&ScmSpec::Git(b)));
    }
}
