// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Single file download.
//!
//! Fetches one file into the workspace, either from a http(s) URL or
//! from a plain path. With a pinned SHA-1 digest the checkout is
//! deterministic and the digest doubles as the live-build-id.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs_err as fs;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};
use tokio::io::AsyncWriteExt;

use super::{Error, Scm, ScmContext, ScmSpec, Status, Taint};
use crate::digest::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlSpec {
    pub url: String,
    /// Expected SHA-1 of the fetched file, hex encoded.
    #[serde(default)]
    pub digest: Option<String>,
    /// Defaults to the last path component of the url.
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default = "default_dir")]
    pub dir: String,
}

fn default_dir() -> String {
    ".".into()
}

pub struct UrlScm {
    spec: UrlSpec,
}

impl UrlScm {
    pub fn new(spec: UrlSpec) -> Self {
        Self { spec }
    }

    fn file_name(&self) -> &str {
        match &self.spec.file_name {
            Some(name) => name,
            None => self.spec.url.rsplit('/').next().unwrap_or("download"),
        }
    }

    fn is_remote(&self) -> bool {
        self.spec.url.starts_with("http://") || self.spec.url.starts_with("https://")
    }

    fn target(&self, ctx: &ScmContext) -> PathBuf {
        ctx.workspace.join(&self.spec.dir).join(self.file_name())
    }

    async fn fetch_remote(&self, target: &Path) -> Result<String, Error> {
        let response = reqwest::get(self.spec.url.as_str()).await?.error_for_status()?;
        let mut stream = response.bytes_stream();

        let partial = target.with_extension("part");
        let mut sha = Sha1::new();
        let mut out = tokio::fs::File::create(&partial).await.map_err(Error::Io)?;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            sha.update(&bytes);
            out.write_all(&bytes).await.map_err(Error::Io)?;
        }
        out.flush().await.map_err(Error::Io)?;
        drop(out);

        tokio::fs::rename(&partial, target).await.map_err(Error::Io)?;
        Ok(hex::encode(sha.finalize()))
    }

    async fn fetch_local(&self, ctx: &ScmContext, target: &Path) -> Result<String, Error> {
        let source = ctx.project_root.join(&self.spec.url);
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || {
            fs::copy(&source, &target)?;
            let data = fs::read(&target)?;
            Ok::<_, std::io::Error>(hex::encode(Sha1::digest(&data)))
        })
        .await
        .map_err(std::io::Error::other)?
        .map_err(Error::Io)
    }
}

#[async_trait(?Send)]
impl Scm for UrlScm {
    fn spec(&self) -> ScmSpec {
        ScmSpec::Url(self.spec.clone())
    }

    fn directory(&self) -> &str {
        &self.spec.dir
    }

    fn digest_script(&self) -> String {
        format!(
            "url {} {} {}",
            self.spec.url,
            self.spec.digest.as_deref().unwrap_or("-"),
            self.file_name(),
        )
    }

    fn is_deterministic(&self) -> bool {
        self.spec.digest.is_some()
    }

    fn is_local(&self) -> bool {
        !self.is_remote()
    }

    fn live_build_id_support(&self) -> bool {
        self.spec.digest.is_some()
    }

    async fn predict_live_build_id(&self, _ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        Ok(self.spec.digest.as_deref().and_then(Digest::from_hex))
    }

    async fn calc_live_build_id(&self, ctx: &ScmContext) -> Result<Option<Digest>, Error> {
        let target = self.target(ctx);
        let data = tokio::fs::read(&target).await.map_err(Error::Io)?;
        Ok(Some(Digest(Sha1::digest(&data).into())))
    }

    async fn invoke(&self, ctx: &ScmContext, _fresh_checkout: bool) -> Result<(), Error> {
        let target = self.target(ctx);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
        }

        let got = if self.is_remote() {
            self.fetch_remote(&target).await?
        } else {
            self.fetch_local(ctx, &target).await?
        };

        if let Some(expected) = &self.spec.digest {
            if &got != expected {
                fs::remove_file(&target).map_err(Error::Io)?;
                return Err(Error::DigestMismatch {
                    name: self.file_name().to_owned(),
                    expected: expected.clone(),
                    got,
                });
            }
        }

        Ok(())
    }

    fn can_switch(&self, old: &ScmSpec) -> bool {
        // Switch works when the file name stays put, the new download
        // simply overwrites the old one.
        matches!(old, ScmSpec::Url(old) if UrlScm::new(old.clone()).file_name() == self.file_name())
    }

    async fn switch(&self, ctx: &ScmContext, _old: &ScmSpec) -> Result<(), Error> {
        self.invoke(ctx, false).await
    }

    async fn status(&self, ctx: &ScmContext) -> Status {
        let mut status = Status::default();

        let Some(expected) = &self.spec.digest else {
            return status;
        };
        let target = self.target(ctx);
        match fs::read(&target) {
            Ok(data) => {
                if hex::encode(Sha1::digest(&data)) != *expected {
                    status.add(Taint::Modified, format!("{} does not match pinned digest", self.file_name()));
                }
            }
            Err(e) => status.add(Taint::Error, format!("cannot read {}: {e}", self.file_name())),
        }
        status
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(root: &Path) -> ScmContext {
        ScmContext {
            workspace: root.join("workspace"),
            project_root: root.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn local_fetch_and_digest_pin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo"), "payload").unwrap();
        fs::create_dir_all(dir.path().join("workspace")).unwrap();

        let good = hex::encode(Sha1::digest(b"payload"));
        let scm = UrlScm::new(UrlSpec {
            url: "foo".into(),
            digest: Some(good.clone()),
            file_name: None,
            dir: ".".into(),
        });

        let ctx = ctx(dir.path());
        scm.invoke(&ctx, true).await.unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("workspace/foo")).unwrap(), "payload");

        let live = scm.predict_live_build_id(&ctx).await.unwrap().unwrap();
        assert_eq!(live.to_hex(), good);
        assert_eq!(scm.calc_live_build_id(&ctx).await.unwrap().unwrap(), live);

        assert!(scm.status(&ctx).await.clean());
    }

    #[tokio::test]
    async fn digest_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo"), "payload").unwrap();
        fs::create_dir_all(dir.path().join("workspace")).unwrap();

        let scm = UrlScm::new(UrlSpec {
            url: "foo".into(),
            digest: Some(hex::encode(Sha1::digest(b"other"))),
            file_name: None,
            dir: ".".into(),
        });

        let err = scm.invoke(&ctx(dir.path()), true).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn modified_file_taints_status() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("foo"), "payload").unwrap();
        fs::create_dir_all(dir.path().join("workspace")).unwrap();

        let scm = UrlScm::new(UrlSpec {
            url: "foo".into(),
            digest: Some(hex::encode(Sha1::digest(b"payload"))),
            file_name: None,
            dir: ".".into(),
        });

        let ctx = ctx(dir.path());
        scm.invoke(&ctx, true).await.unwrap();

        fs::write(dir.path().join("workspace/foo"), "edited").unwrap();
        let status = scm.status(&ctx).await;
        assert!(status.dirty());
        assert!(status.contains(Taint::Modified));
    }
}
