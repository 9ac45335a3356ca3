// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Archive backend speaking plain HTTP GET/PUT against a repository
//! base URL.

use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{artifact_path, pack_artifact, unpack_artifact, ArtifactArchive, Error};
use crate::digest::Digest;

/// Shared client for socket reuse across backends.
static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn client() -> &'static reqwest::Client {
    CLIENT.get_or_init(|| {
        reqwest::ClientBuilder::new()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("build reqwest client")
    })
}

pub struct HttpArchive {
    base: String,
}

impl HttpArchive {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }

    fn url(&self, digest: Digest, suffix: &str) -> String {
        format!("{}{}", self.base, artifact_path(digest, suffix).display())
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, Error> {
        let response = client().get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn put(&self, url: &str, data: Vec<u8>) -> Result<(), Error> {
        client().put(url).body(data).send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl ArtifactArchive for HttpArchive {
    fn name(&self) -> String {
        self.base.clone()
    }

    async fn download_package(&self, build_id: Digest, audit_dst: &Path, content_dst: &Path) -> Result<bool, Error> {
        let Some(data) = self.get(&self.url(build_id, "tgz")).await? else {
            return Ok(false);
        };

        let audit_dst = audit_dst.to_path_buf();
        let content_dst = content_dst.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_artifact(data.as_slice(), &audit_dst, &content_dst))
            .await
            .map_err(std::io::Error::other)??;
        Ok(true)
    }

    async fn upload_package(&self, build_id: Digest, audit_src: &Path, content_src: &Path) -> Result<(), Error> {
        let audit_src = audit_src.to_path_buf();
        let content_src = content_src.to_path_buf();

        let data = tokio::task::spawn_blocking(move || {
            let mut data = Vec::new();
            pack_artifact(&audit_src, &content_src, &mut data)?;
            Ok::<_, Error>(data)
        })
        .await
        .map_err(std::io::Error::other)??;

        self.put(&self.url(build_id, "tgz"), data).await
    }

    async fn download_live_build_id(&self, live_id: Digest) -> Result<Option<Digest>, Error> {
        match self.get(&self.url(live_id, "buildid")).await? {
            Some(data) => Ok(Some(super::file::parse_digest(&data)?)),
            None => Ok(None),
        }
    }

    async fn upload_live_build_id(&self, live_id: Digest, build_id: Digest) -> Result<(), Error> {
        self.put(&self.url(live_id, "buildid"), build_id.as_bytes().to_vec()).await
    }

    async fn download_fingerprint(&self, key: Digest) -> Result<Option<Vec<u8>>, Error> {
        self.get(&self.url(key, "fprnt")).await
    }

    async fn upload_fingerprint(&self, key: Digest, fingerprint: &[u8]) -> Result<(), Error> {
        self.put(&self.url(key, "fprnt"), fingerprint.to_vec()).await
    }
}
