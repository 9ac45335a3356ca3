// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Archive backend on a local (or network mounted) directory tree.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs_err as fs;

use super::{artifact_path, pack_artifact, unpack_artifact, ArtifactArchive, Error};
use crate::digest::Digest;

pub struct FileArchive {
    root: PathBuf,
}

impl FileArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, digest: Digest, suffix: &str) -> PathBuf {
        self.root.join(artifact_path(digest, suffix))
    }

    /// Atomically publish `data` unless the file already exists.
    /// Artifacts are content addressed, an existing file is complete.
    fn put(path: &Path, data: &[u8]) -> Result<(), Error> {
        if path.exists() {
            return Ok(());
        }
        let parent = path.parent().expect("artifact paths are nested");
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn get(path: &Path) -> Result<Option<Vec<u8>>, Error> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait(?Send)]
impl ArtifactArchive for FileArchive {
    fn name(&self) -> String {
        self.root.display().to_string()
    }

    async fn download_package(&self, build_id: Digest, audit_dst: &Path, content_dst: &Path) -> Result<bool, Error> {
        let path = self.path(build_id, "tgz");
        let audit_dst = audit_dst.to_path_buf();
        let content_dst = content_dst.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(Error::Io(e)),
            };
            unpack_artifact(file, &audit_dst, &content_dst)?;
            Ok(true)
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
    }

    async fn upload_package(&self, build_id: Digest, audit_src: &Path, content_src: &Path) -> Result<(), Error> {
        let path = self.path(build_id, "tgz");
        let audit_src = audit_src.to_path_buf();
        let content_src = content_src.to_path_buf();

        tokio::task::spawn_blocking(move || {
            if path.exists() {
                return Ok(());
            }
            let parent = path.parent().expect("artifact paths are nested");
            fs::create_dir_all(parent)?;

            let tmp = tempfile::NamedTempFile::new_in(parent)?;
            pack_artifact(&audit_src, &content_src, &tmp)?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))?
    }

    async fn download_live_build_id(&self, live_id: Digest) -> Result<Option<Digest>, Error> {
        let data = Self::get(&self.path(live_id, "buildid"))?;
        match data {
            Some(data) => Ok(Some(parse_digest(&data)?)),
            None => Ok(None),
        }
    }

    async fn upload_live_build_id(&self, live_id: Digest, build_id: Digest) -> Result<(), Error> {
        Self::put(&self.path(live_id, "buildid"), build_id.as_bytes())
    }

    async fn download_fingerprint(&self, key: Digest) -> Result<Option<Vec<u8>>, Error> {
        Self::get(&self.path(key, "fprnt"))
    }

    async fn upload_fingerprint(&self, key: Digest, fingerprint: &[u8]) -> Result<(), Error> {
        Self::put(&self.path(key, "fprnt"), fingerprint)
    }
}

pub(super) fn parse_digest(data: &[u8]) -> Result<Digest, Error> {
    let bytes: [u8; Digest::SIZE] = data
        .try_into()
        .map_err(|_| Error::MalformedArtifact("truncated build-id".into()))?;
    Ok(Digest(bytes))
}
