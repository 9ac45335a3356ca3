// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content-addressed artifact archives.
//!
//! Backends implement a small capability set; any number of them is
//! composed into a [`MultiArchive`] which tries downloads in order and
//! uploads to every writable backend. A missing artifact is never an
//! error, only transport problems are (and even those are demoted to
//! misses on `nofail` backends).
//!
//! Artifacts are tar.gz files with a `bob-archive-vsn` PAX header, the
//! audit trail under `meta/` and the workspace under `content/`.

use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use thiserror::Error;

use crate::config::{ArchiveBackend, ArchiveConfig, ArchiveFlag};
use crate::digest::Digest;

mod file;
mod http;

pub use self::file::FileArchive;
pub use self::http::HttpArchive;

const VERSION_HEADER: &str = "bob-archive-vsn";
const VERSION: &str = "1";

/// Relative path of an artifact in a content-addressed tree.
///
/// The `-1` suffix leaves room for future format revisions.
pub fn artifact_path(digest: Digest, suffix: &str) -> PathBuf {
    let hex = digest.to_hex();
    PathBuf::from(&hex[0..2])
        .join(&hex[2..4])
        .join(format!("{}-1.{suffix}", &hex[4..]))
}

/// One archive backend.
#[async_trait(?Send)]
pub trait ArtifactArchive {
    /// Human readable identity for log messages.
    fn name(&self) -> String;

    /// Fetch the artifact with `build_id`; `false` on a miss.
    async fn download_package(&self, build_id: Digest, audit_dst: &Path, content_dst: &Path) -> Result<bool, Error>;

    async fn upload_package(&self, build_id: Digest, audit_src: &Path, content_src: &Path) -> Result<(), Error>;

    /// Translate a live-build-id into the real build-id, if known.
    async fn download_live_build_id(&self, live_id: Digest) -> Result<Option<Digest>, Error>;

    async fn upload_live_build_id(&self, live_id: Digest, build_id: Digest) -> Result<(), Error>;

    /// Cached fingerprint for a sandboxed probe, if known.
    async fn download_fingerprint(&self, key: Digest) -> Result<Option<Vec<u8>>, Error>;

    async fn upload_fingerprint(&self, key: Digest, fingerprint: &[u8]) -> Result<(), Error>;
}

struct Backend {
    archive: Box<dyn ArtifactArchive>,
    download: bool,
    upload: bool,
    nofail: bool,
}

/// Deterministically ordered composition of archive backends.
#[derive(Default)]
pub struct MultiArchive {
    backends: Vec<Backend>,
}

impl MultiArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[ArchiveConfig], project_root: &Path) -> Self {
        let mut archive = Self::new();
        for config in configs {
            if config.flags.contains(&ArchiveFlag::NoLocal) {
                continue;
            }
            let backend: Box<dyn ArtifactArchive> = match &config.backend {
                ArchiveBackend::File { path } => Box::new(FileArchive::new(project_root.join(path))),
                ArchiveBackend::Http { url } => Box::new(HttpArchive::new(url.clone())),
            };
            archive.add(
                backend,
                config.flags.contains(&ArchiveFlag::Download),
                config.flags.contains(&ArchiveFlag::Upload),
                config.flags.contains(&ArchiveFlag::NoFail),
            );
        }
        archive
    }

    pub fn add(&mut self, archive: Box<dyn ArtifactArchive>, download: bool, upload: bool, nofail: bool) {
        self.backends.push(Backend {
            archive,
            download,
            upload,
            nofail,
        });
    }

    pub fn can_download(&self) -> bool {
        self.backends.iter().any(|b| b.download)
    }

    pub fn can_upload(&self) -> bool {
        self.backends.iter().any(|b| b.upload)
    }

    pub async fn download_package(&self, build_id: Digest, audit_dst: &Path, content_dst: &Path) -> Result<bool, Error> {
        for backend in self.backends.iter().filter(|b| b.download) {
            match backend.archive.download_package(build_id, audit_dst, content_dst).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => demote_download(backend, e)?,
            }
        }
        Ok(false)
    }

    pub async fn upload_package(&self, build_id: Digest, audit_src: &Path, content_src: &Path) -> Result<(), Error> {
        for backend in self.backends.iter().filter(|b| b.upload) {
            match backend.archive.upload_package(build_id, audit_src, content_src).await {
                Ok(()) => {}
                Err(e) => demote_upload(backend, e)?,
            }
        }
        Ok(())
    }

    pub async fn download_live_build_id(&self, live_id: Digest) -> Result<Option<Digest>, Error> {
        for backend in self.backends.iter().filter(|b| b.download) {
            match backend.archive.download_live_build_id(live_id).await {
                Ok(Some(build_id)) => return Ok(Some(build_id)),
                Ok(None) => {}
                Err(e) => demote_download(backend, e)?,
            }
        }
        Ok(None)
    }

    pub async fn upload_live_build_id(&self, live_id: Digest, build_id: Digest) -> Result<(), Error> {
        for backend in self.backends.iter().filter(|b| b.upload) {
            match backend.archive.upload_live_build_id(live_id, build_id).await {
                Ok(()) => {}
                Err(e) => demote_upload(backend, e)?,
            }
        }
        Ok(())
    }

    pub async fn download_fingerprint(&self, key: Digest) -> Result<Option<Vec<u8>>, Error> {
        for backend in self.backends.iter().filter(|b| b.download) {
            match backend.archive.download_fingerprint(key).await {
                Ok(Some(fingerprint)) => return Ok(Some(fingerprint)),
                Ok(None) => {}
                Err(e) => demote_download(backend, e)?,
            }
        }
        Ok(None)
    }

    pub async fn upload_fingerprint(&self, key: Digest, fingerprint: &[u8]) -> Result<(), Error> {
        for backend in self.backends.iter().filter(|b| b.upload) {
            match backend.archive.upload_fingerprint(key, fingerprint).await {
                Ok(()) => {}
                Err(e) => demote_upload(backend, e)?,
            }
        }
        Ok(())
    }
}

/// A transport error on a `nofail` backend degrades to a miss. Format
/// errors stay fatal, the artifact would poison every consumer.
fn demote_download(backend: &Backend, error: Error) -> Result<(), Error> {
    if backend.nofail && !matches!(error, Error::WrongVersion(_)) {
        warn!("download from {} failed: {error}", backend.archive.name());
        Ok(())
    } else {
        Err(error)
    }
}

fn demote_upload(backend: &Backend, error: Error) -> Result<(), Error> {
    if backend.nofail {
        warn!("upload to {} failed: {error}", backend.archive.name());
        Ok(())
    } else {
        Err(error)
    }
}

// -- artifact packing ---------------------------------------------------

/// Pack audit trail and workspace content into the artifact format.
pub(crate) fn pack_artifact(audit_src: &Path, content_src: &Path, dst: impl Write) -> Result<(), Error> {
    let encoder = GzEncoder::new(dst, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    builder.append_pax_extensions([(VERSION_HEADER, VERSION.as_bytes())])?;
    builder.append_path_with_name(audit_src, "meta/audit.json.gz")?;
    builder.append_dir_all("content", content_src)?;

    builder.into_inner()?.finish()?.flush()?;
    Ok(())
}

/// Unpack an artifact, verifying the format version.
pub(crate) fn unpack_artifact(src: impl Read, audit_dst: &Path, content_dst: &Path) -> Result<(), Error> {
    let decoder = GzDecoder::new(src);
    let mut archive = tar::Archive::new(decoder);

    let mut version = None;
    let mut audit_found = false;

    for entry in archive.entries()? {
        let mut entry = entry?;

        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                if extension.key().ok() == Some(VERSION_HEADER) {
                    version = Some(String::from_utf8_lossy(extension.value_bytes()).into_owned());
                }
            }
        }

        let path = entry.path()?.into_owned();
        if path == Path::new("meta/audit.json.gz") {
            if version.as_deref() != Some(VERSION) {
                return Err(Error::WrongVersion(version.unwrap_or_default()));
            }
            let mut out = fs_err::File::create(audit_dst)?;
            io::copy(&mut entry, &mut out)?;
            audit_found = true;
        } else if let Ok(rel) = path.strip_prefix("content") {
            if rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(Error::MalformedArtifact("escaping path in artifact".into()));
            }
            if rel.as_os_str().is_empty() {
                continue;
            }
            entry.unpack(content_dst.join(rel))?;
        } else if path.starts_with("meta") {
            // future metadata, ignore
        } else {
            return Err(Error::MalformedArtifact(format!("unexpected member {}", path.display())));
        }
    }

    if version.as_deref() != Some(VERSION) {
        return Err(Error::WrongVersion(version.unwrap_or_default()));
    }
    if !audit_found {
        return Err(Error::MalformedArtifact("audit trail missing".into()));
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported archive version {0:?}")]
    WrongVersion(String),
    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),
    #[error("request")]
    Request(#[from] reqwest::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    use fs_err as fs;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    fn make_sources(dir: &Path) -> (PathBuf, PathBuf) {
        let audit = dir.join("audit.json.gz");
        fs::write(&audit, b"AUDIT").unwrap();
        let content = dir.join("workspace");
        fs::create_dir_all(content.join("sub")).unwrap();
        fs::write(content.join("data"), b"DATA").unwrap();
        fs::write(content.join("sub/more"), b"MORE").unwrap();
        (audit, content)
    }

    #[test]
    fn artifact_naming() {
        let path = artifact_path(Digest([0xab; 20]), "tgz");
        let hex = "ab".repeat(20);
        assert_eq!(
            path,
            PathBuf::from("ab").join("ab").join(format!("{}-1.tgz", &hex[4..]))
        );
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, content) = make_sources(dir.path());

        let artifact = dir.path().join("artifact.tgz");
        pack_artifact(&audit, &content, fs::File::create(&artifact).unwrap()).unwrap();

        let audit_out = dir.path().join("audit.out.gz");
        let content_out = dir.path().join("unpacked");
        fs::create_dir_all(&content_out).unwrap();
        unpack_artifact(fs::File::open(&artifact).unwrap(), &audit_out, &content_out).unwrap();

        assert_eq!(fs::read(&audit_out).unwrap(), b"AUDIT");
        assert_eq!(fs::read(content_out.join("data")).unwrap(), b"DATA");
        assert_eq!(fs::read(content_out.join("sub/more")).unwrap(), b"MORE");
    }

    #[test]
    fn version_header_is_mandatory() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, content) = make_sources(dir.path());

        // archive without the version header
        let artifact = dir.path().join("bad.tgz");
        {
            let encoder = GzEncoder::new(fs::File::create(&artifact).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_path_with_name(&audit, "meta/audit.json.gz").unwrap();
            builder.append_dir_all("content", &content).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let result = unpack_artifact(
            fs::File::open(&artifact).unwrap(),
            &dir.path().join("a"),
            &dir.path().join("c"),
        );
        assert!(matches!(result, Err(Error::WrongVersion(_))));
    }

    #[tokio::test]
    async fn multi_archive_tries_backends_in_order() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let (audit, content) = make_sources(work.path());

        // upload only into the second backend
        let mut upload = MultiArchive::new();
        upload.add(Box::new(FileArchive::new(d2.path())), false, true, false);
        upload.upload_package(digest(7), &audit, &content).await.unwrap();

        // download consults both, first one misses
        let mut both = MultiArchive::new();
        both.add(Box::new(FileArchive::new(d1.path())), true, false, false);
        both.add(Box::new(FileArchive::new(d2.path())), true, false, false);

        let audit_out = work.path().join("audit.out.gz");
        let content_out = work.path().join("unpacked");
        fs::create_dir_all(&content_out).unwrap();
        assert!(both
            .download_package(digest(7), &audit_out, &content_out)
            .await
            .unwrap());
        assert_eq!(fs::read(content_out.join("data")).unwrap(), b"DATA");

        // a miss everywhere is not an error
        assert!(!both
            .download_package(digest(9), &audit_out, &content_out)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn live_build_id_and_fingerprint_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = MultiArchive::new();
        archive.add(Box::new(FileArchive::new(dir.path())), true, true, false);

        assert_eq!(archive.download_live_build_id(digest(1)).await.unwrap(), None);
        archive.upload_live_build_id(digest(1), digest(2)).await.unwrap();
        assert_eq!(
            archive.download_live_build_id(digest(1)).await.unwrap(),
            Some(digest(2))
        );

        assert_eq!(archive.download_fingerprint(digest(3)).await.unwrap(), None);
        archive.upload_fingerprint(digest(3), b"probe-output").await.unwrap();
        assert_eq!(
            archive.download_fingerprint(digest(3)).await.unwrap().as_deref(),
            Some(&b"probe-output"[..])
        );
    }
}
