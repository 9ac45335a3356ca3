// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Shared package locations.
//!
//! Identical artifacts (same build-id) can live once per machine
//! instead of once per project. Installation is an atomic rename, so
//! two builders racing for the same build-id both succeed; only one of
//! them actually moves its content there.

use std::io;
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::digest::Digest;
use crate::util;

const RESULT_HASH_FILE: &str = "result-hash";

/// A shared package location.
pub trait Share {
    fn can_install(&self) -> bool {
        false
    }

    /// Human readable target for log messages.
    fn remote_name(&self, build_id: Digest) -> String {
        let _ = build_id;
        "-".into()
    }

    /// Look up an installed package. Returns its location and the
    /// recorded content hash.
    fn use_shared_package(&self, build_id: Digest) -> Option<(PathBuf, Digest)> {
        let _ = build_id;
        None
    }

    /// Install freshly built content. `installed` is `false` when a
    /// concurrent installer won the race; that is not an error.
    fn install_shared_package(
        &self,
        workspace: &Path,
        audit: &Path,
        build_id: Digest,
        result_hash: Digest,
    ) -> io::Result<(PathBuf, bool)> {
        let _ = (workspace, audit, build_id, result_hash);
        Err(io::Error::other("sharing not configured"))
    }
}

/// Sharing disabled.
#[derive(Default)]
pub struct NullShare;

impl Share for NullShare {}

/// Shared packages under a common root directory, content addressed by
/// build-id.
pub struct LocalShare {
    root: PathBuf,
}

impl LocalShare {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn location(&self, build_id: Digest) -> PathBuf {
        let hex = build_id.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(&hex[4..])
    }
}

impl Share for LocalShare {
    fn can_install(&self) -> bool {
        true
    }

    fn remote_name(&self, build_id: Digest) -> String {
        self.location(build_id).display().to_string()
    }

    fn use_shared_package(&self, build_id: Digest) -> Option<(PathBuf, Digest)> {
        let location = self.location(build_id);
        let hash = fs::read_to_string(location.join(RESULT_HASH_FILE)).ok()?;
        let hash = Digest::from_hex(hash.trim())?;
        location.join("workspace").is_dir().then_some((location, hash))
    }

    fn install_shared_package(
        &self,
        workspace: &Path,
        audit: &Path,
        build_id: Digest,
        result_hash: Digest,
    ) -> io::Result<(PathBuf, bool)> {
        let location = self.location(build_id);
        if location.exists() {
            return Ok((location, false));
        }

        let parent = location.parent().expect("nested share location");
        fs::create_dir_all(parent)?;

        // Stage next to the final location so the rename is atomic
        let staging = tempfile::tempdir_in(parent)?;
        util::copy_dir(workspace, &staging.path().join("workspace"))?;
        fs::copy(audit, staging.path().join("audit.json.gz"))?;
        fs::write(staging.path().join(RESULT_HASH_FILE), result_hash.to_hex())?;

        match fs::rename(staging.path(), &location) {
            Ok(()) => Ok((location, true)),
            // Lost the race; the competitor's content is equivalent
            Err(_) if location.exists() => Ok((location, false)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    fn make_workspace(dir: &Path) -> (PathBuf, PathBuf) {
        let workspace = dir.join("workspace");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("result.txt"), "ok").unwrap();
        let audit = dir.join("audit.json.gz");
        fs::write(&audit, "AUDIT").unwrap();
        (workspace, audit)
    }

    #[test]
    fn install_then_use() {
        let dir = tempfile::tempdir().unwrap();
        let (workspace, audit) = make_workspace(dir.path());
        let share = LocalShare::new(dir.path().join("shared"));

        assert!(share.use_shared_package(digest(1)).is_none());

        let (location, installed) = share
            .install_shared_package(&workspace, &audit, digest(1), digest(2))
            .unwrap();
        assert!(installed);
        assert!(location.join("workspace/result.txt").exists());

        let (found, hash) = share.use_shared_package(digest(1)).unwrap();
        assert_eq!(found, location);
        assert_eq!(hash, digest(2));
    }

    #[test]
    fn losing_the_race_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (workspace, audit) = make_workspace(dir.path());
        let share = LocalShare::new(dir.path().join("shared"));

        let (first, installed) = share
            .install_shared_package(&workspace, &audit, digest(1), digest(2))
            .unwrap();
        assert!(installed);

        let (second, installed) = share
            .install_shared_package(&workspace, &audit, digest(1), digest(2))
            .unwrap();
        assert!(!installed);
        assert_eq!(first, second);
    }

    #[test]
    fn null_share_does_nothing() {
        let share = NullShare;
        assert!(!share.can_install());
        assert!(share.use_shared_package(digest(1)).is_none());
    }
}
