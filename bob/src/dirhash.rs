// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Workspace content hashing.
//!
//! The 20-byte tree hash doubles as the build-id of checkout steps and
//! as the result hash of every workspace. Entries are visited in sorted
//! order; name, entry type, the executable bit and the content (or
//! symlink target) all contribute.

use std::cell::RefCell;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use sha1::{Digest as _, Sha1};
use walkdir::WalkDir;

use crate::digest::{Digest, Encoder};

/// Hash the tree below `path`. A missing directory hashes as empty.
pub fn hash_directory(path: &Path) -> io::Result<Digest> {
    let mut enc = Encoder::new();

    if !path.exists() {
        return Ok(enc.finish());
    }

    let walker = WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .expect("walked path below root");
        let meta = entry.metadata().map_err(io::Error::other)?;

        enc.put(rel.as_os_str().as_encoded_bytes());

        if meta.is_dir() {
            enc.put("d");
        } else if meta.file_type().is_symlink() {
            enc.put("l");
            let target = fs_err::read_link(entry.path())?;
            enc.put(target.as_os_str().as_encoded_bytes());
        } else {
            let executable = meta.permissions().mode() & 0o100 != 0;
            enc.put(if executable { "x" } else { "f" });
            enc.put_digest(hash_file(entry.path())?);
        }
    }

    Ok(enc.finish())
}

/// Async flavor; the walk runs on the blocking pool so large trees do
/// not stall the scheduler.
pub async fn hash_directory_async(path: PathBuf) -> io::Result<Digest> {
    tokio::task::spawn_blocking(move || hash_directory(&path))
        .await
        .map_err(io::Error::other)?
}

fn hash_file(path: &Path) -> io::Result<Digest> {
    let mut sha = Sha1::new();
    let mut file = fs_err::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha.update(&buf[..n]);
    }
    Ok(Digest(sha.finalize().into()))
}

/// Hash a workspace at most once, with explicit invalidation after the
/// content changed.
pub struct HashOnce {
    path: PathBuf,
    result: RefCell<Option<Digest>>,
}

impl HashOnce {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            result: RefCell::new(None),
        }
    }

    pub async fn hash(&self) -> io::Result<Digest> {
        if let Some(digest) = *self.result.borrow() {
            return Ok(digest);
        }
        let digest = hash_directory_async(self.path.clone()).await?;
        *self.result.borrow_mut() = Some(digest);
        Ok(digest)
    }

    pub fn invalidate(&self) {
        *self.result.borrow_mut() = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use fs_err as fs;

    #[test]
    fn stable_and_content_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b"), "world").unwrap();

        let h1 = hash_directory(dir.path()).unwrap();
        let h2 = hash_directory(dir.path()).unwrap();
        assert_eq!(h1, h2);

        fs::write(dir.path().join("a"), "changed").unwrap();
        assert_ne!(hash_directory(dir.path()).unwrap(), h1);
    }

    #[test]
    fn names_matter() {
        let d1 = tempfile::tempdir().unwrap();
        fs::write(d1.path().join("a"), "x").unwrap();

        let d2 = tempfile::tempdir().unwrap();
        fs::write(d2.path().join("b"), "x").unwrap();

        assert_ne!(
            hash_directory(d1.path()).unwrap(),
            hash_directory(d2.path()).unwrap()
        );
    }

    #[test]
    fn executable_bit_matters() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tool");
        fs::write(&file, "#!/bin/sh").unwrap();

        let plain = hash_directory(dir.path()).unwrap();

        fs::set_permissions(&file, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_ne!(hash_directory(dir.path()).unwrap(), plain);
    }

    #[test]
    fn missing_directory_hashes_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();

        assert_eq!(
            hash_directory(&gone).unwrap(),
            hash_directory(&empty).unwrap()
        );
    }
}
