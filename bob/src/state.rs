// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Crash-safe per-project state.
//!
//! A single versioned document under the project root records what every
//! workspace contained the last time it was touched. Saves are atomic
//! (sibling file + rename) so a killed build never leaves a torn state
//! behind. Concurrent access is fenced with a lock file.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs_err as fs;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;
use crate::scm::ScmSpec;

const STATE_FILE: &str = ".bob-state.json";
const LOCK_FILE: &str = ".bob-state.lock";

// Bump CUR_VERSION when the schema becomes backwards incompatible.
// MIN_VERSION only moves when reading an old state becomes impossible.
const MIN_VERSION: u32 = 1;
const CUR_VERSION: u32 = 1;

/// Result hash of a workspace.
///
/// While a step is executing the previous hash is forged to a unique
/// stamp. Should the step fail mid-way, dependents still notice the
/// change on the next run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultHash {
    Hash(Digest),
    Stamp { stamp: String },
}

impl ResultHash {
    pub fn now() -> Self {
        ResultHash::Stamp {
            stamp: crate::util::path_safe_timestamp(),
        }
    }

    pub fn digest(&self) -> Option<Digest> {
        match self {
            ResultHash::Hash(digest) => Some(*digest),
            ResultHash::Stamp { .. } => None,
        }
    }
}

impl From<Digest> for ResultHash {
    fn from(digest: Digest) -> Self {
        ResultHash::Hash(digest)
    }
}

/// What produced the current content of a package workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputState {
    /// Checkout- and build-steps: result hashes of the inputs.
    Plain(Vec<ResultHash>),
    Built {
        build_id: Digest,
        inputs: Vec<ResultHash>,
    },
    Downloaded {
        build_id: Digest,
    },
    Shared {
        build_id: Digest,
        location: String,
    },
}

impl InputState {
    pub fn build_id(&self) -> Option<Digest> {
        match self {
            InputState::Plain(_) => None,
            InputState::Built { build_id, .. }
            | InputState::Downloaded { build_id }
            | InputState::Shared { build_id, .. } => Some(*build_id),
        }
    }

    pub fn was_downloaded(&self) -> bool {
        matches!(self, InputState::Downloaded { .. })
    }

    pub fn was_shared(&self) -> bool {
        matches!(self, InputState::Shared { .. })
    }

    pub fn shared_location(&self) -> Option<&str> {
        match self {
            InputState::Shared { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// State of one SCM directory inside a checkout workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScmDirState {
    pub digest: Digest,
    pub spec: Option<ScmSpec>,
}

/// Compatibility gate for build-only checkout updates.
///
/// `locals` intentionally includes each SCM directory name next to its
/// digest script. Historic workspaces were recorded that way and must
/// keep matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOnlyState {
    pub locals: String,
    pub update_digest: Option<Digest>,
    pub input_hashes: Vec<ResultHash>,
}

/// Persisted directory state of a checkout workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutState {
    pub variant_id: Option<Digest>,
    pub build_only: Option<BuildOnlyState>,
    /// Keyed by SCM directory; ordered, so iteration is top-down.
    pub scms: BTreeMap<String, ScmDirState>,
}

impl CheckoutState {
    /// Compare while ignoring SCM specs and the build-only sub-state.
    ///
    /// A spec can change without the checkout changing (say, the URL
    /// moved but the commit is the same); only the digests count.
    pub fn same_checkout(&self, other: &CheckoutState) -> bool {
        self.variant_id == other.variant_id
            && self.scms.len() == other.scms.len()
            && self
                .scms
                .iter()
                .zip(other.scms.iter())
                .all(|((da, sa), (db, sb))| da == db && sa.digest == sb.digest)
    }

    /// Whether in-place build-only updates are safe: all local SCMs
    /// unchanged.
    pub fn update_compatible(&self, other: &CheckoutState) -> bool {
        self.build_only.as_ref().map(|b| &b.locals) == other.build_only.as_ref().map(|b| &b.locals)
    }

    pub fn update_changed(&self, other: &CheckoutState) -> bool {
        self.build_only != other.build_only
    }
}

/// Per-workspace directory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirectoryState {
    Checkout(CheckoutState),
    /// Package steps: the variant-id of what lives there.
    Package(Digest),
    /// Build steps: incremental variant-id plus the exec paths of the
    /// step and its dependencies.
    Build(Vec<String>),
}

/// Resume information captured at the end of a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildState {
    /// Completed steps by workspace: variant-id and checkout flag.
    pub was_run: BTreeMap<String, (Digest, bool)>,
    /// Predicted live build-ids by `<workspace>/<variant-id>`.
    pub predicted_build_ids: BTreeMap<String, Digest>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDoc {
    version: u32,
    /// Digest → allocated by-name directory (+ source flag), plus a
    /// counter per base directory.
    by_name_dirs: BTreeMap<String, (String, bool)>,
    dir_counters: BTreeMap<String, u32>,
    results: BTreeMap<String, ResultHash>,
    inputs: BTreeMap<String, InputState>,
    dir_states: BTreeMap<String, DirectoryState>,
    variant_ids: BTreeMap<String, Digest>,
    /// Live-build-id and fingerprint caches, keyed by hex-encoded
    /// binary keys.
    build_ids: BTreeMap<String, Digest>,
    /// Cached fingerprint script outputs (sandboxed runs only), hex
    /// encoded.
    fingerprints: BTreeMap<String, String>,
    attic: BTreeMap<String, ScmSpec>,
    build_state: BuildState,
    /// Storage paths that differ from the workspace path (shared
    /// packages).
    storage: BTreeMap<String, String>,
}

/// Handle to the project state. Single writer, guarded by a lock file.
pub struct PersistentState {
    path: PathBuf,
    lock: Option<PathBuf>,
    doc: StateDoc,
    asynchronous: u32,
    dirty: bool,
}

impl PersistentState {
    /// Lock the project and load (or initialize) its state.
    pub fn open(root: &Path) -> Result<Self, Error> {
        let lock_path = root.join(LOCK_FILE);
        let lock = match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(_) => Some(lock_path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::Locked(lock_path));
            }
            Err(e) => {
                // Typically a read-only checkout; proceed unlocked.
                warn!("cannot lock workspace: {e}");
                None
            }
        };

        let path = root.join(STATE_FILE);
        let doc = match fs::read(&path) {
            Ok(data) => {
                let doc: StateDoc = serde_json::from_slice(&data)?;
                if doc.version < MIN_VERSION {
                    return Err(Error::TooOld);
                }
                if doc.version > CUR_VERSION {
                    return Err(Error::TooNew);
                }
                doc
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => StateDoc {
                version: CUR_VERSION,
                ..Default::default()
            },
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path,
            lock,
            doc,
            asynchronous: 0,
            dirty: false,
        })
    }

    /// Unlock the project. Called on drop as well, but an explicit
    /// finalize surfaces unlock problems.
    pub fn finalize(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        debug_assert!(self.asynchronous == 0 && !self.dirty);
        if let Some(lock) = self.lock.take() {
            match fs::remove_file(&lock) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("lock file was deleted while the build was still running!");
                }
                Err(e) => warn!("cannot unlock workspace: {e}"),
            }
        }
    }

    /// Batch saves until the matching [`set_sync`](Self::set_sync).
    pub fn set_async(&mut self) {
        self.asynchronous += 1;
    }

    pub fn set_sync(&mut self) {
        assert!(self.asynchronous > 0);
        self.asynchronous -= 1;
        if self.asynchronous == 0 && self.dirty {
            self.save();
        }
    }

    fn save(&mut self) {
        if self.asynchronous > 0 {
            self.dirty = true;
            return;
        }
        if let Err(e) = self.save_atomic() {
            warn!("cannot save state: {e}");
            return;
        }
        self.dirty = false;
    }

    fn save_atomic(&self) -> io::Result<()> {
        let tmp = self.path.with_extension("json.new");
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer(&mut file, &self.doc).map_err(io::Error::other)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    // -- by-name directories ------------------------------------------

    /// Allocate (or look up) the numbered directory for a step.
    pub fn by_name_directory(&mut self, base_dir: &str, digest: Digest, is_source: bool) -> String {
        let key = digest.to_hex();
        if let Some((dir, _)) = self.doc.by_name_dirs.get(&key) {
            return dir.clone();
        }
        let counter = self.doc.dir_counters.entry(base_dir.to_owned()).or_insert(0);
        *counter += 1;
        let dir = format!("{base_dir}/{counter}");
        self.doc.by_name_dirs.insert(key, (dir.clone(), is_source));
        self.save();
        dir
    }

    pub fn existing_by_name_directory(&self, digest: Digest) -> Option<String> {
        self.doc.by_name_dirs.get(&digest.to_hex()).map(|(dir, _)| dir.clone())
    }

    pub fn all_name_directories(&self) -> Vec<(String, bool)> {
        self.doc.by_name_dirs.values().cloned().collect()
    }

    // -- result hashes ------------------------------------------------

    pub fn result_hash(&self, workspace: &str) -> Option<&ResultHash> {
        self.doc.results.get(workspace)
    }

    pub fn set_result_hash(&mut self, workspace: &str, hash: ResultHash) {
        if self.doc.results.get(workspace) != Some(&hash) {
            self.doc.results.insert(workspace.to_owned(), hash);
            self.save();
        }
    }

    pub fn del_result_hash(&mut self, workspace: &str) {
        if self.doc.results.remove(workspace).is_some() {
            self.save();
        }
    }

    // -- input hashes -------------------------------------------------

    pub fn input_hashes(&self, workspace: &str) -> Option<&InputState> {
        self.doc.inputs.get(workspace)
    }

    pub fn set_input_hashes(&mut self, workspace: &str, inputs: InputState) {
        if self.doc.inputs.get(workspace) != Some(&inputs) {
            self.doc.inputs.insert(workspace.to_owned(), inputs);
            self.save();
        }
    }

    pub fn del_input_hashes(&mut self, workspace: &str) {
        if self.doc.inputs.remove(workspace).is_some() {
            self.save();
        }
    }

    // -- directory states ---------------------------------------------

    pub fn directory_state(&self, workspace: &str) -> Option<&DirectoryState> {
        self.doc.dir_states.get(workspace)
    }

    pub fn checkout_state(&self, workspace: &str) -> CheckoutState {
        match self.doc.dir_states.get(workspace) {
            Some(DirectoryState::Checkout(state)) => state.clone(),
            _ => CheckoutState::default(),
        }
    }

    pub fn has_directory_state(&self, workspace: &str) -> bool {
        self.doc.dir_states.contains_key(workspace)
    }

    pub fn set_directory_state(&mut self, workspace: &str, state: DirectoryState) {
        self.doc.dir_states.insert(workspace.to_owned(), state);
        self.save();
    }

    // -- variant ids --------------------------------------------------

    pub fn variant_id(&self, workspace: &str) -> Option<Digest> {
        self.doc.variant_ids.get(workspace).copied()
    }

    pub fn set_variant_id(&mut self, workspace: &str, variant_id: Digest) {
        if self.doc.variant_ids.get(workspace) != Some(&variant_id) {
            self.doc.variant_ids.insert(workspace.to_owned(), variant_id);
            self.save();
        }
    }

    // -- build-id / fingerprint cache ---------------------------------

    pub fn build_id(&self, key: &[u8]) -> Option<Digest> {
        self.doc.build_ids.get(&hex::encode(key)).copied()
    }

    pub fn set_build_id(&mut self, key: &[u8], build_id: Digest) {
        self.doc.build_ids.insert(hex::encode(key), build_id);
        self.save();
    }

    pub fn del_build_id(&mut self, key: &[u8]) {
        if self.doc.build_ids.remove(&hex::encode(key)).is_some() {
            self.save();
        }
    }

    // -- fingerprint cache --------------------------------------------

    pub fn fingerprint(&self, key: Digest) -> Option<Vec<u8>> {
        self.doc
            .fingerprints
            .get(&key.to_hex())
            .and_then(|hex| hex::decode(hex).ok())
    }

    pub fn set_fingerprint(&mut self, key: Digest, fingerprint: &[u8]) {
        self.doc.fingerprints.insert(key.to_hex(), hex::encode(fingerprint));
        self.save();
    }

    // -- storage paths ------------------------------------------------

    pub fn storage_path(&self, workspace: &str) -> String {
        self.doc
            .storage
            .get(workspace)
            .cloned()
            .unwrap_or_else(|| workspace.to_owned())
    }

    pub fn set_storage_path(&mut self, workspace: &str, storage: &str) {
        if workspace == storage {
            if self.doc.storage.remove(workspace).is_some() {
                self.save();
            }
        } else if self.doc.storage.get(workspace).map(String::as_str) != Some(storage) {
            self.doc.storage.insert(workspace.to_owned(), storage.to_owned());
            self.save();
        }
    }

    // -- attic --------------------------------------------------------

    pub fn set_attic_state(&mut self, path: &str, spec: ScmSpec) {
        self.doc.attic.insert(path.to_owned(), spec);
        self.save();
    }

    pub fn attic(&self) -> impl Iterator<Item = (&String, &ScmSpec)> {
        self.doc.attic.iter()
    }

    pub fn del_attic_state(&mut self, path: &str) {
        if self.doc.attic.remove(path).is_some() {
            self.save();
        }
    }

    // -- whole workspaces ---------------------------------------------

    /// Forget everything about a workspace and start over with the
    /// given directory state.
    pub fn reset_workspace_state(&mut self, workspace: &str, state: DirectoryState) {
        self.doc.results.remove(workspace);
        self.doc.inputs.remove(workspace);
        self.doc.variant_ids.remove(workspace);
        self.doc.storage.remove(workspace);
        self.doc.dir_states.insert(workspace.to_owned(), state);
        self.save();
    }

    /// Deleting state of a workspace that was never built is fine.
    pub fn del_workspace(&mut self, workspace: &str) {
        let mut removed = false;
        removed |= self.doc.results.remove(workspace).is_some();
        removed |= self.doc.inputs.remove(workspace).is_some();
        removed |= self.doc.variant_ids.remove(workspace).is_some();
        removed |= self.doc.dir_states.remove(workspace).is_some();
        removed |= self.doc.storage.remove(workspace).is_some();
        if removed {
            self.save();
        }
    }

    // -- resume -------------------------------------------------------

    pub fn build_state(&self) -> BuildState {
        self.doc.build_state.clone()
    }

    pub fn set_build_state(&mut self, state: BuildState) {
        self.doc.build_state = state;
        self.save();
    }
}

impl Drop for PersistentState {
    fn drop(&mut self) {
        if self.dirty && self.asynchronous > 0 {
            self.asynchronous = 0;
            self.save();
        }
        self.unlock();
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "workspace state locked by another instance! Delete '{0}' if the previous build crashed or was killed."
    )]
    Locked(PathBuf),
    #[error("this version cannot read the build tree anymore, it is too old")]
    TooOld,
    #[error("the build tree was created by a newer version")]
    TooNew,
    #[error("malformed state file")]
    Decode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut state = PersistentState::open(dir.path()).unwrap();
            state.set_result_hash("work/a/dist/1", digest(1).into());
            state.set_input_hashes(
                "work/a/dist/1",
                InputState::Built {
                    build_id: digest(2),
                    inputs: vec![digest(3).into()],
                },
            );
            state.set_variant_id("work/a/dist/1", digest(4));
            state.set_build_id(b"\x00live", digest(5));
            state.finalize();
        }

        let state = PersistentState::open(dir.path()).unwrap();
        assert_eq!(
            state.result_hash("work/a/dist/1"),
            Some(&ResultHash::Hash(digest(1)))
        );
        assert_eq!(
            state.input_hashes("work/a/dist/1").and_then(InputState::build_id),
            Some(digest(2))
        );
        assert_eq!(state.variant_id("work/a/dist/1"), Some(digest(4)));
        assert_eq!(state.build_id(b"\x00live"), Some(digest(5)));
        assert_eq!(state.result_hash("somewhere/else"), None);
    }

    #[test]
    fn lock_excludes_second_instance() {
        let dir = tempfile::tempdir().unwrap();

        let state = PersistentState::open(dir.path()).unwrap();
        assert!(matches!(
            PersistentState::open(dir.path()),
            Err(Error::Locked(_))
        ));
        state.finalize();

        // Unlocked again
        PersistentState::open(dir.path()).unwrap().finalize();
    }

    #[test]
    fn rejects_newer_version() {
        let dir = tempfile::tempdir().unwrap();
        let doc = StateDoc {
            version: CUR_VERSION + 1,
            ..Default::default()
        };
        fs::write(dir.path().join(STATE_FILE), serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(matches!(
            PersistentState::open(dir.path()),
            Err(Error::TooNew)
        ));
    }

    #[test]
    fn async_mode_batches_saves() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join(STATE_FILE);

        let mut state = PersistentState::open(dir.path()).unwrap();
        state.set_async();
        state.set_result_hash("w", digest(1).into());
        assert!(!state_file.exists());

        state.set_sync();
        assert!(state_file.exists());
        state.finalize();
    }

    #[test]
    fn deleting_unknown_workspace_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PersistentState::open(dir.path()).unwrap();
        state.del_workspace("does/not/exist");
        state.del_result_hash("does/not/exist");
        state.finalize();
    }

    #[test]
    fn by_name_directories_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = PersistentState::open(dir.path()).unwrap();

        let d1 = state.by_name_directory("work/a/dist", digest(1), false);
        let d2 = state.by_name_directory("work/a/dist", digest(2), false);
        assert_eq!(d1, "work/a/dist/1");
        assert_eq!(d2, "work/a/dist/2");

        // same digest resolves to the same directory
        assert_eq!(state.by_name_directory("work/a/dist", digest(1), false), d1);
        assert_eq!(state.existing_by_name_directory(digest(2)), Some(d2));
        assert_eq!(state.existing_by_name_directory(digest(9)), None);
        state.finalize();
    }

    #[test]
    fn poisoned_result_hash_never_matches_fresh_hash() {
        let poisoned = ResultHash::now();
        assert_ne!(poisoned, ResultHash::Hash(digest(1)));
        assert_eq!(poisoned.digest(), None);
    }
}
