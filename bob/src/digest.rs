// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Step identity digests.
//!
//! Every step carries a *variant-id* describing what the recipes say it
//! is, and build- and package-steps additionally get a *build-id*
//! describing the artifact they are expected to produce. Both are
//! 20-byte SHA-1 values over an injection-free encoding: every variable
//! length field is length-prefixed and every list is count-prefixed, so
//! shifting a byte between adjacent fields or sneaking in an empty entry
//! always changes the digest.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

use crate::graph::{Graph, StepId};

/// Substituted for a tool's build-id in relaxed mode. Swapping a tool
/// for a bit-equivalent one must not invalidate downstream artifacts.
const RELAXED_TOOL_ID: Digest = Digest([0u8; 20]);

/// A 20 byte SHA-1 identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; 20]);

impl Digest {
    pub const SIZE: usize = 20;

    /// Digest a single byte string.
    pub fn of(data: impl AsRef<[u8]>) -> Self {
        let mut sha = Sha1::new();
        sha.update(data.as_ref());
        Self(sha.finalize().into())
    }

    /// Digest the concatenation of two byte strings.
    pub fn of_pair(a: impl AsRef<[u8]>, b: impl AsRef<[u8]>) -> Self {
        let mut sha = Sha1::new();
        sha.update(a.as_ref());
        sha.update(b.as_ref());
        Self(sha.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| ParseDigestError(s.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed digest: {0}")]
pub struct ParseDigestError(String);

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("40 hex characters")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Digest, E> {
                Digest::from_hex(v).ok_or_else(|| E::custom("malformed digest"))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// Injection-free SHA-1 stream.
pub struct Encoder {
    sha: Sha1,
}

impl Encoder {
    pub fn new() -> Self {
        Self { sha: Sha1::new() }
    }

    /// A variable length field, length-prefixed.
    pub fn put(&mut self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        self.sha.update((data.len() as u32).to_le_bytes());
        self.sha.update(data);
    }

    /// A list header.
    pub fn put_count(&mut self, count: usize) {
        self.sha.update((count as u32).to_le_bytes());
    }

    /// A fixed size digest.
    pub fn put_digest(&mut self, digest: Digest) {
        self.sha.update(digest.as_bytes());
    }

    /// An optional digest; presence is encoded explicitly.
    pub fn put_opt_digest(&mut self, digest: Option<Digest>) {
        match digest {
            Some(digest) => {
                self.sha.update([1u8]);
                self.sha.update(digest.as_bytes());
            }
            None => self.sha.update([0u8]),
        }
    }

    pub fn finish(self) -> Digest {
        Digest(self.sha.finalize().into())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies the build host flavor. Mixed into every build-id so
/// artifacts from incompatible platforms never alias.
pub fn platform_tag() -> &'static str {
    if cfg!(windows) {
        "win32"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "posix"
    }
}

/// Compute the variant-id of a step from recipe-intrinsic inputs only.
///
/// `dep_variant_id` supplies the variant-ids of tool steps, the sandbox
/// step and the dependency steps. For the plain recipe variant-id this
/// is the recipe value; the incremental flavor substitutes the values
/// persisted at the dependencies' workspaces.
pub fn variant_id(graph: &Graph, step: StepId, mut dep_variant_id: impl FnMut(StepId) -> Digest) -> Digest {
    let data = graph.step(step);
    let mut enc = Encoder::new();

    enc.put(data.kind.tag());
    enc.put(data.digest_script.as_deref().unwrap_or(""));

    // SCM setup is part of a checkout step's identity
    enc.put_count(data.scms.len());
    for scm in &data.scms {
        enc.put(crate::scm::from_spec(scm).digest_script());
    }

    enc.put_count(data.env.len());
    for (key, value) in &data.env {
        enc.put(key);
        enc.put(value);
    }

    // Tools are identified by what they are, not by the local name they
    // are referenced under.
    enc.put_count(data.tools.len());
    for tool in data.tools.values() {
        enc.put_digest(dep_variant_id(tool.step));
        enc.put(&tool.path);
        enc.put_count(tool.libs.len());
        for lib in &tool.libs {
            enc.put(lib);
        }
    }

    enc.put_opt_digest(data.sandbox.as_ref().map(|sandbox| dep_variant_id(sandbox.step)));

    enc.put_count(data.deps.len());
    for dep in &data.deps {
        enc.put_digest(dep_variant_id(*dep));
    }

    enc.finish()
}

/// Compute the build-id of a build- or package-step.
///
/// The caller resolves dependency build-ids (checkout steps resolve to
/// their workspace tree hash, possibly predicted). Tool build-ids are
/// relaxed to a constant: a tool that produces bit-identical output must
/// not invalidate the artifacts built with it.
pub fn build_id(
    graph: &Graph,
    step: StepId,
    fingerprint: &[u8],
    sandbox_build_id: Option<Digest>,
    dep_build_ids: &[Digest],
) -> Digest {
    let data = graph.step(step);
    let mut enc = Encoder::new();

    enc.put(data.kind.tag());
    enc.put(data.digest_script.as_deref().unwrap_or(""));
    enc.put(fingerprint);
    enc.put(platform_tag());

    enc.put_count(data.tools.len());
    for tool in data.tools.values() {
        enc.put_digest(RELAXED_TOOL_ID);
        enc.put(&tool.path);
        enc.put_count(tool.libs.len());
        for lib in &tool.libs {
            enc.put(lib);
        }
    }

    enc.put_opt_digest(sandbox_build_id);

    enc.put_count(dep_build_ids.len());
    for dep in dep_build_ids {
        enc.put_digest(*dep);
    }

    enc.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::graph::test_support::{graph_with, StepSpec};

    fn vid(graph: &Graph) -> Digest {
        let root = graph.roots()[0];
        variant_id(graph, root, |dep| graph.variant_id(dep))
    }

    #[test]
    fn stable_for_identical_input() {
        let g1 = graph_with(StepSpec::package("root").env([("a", "asdf"), ("q", "qwer")]));
        let g2 = graph_with(StepSpec::package("root").env([("a", "asdf"), ("q", "qwer")]));
        assert_eq!(vid(&g1), vid(&g2));
    }

    #[test]
    fn script_changes_digest() {
        let g1 = graph_with(StepSpec::package("root").script("make"));
        let g2 = graph_with(StepSpec::package("root").script("make install"));
        assert_ne!(vid(&g1), vid(&g2));
    }

    #[test]
    fn env_changes_digest() {
        let base = graph_with(StepSpec::package("root").env([("a", "asdf")]));

        // different value
        let changed = graph_with(StepSpec::package("root").env([("a", "qwer")]));
        assert_ne!(vid(&base), vid(&changed));

        // added entry
        let added = graph_with(StepSpec::package("root").env([("a", "asdf"), ("b", "qwer")]));
        assert_ne!(vid(&base), vid(&added));

        // removed entry
        let removed = graph_with(StepSpec::package("root"));
        assert_ne!(vid(&base), vid(&removed));
    }

    #[test]
    fn env_rotation_detected() {
        let g1 = graph_with(StepSpec::package("root").env([("a", "bc"), ("cd", "e")]));
        let g2 = graph_with(StepSpec::package("root").env([("a", "bcc"), ("d", "e")]));
        assert_ne!(vid(&g1), vid(&g2));

        let g1 = graph_with(StepSpec::package("root").env([("a", "bb"), ("c", "dd"), ("e", "ff")]));
        let g2 = graph_with(StepSpec::package("root").env([("a", "bbc=dd"), ("e", "ff")]));
        assert_ne!(vid(&g1), vid(&g2));
    }

    #[test]
    fn empty_env_entry_detected() {
        let g1 = graph_with(StepSpec::package("root").env([("a", "b")]));
        let g2 = graph_with(StepSpec::package("root").env([("a", "b"), ("", "")]));
        assert_ne!(vid(&g1), vid(&g2));
    }

    #[test]
    fn tool_name_does_not_change_digest() {
        let g1 = graph_with(StepSpec::package("root").tool("a", "tool", "p1", &[]));
        let g2 = graph_with(StepSpec::package("root").tool("zz", "tool", "p1", &[]));
        assert_eq!(vid(&g1), vid(&g2));
    }

    #[test]
    fn tool_fields_change_digest() {
        let base = graph_with(StepSpec::package("root").tool("a", "tool", "p1", &[]));

        // tool step changes
        let other_step = graph_with(StepSpec::package("root").tool("a", "other", "p1", &[]));
        assert_ne!(vid(&base), vid(&other_step));

        // path changes
        let other_path = graph_with(StepSpec::package("root").tool("a", "tool", "foo", &[]));
        assert_ne!(vid(&base), vid(&other_path));

        // libs change
        let other_libs = graph_with(StepSpec::package("root").tool("a", "tool", "p1", &["asdf"]));
        assert_ne!(vid(&base), vid(&other_libs));
    }

    #[test]
    fn relaxed_tools_do_not_enter_build_id() {
        let g1 = graph_with(StepSpec::package("root").tool("a", "tool", "p1", &[]));
        let g2 = graph_with(StepSpec::package("root").tool("a", "other", "p1", &[]));
        let b1 = build_id(&g1, g1.roots()[0], b"", None, &[]);
        let b2 = build_id(&g2, g2.roots()[0], b"", None, &[]);
        // Different tool steps, same relaxed build-id contribution
        assert_eq!(b1, b2);
    }

    #[test]
    fn fingerprint_enters_build_id() {
        let g = graph_with(StepSpec::package("root"));
        let root = g.roots()[0];
        let b1 = build_id(&g, root, b"", None, &[]);
        let b2 = build_id(&g, root, b"glibc-2.38", None, &[]);
        assert_ne!(b1, b2);
    }

    #[test]
    fn dep_build_ids_enter_build_id() {
        let g = graph_with(StepSpec::package("root"));
        let root = g.roots()[0];
        let b1 = build_id(&g, root, b"", None, &[Digest::of("a")]);
        let b2 = build_id(&g, root, b"", None, &[Digest::of("b")]);
        assert_ne!(b1, b2);
    }
}
