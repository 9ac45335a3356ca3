// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Audit trails.
//!
//! Every produced workspace gets an `audit.json.gz` describing how the
//! content came to be: identities, environment, SCM states and the
//! audit records of every input, transitively. Artifacts uploaded to an
//! archive carry their audit trail along.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::Digest;
use crate::scm::ScmAudit;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub variant_id: Digest,
    pub build_id: Digest,
    pub result_hash: Digest,
    /// Free-form facts: recipe name, package stack, step kind, script
    /// language, caller supplied keys.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub scms: Vec<ScmAudit>,
    /// Tools by local name → result hash of the tool artifact.
    #[serde(default)]
    pub tools: BTreeMap<String, Digest>,
    /// Result hashes of consumed dependency artifacts.
    #[serde(default)]
    pub dependencies: Vec<Digest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub artifact: Artifact,
    /// Transitive closure of input audit records.
    #[serde(default)]
    pub references: Vec<Artifact>,
}

impl Audit {
    pub fn create(variant_id: Digest, build_id: Digest, result_hash: Digest) -> Self {
        Self {
            artifact: Artifact {
                variant_id,
                build_id,
                result_hash,
                meta: BTreeMap::new(),
                env: BTreeMap::new(),
                scms: vec![],
                tools: BTreeMap::new(),
                dependencies: vec![],
            },
            references: vec![],
        }
    }

    pub fn add_define(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.artifact.meta.insert(key.into(), value.into());
    }

    pub fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.artifact.env = env;
    }

    pub fn add_scm(&mut self, scm: ScmAudit) {
        self.artifact.scms.push(scm);
    }

    /// Record a tool input by the audit trail sitting next to its
    /// workspace.
    pub fn add_tool(&mut self, name: impl Into<String>, audit_path: &Path) -> Result<(), Error> {
        let audit = Audit::load(audit_path)?;
        self.artifact.tools.insert(name.into(), audit.artifact.result_hash);
        self.merge_references(audit);
        Ok(())
    }

    /// Record a dependency input by its audit trail.
    pub fn add_dependency(&mut self, audit_path: &Path) -> Result<(), Error> {
        let audit = Audit::load(audit_path)?;
        self.artifact.dependencies.push(audit.artifact.result_hash);
        self.merge_references(audit);
        Ok(())
    }

    fn merge_references(&mut self, other: Audit) {
        let mut insert = |artifact: Artifact| {
            if !self
                .references
                .iter()
                .any(|a| a.result_hash == artifact.result_hash && a.variant_id == artifact.variant_id)
            {
                self.references.push(artifact);
            }
        };
        insert(other.artifact);
        for reference in other.references {
            insert(reference);
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let file = fs_err::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        serde_json::to_writer(&mut encoder, self)?;
        encoder.finish()?.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = fs_err::File::open(path)?;
        let mut decoder = GzDecoder::new(file);
        let mut data = Vec::new();
        decoder.read_to_end(&mut data)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("encode audit record")]
    Encode(#[from] serde_json::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json.gz");

        let mut audit = Audit::create(digest(1), digest(2), digest(3));
        audit.add_define("recipe", "root");
        audit.set_env([("V".to_owned(), "1".to_owned())].into());
        audit.save(&path).unwrap();

        let back = Audit::load(&path).unwrap();
        assert_eq!(back.artifact.variant_id, digest(1));
        assert_eq!(back.artifact.build_id, digest(2));
        assert_eq!(back.artifact.result_hash, digest(3));
        assert_eq!(back.artifact.meta.get("recipe").unwrap(), "root");
        assert_eq!(back.artifact.env.get("V").unwrap(), "1");
    }

    #[test]
    fn references_are_transitive_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();

        let leaf_path = dir.path().join("leaf.json.gz");
        let leaf = Audit::create(digest(10), digest(11), digest(12));
        leaf.save(&leaf_path).unwrap();

        let mid_path = dir.path().join("mid.json.gz");
        let mut mid = Audit::create(digest(20), digest(21), digest(22));
        mid.add_dependency(&leaf_path).unwrap();
        mid.save(&mid_path).unwrap();

        let mut top = Audit::create(digest(30), digest(31), digest(32));
        top.add_dependency(&mid_path).unwrap();
        // leaf consumed twice: directly and through mid
        top.add_tool("leaf", &leaf_path).unwrap();

        assert_eq!(top.artifact.dependencies, vec![digest(22)]);
        assert_eq!(top.artifact.tools.get("leaf").unwrap(), &digest(12));
        // closure holds mid and leaf exactly once
        assert_eq!(top.references.len(), 2);
    }
}
