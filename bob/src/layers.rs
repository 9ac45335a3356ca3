// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe layer checkouts.
//!
//! Layers are SCM-backed recipe trees that must exist before any recipe
//! parsing can happen. They use the same SCM drivers and the same attic
//! policy as regular checkouts. Layers form a tree; a nested layer may
//! not demand a newer engine than its parent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::{info, warn};
use thiserror::Error;

use crate::config::LayerConfig;
use crate::digest::Digest;
use crate::project::Project;
use crate::scm::{self, ScmContext};
use crate::state::{CheckoutState, DirectoryState, PersistentState, ScmDirState};
use crate::util;

const LAYER_BASE: &str = "layers";

pub struct LayerManager<'a> {
    project: &'a Project,
    attic: bool,
}

impl<'a> LayerManager<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self {
            project,
            attic: project.config.attic,
        }
    }

    /// Check out or update all configured layers, outermost first.
    pub async fn update(&self, state: &mut PersistentState) -> Result<(), Error> {
        let layers = self.project.config.layers.clone();
        let mut queue: Vec<(LayerConfig, Option<String>)> = layers.into_iter().map(|l| (l, None)).collect();

        // Breadth first keeps the depth order of the configuration
        let mut index = 0;
        while index < queue.len() {
            let (layer, parent_version) = queue[index].clone();
            index += 1;

            check_version(&layer, parent_version.as_deref())?;

            if layer.scm.is_some() {
                self.update_layer(state, &layer).await?;
            }

            let version = layer.requires_version.clone().or(parent_version);
            queue.extend(layer.layers.iter().cloned().map(|child| (child, version.clone())));
        }

        Ok(())
    }

    async fn update_layer(&self, state: &mut PersistentState, layer: &LayerConfig) -> Result<(), Error> {
        let mut spec = layer.scm.clone().expect("layer with scm");
        spec.set_directory(&layer.name);

        let scm = scm::from_spec(&spec);
        let digest = Digest::of(scm.digest_script());

        let base = self.project.path(LAYER_BASE);
        util::ensure_dir_exists(&base)?;
        let ctx = ScmContext {
            workspace: base.clone(),
            project_root: self.project.root.clone(),
        };

        let state_key = format!("{LAYER_BASE}/{}", layer.name);
        let old = state.checkout_state(&state_key);
        let old_dir_state = old.scms.get(&layer.name).cloned();
        let layer_path = base.join(&layer.name);

        let fresh = !layer_path.exists();
        match &old_dir_state {
            Some(old_scm) if old_scm.digest == digest && !fresh => {
                // Unchanged spec: plain update run
                info!("LAYER {} (update)", layer.name);
                scm.invoke(&ctx, false).await.map_err(|e| Error::Scm(layer.name.clone(), e))?;
            }
            Some(old_scm) if !fresh => {
                let can_switch = old_scm
                    .spec
                    .as_ref()
                    .is_some_and(|old_spec| scm.can_switch(old_spec));
                if can_switch {
                    info!("LAYER {} (switch)", layer.name);
                    let old_spec = old_scm.spec.clone().expect("switchable spec");
                    scm.switch(&ctx, &old_spec).await.map_err(|e| Error::Scm(layer.name.clone(), e))?;
                } else {
                    if !self.attic {
                        return Err(Error::AtticDisabled(layer.name.clone()));
                    }
                    let attic_name = format!("{}_{}", util::path_safe_timestamp(), layer.name);
                    warn!("LAYER {} (move to attic/{attic_name})", layer.name);
                    let attic_dir = base.join("attic");
                    util::ensure_dir_exists(&attic_dir)?;
                    let attic_path = attic_dir.join(&attic_name);
                    fs_err::rename(&layer_path, &attic_path)?;
                    if let Some(old_spec) = old_scm.spec.clone() {
                        state.set_attic_state(&attic_path.display().to_string(), old_spec);
                    }
                    info!("LAYER {} (checkout)", layer.name);
                    scm.invoke(&ctx, true).await.map_err(|e| Error::Scm(layer.name.clone(), e))?;
                }
            }
            _ => {
                info!("LAYER {} (checkout)", layer.name);
                scm.invoke(&ctx, true).await.map_err(|e| Error::Scm(layer.name.clone(), e))?;
            }
        }

        let mut scms = BTreeMap::new();
        scms.insert(
            layer.name.clone(),
            ScmDirState {
                digest,
                spec: Some(spec),
            },
        );
        state.set_directory_state(
            &state_key,
            DirectoryState::Checkout(CheckoutState {
                variant_id: None,
                build_only: None,
                scms,
            }),
        );

        Ok(())
    }

    /// Directory of a checked out layer.
    pub fn layer_path(&self, name: &str) -> PathBuf {
        self.project.path(LAYER_BASE).join(name)
    }
}

fn check_version(layer: &LayerConfig, parent: Option<&str>) -> Result<(), Error> {
    let Some(required) = layer.requires_version.as_deref() else {
        return Ok(());
    };

    if version_newer(required, env!("CARGO_PKG_VERSION")) {
        return Err(Error::VersionTooOld(layer.name.clone(), required.to_owned()));
    }

    // A nested layer must work with whatever its parent accepts
    if let Some(parent) = parent {
        if version_newer(required, parent) {
            return Err(Error::VersionConflict(layer.name.clone(), required.to_owned(), parent.to_owned()));
        }
    }

    Ok(())
}

/// Whether version `a` is newer than `b` (numeric, dot separated).
fn version_newer(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    parse(a) > parse(b)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("layer {0}: scm failed")]
    Scm(String, #[source] scm::Error),
    #[error("layer {0} changed and the attic is disabled")]
    AtticDisabled(String),
    #[error("layer {0} requires version {1}")]
    VersionTooOld(String, String),
    #[error("layer {0} requires version {1}, parent allows at most {2}")]
    VersionConflict(String, String, String),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::Config;
    use crate::scm::ScmSpec;

    fn project_with_layers(dir: &std::path::Path, layers: Vec<LayerConfig>) -> Project {
        let mut config = Config::default();
        config.layers = layers;
        Project {
            root: dir.to_path_buf(),
            config,
        }
    }

    fn import_layer(name: &str, source: &str) -> LayerConfig {
        LayerConfig {
            name: name.to_owned(),
            scm: Some(ScmSpec::Import(crate::scm::ImportSpec {
                url: source.to_owned(),
                dir: ".".into(),
            })),
            requires_version: None,
            layers: vec![],
        }
    }

    #[tokio::test]
    async fn checkout_and_update() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("upstream")).unwrap();
        fs_err::write(dir.path().join("upstream/recipe.yaml"), "v1").unwrap();

        let project = project_with_layers(dir.path(), vec![import_layer("base", "upstream")]);
        let mut state = PersistentState::open(dir.path()).unwrap();

        let manager = LayerManager::new(&project);
        manager.update(&mut state).await.unwrap();
        assert_eq!(
            fs_err::read_to_string(dir.path().join("layers/base/recipe.yaml")).unwrap(),
            "v1"
        );

        // Source changes are picked up on the next update
        fs_err::write(dir.path().join("upstream/recipe.yaml"), "v2").unwrap();
        manager.update(&mut state).await.unwrap();
        assert_eq!(
            fs_err::read_to_string(dir.path().join("layers/base/recipe.yaml")).unwrap(),
            "v2"
        );
        state.finalize();
    }

    #[tokio::test]
    async fn child_version_must_not_exceed_parent() {
        let dir = tempfile::tempdir().unwrap();

        let mut parent = import_layer("parent", "upstream");
        parent.requires_version = Some("0.1".into());
        let mut child = import_layer("child", "upstream");
        child.requires_version = Some("99.0".into());
        parent.layers.push(child);
        parent.scm = None;
        parent.layers[0].scm = None;

        let project = project_with_layers(dir.path(), vec![parent]);
        let mut state = PersistentState::open(dir.path()).unwrap();

        let err = LayerManager::new(&project).update(&mut state).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict(..) | Error::VersionTooOld(..)));
        state.finalize();
    }
}
