// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The resolved package graph.
//!
//! Recipe parsing happens elsewhere; the engine consumes packages that
//! are already reduced to their three steps with all references
//! resolved. A serde document flavor is provided so frontends (and the
//! CLI) can hand over a graph as YAML.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::digest::{self, Digest};
use crate::scm::ScmSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepKind {
    Checkout,
    Build,
    Package,
}

impl StepKind {
    /// Stable identity tag fed into the digests.
    pub fn tag(&self) -> &'static str {
        match self {
            StepKind::Checkout => "checkout",
            StepKind::Build => "build",
            StepKind::Package => "package",
        }
    }

    /// Directory label under the package workspace tree.
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Checkout => "src",
            StepKind::Build => "build",
            StepKind::Package => "dist",
        }
    }
}

/// Reference to another step's result used as a tool.
#[derive(Debug, Clone)]
pub struct ToolRef {
    pub step: StepId,
    /// Relative path inside the tool workspace added to `$PATH`.
    pub path: String,
    /// Relative library paths added to the library search path.
    pub libs: Vec<String>,
}

/// Mount of a host path into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMount {
    pub host: String,
    pub guest: String,
    #[serde(default)]
    pub writable: bool,
    /// Silently skip the mount if the host path does not exist.
    #[serde(default)]
    pub optional: bool,
}

/// Reference to another step's result used as sandbox root.
#[derive(Debug, Clone)]
pub struct SandboxRef {
    pub step: StepId,
    /// `$PATH` entries valid inside the sandbox.
    pub paths: Vec<String>,
    pub mounts: Vec<HostMount>,
    pub net_access: bool,
}

#[derive(Debug)]
pub struct Step {
    pub id: StepId,
    pub kind: StepKind,
    pub package: PackageId,
    pub script: Option<String>,
    /// Digest-normalized script; only this enters the variant-id.
    pub digest_script: Option<String>,
    /// Script run for build-only checkout updates.
    pub update_script: Option<String>,
    pub env: BTreeMap<String, String>,
    pub tools: BTreeMap<String, ToolRef>,
    pub sandbox: Option<SandboxRef>,
    /// Results of other steps consumed by this one, in recipe order.
    pub deps: Vec<StepId>,
    pub scms: Vec<ScmSpec>,
    pub fingerprint_script: Option<String>,
    pub deterministic: bool,
    pub shared: bool,
    pub relocatable: bool,
    pub job_server: bool,
    pub net_access: bool,
}

impl Step {
    /// A step with nothing to execute produces no result.
    pub fn is_valid(&self) -> bool {
        self.script.is_some() || !self.scms.is_empty()
    }

    pub fn is_checkout(&self) -> bool {
        self.kind == StepKind::Checkout
    }

    /// All steps whose results must exist before this step may run:
    /// arguments, tools and the sandbox.
    pub fn all_dep_steps(&self) -> Vec<StepId> {
        let mut seen = HashSet::new();
        let mut ret = vec![];
        for id in self
            .deps
            .iter()
            .copied()
            .chain(self.tools.values().map(|t| t.step))
            .chain(self.sandbox.as_ref().map(|s| s.step))
        {
            if seen.insert(id) {
                ret.push(id);
            }
        }
        ret
    }

    /// Whether any SCM can predict the checkout result hash cheaply.
    pub fn has_live_build_id(&self) -> bool {
        !self.scms.is_empty() && self.scms.iter().all(|scm| crate::scm::from_spec(scm).live_build_id_support())
    }
}

#[derive(Debug)]
pub struct Package {
    pub id: PackageId,
    pub name: String,
    /// Position in the dependency tree, for error messages.
    pub stack: Vec<String>,
    pub layer: Option<String>,
    pub checkout: Option<StepId>,
    pub build: Option<StepId>,
    pub package: StepId,
}

/// The immutable, fully resolved step graph of one build invocation.
#[derive(Debug, Default)]
pub struct Graph {
    steps: Vec<Step>,
    packages: Vec<Package>,
    variant_ids: Vec<Digest>,
    roots: Vec<StepId>,
}

impl Graph {
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0 as usize]
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id.0 as usize]
    }

    pub fn package_of(&self, id: StepId) -> &Package {
        self.package(self.step(id).package)
    }

    /// Recipe-intrinsic identity of a step.
    pub fn variant_id(&self, id: StepId) -> Digest {
        self.variant_ids[id.0 as usize]
    }

    /// Package steps of the requested root packages.
    pub fn roots(&self) -> &[StepId] {
        &self.roots
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter()
    }

    /// Human readable workspace base, `work/<package>/<label>`.
    pub fn base_dir(&self, id: StepId) -> PathBuf {
        let step = self.step(id);
        let package = self.package(step.package);
        Path::new("work")
            .join(package.name.replace("::", "/"))
            .join(step.kind.label())
    }

    /// Key under which the workspace directory of a step is allocated.
    /// Stable across recipe changes.
    pub fn workspace_identity(&self, id: StepId) -> Digest {
        let step = self.step(id);
        let package = self.package(step.package);
        Digest::of_pair(&package.name, step.kind.tag())
    }
}

/// One package in the serialized graph document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackageDoc {
    pub name: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tools: BTreeMap<String, ToolDoc>,
    #[serde(default)]
    pub sandbox: Option<SandboxDoc>,
    #[serde(default)]
    pub checkout: Option<CheckoutDoc>,
    #[serde(default)]
    pub build: Option<ScriptDoc>,
    #[serde(default)]
    pub package: Option<ScriptDoc>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default = "default_true")]
    pub relocatable: bool,
    #[serde(default)]
    pub job_server: bool,
    #[serde(default)]
    pub net_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolDoc {
    pub package: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub libs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SandboxDoc {
    pub package: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<HostMount>,
    #[serde(default)]
    pub net_access: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CheckoutDoc {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub update_script: Option<String>,
    #[serde(default)]
    pub scms: Vec<ScmSpec>,
    #[serde(default = "default_true")]
    pub deterministic: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScriptDoc {
    pub script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphDoc {
    pub packages: Vec<PackageDoc>,
    #[serde(default)]
    pub roots: Vec<String>,
}

pub(crate) fn default_true() -> bool {
    true
}

impl GraphDoc {
    pub fn from_yaml(input: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Resolve the document into a [`Graph`]: create steps, wire
    /// references, validate SCM layout and compute all variant-ids.
    pub fn resolve(self) -> Result<Graph, Error> {
        let mut builder = GraphBuilder::default();

        let by_name: HashMap<&str, &PackageDoc> = self.packages.iter().map(|p| (p.name.as_str(), p)).collect();

        let roots = if self.roots.is_empty() {
            // Anything nobody depends on is a root
            let depended: HashSet<&str> = self
                .packages
                .iter()
                .flat_map(|p| {
                    p.depends
                        .iter()
                        .map(String::as_str)
                        .chain(p.tools.values().map(|t| t.package.as_str()))
                        .chain(p.sandbox.as_ref().map(|s| s.package.as_str()))
                })
                .collect();
            self.packages
                .iter()
                .filter(|p| !depended.contains(p.name.as_str()))
                .map(|p| p.name.clone())
                .collect()
        } else {
            self.roots.clone()
        };

        let mut root_steps = vec![];
        for root in &roots {
            let doc = by_name
                .get(root.as_str())
                .ok_or_else(|| Error::UnknownPackage(root.clone(), "roots".into()))?;
            let id = builder.package(&by_name, doc, &mut vec![])?;
            root_steps.push(builder.graph.package(id).package);
        }

        builder.graph.roots = root_steps;
        Ok(builder.graph)
    }
}

#[derive(Default)]
struct GraphBuilder {
    graph: Graph,
    resolved: HashMap<String, PackageId>,
}

impl GraphBuilder {
    fn package(
        &mut self,
        by_name: &HashMap<&str, &PackageDoc>,
        doc: &PackageDoc,
        stack: &mut Vec<String>,
    ) -> Result<PackageId, Error> {
        if let Some(id) = self.resolved.get(&doc.name) {
            return Ok(*id);
        }
        if stack.contains(&doc.name) {
            return Err(Error::DependencyCycle(doc.name.clone()));
        }
        stack.push(doc.name.clone());

        // Resolve references depth first
        let mut dep_results = vec![];
        for dep in &doc.depends {
            let dep_doc = by_name
                .get(dep.as_str())
                .ok_or_else(|| Error::UnknownPackage(dep.clone(), doc.name.clone()))?;
            let id = self.package(by_name, dep_doc, stack)?;
            dep_results.push(self.graph.package(id).package);
        }

        let mut tools = BTreeMap::new();
        for (name, tool) in &doc.tools {
            let tool_doc = by_name
                .get(tool.package.as_str())
                .ok_or_else(|| Error::UnknownPackage(tool.package.clone(), doc.name.clone()))?;
            let id = self.package(by_name, tool_doc, stack)?;
            tools.insert(
                name.clone(),
                ToolRef {
                    step: self.graph.package(id).package,
                    path: tool.path.clone(),
                    libs: tool.libs.clone(),
                },
            );
        }

        let sandbox = match &doc.sandbox {
            Some(sandbox) => {
                let sandbox_doc = by_name
                    .get(sandbox.package.as_str())
                    .ok_or_else(|| Error::UnknownPackage(sandbox.package.clone(), doc.name.clone()))?;
                let id = self.package(by_name, sandbox_doc, stack)?;
                Some(SandboxRef {
                    step: self.graph.package(id).package,
                    paths: sandbox.paths.clone(),
                    mounts: sandbox.mounts.clone(),
                    net_access: sandbox.net_access,
                })
            }
            None => None,
        };

        let package_id = PackageId(self.graph.packages.len() as u32);

        // checkout step
        let checkout = doc
            .checkout
            .as_ref()
            .map(|checkout| {
                validate_scm_layout(&checkout.scms)?;
                Ok::<_, Error>(self.step(Step {
                    id: StepId(0),
                    kind: StepKind::Checkout,
                    package: package_id,
                    script: checkout.script.clone(),
                    digest_script: checkout.script.as_ref().map(|s| digest_normalize(s)),
                    update_script: checkout.update_script.clone(),
                    env: doc.environment.clone(),
                    tools: tools.clone(),
                    sandbox: sandbox.clone(),
                    deps: vec![],
                    scms: checkout.scms.clone(),
                    fingerprint_script: None,
                    deterministic: checkout.deterministic && checkout.scms.iter().all(|s| crate::scm::from_spec(s).is_deterministic()),
                    shared: false,
                    relocatable: doc.relocatable,
                    job_server: doc.job_server,
                    net_access: true,
                }))
            })
            .transpose()?;

        // build step: consumes the checkout result and all dependencies
        let build = doc.build.as_ref().map(|build| {
            let mut deps = vec![];
            if let Some(checkout) = checkout {
                if self.graph.step(checkout).is_valid() {
                    deps.push(checkout);
                }
            }
            deps.extend(dep_results.iter().copied());
            self.step(Step {
                id: StepId(0),
                kind: StepKind::Build,
                package: package_id,
                script: Some(build.script.clone()),
                digest_script: Some(digest_normalize(&build.script)),
                update_script: None,
                env: doc.environment.clone(),
                tools: tools.clone(),
                sandbox: sandbox.clone(),
                deps,
                scms: vec![],
                fingerprint_script: doc.fingerprint.clone(),
                deterministic: true,
                shared: false,
                relocatable: doc.relocatable,
                job_server: doc.job_server,
                net_access: doc.net_access,
            })
        });

        // package step: repackages the build result (or the bare
        // checkout when there is no build script)
        let mut deps = vec![];
        if let Some(build) = build {
            deps.push(build);
        } else if let Some(checkout) = checkout {
            if self.graph.step(checkout).is_valid() {
                deps.push(checkout);
            }
        }
        let package_step = self.step(Step {
            id: StepId(0),
            kind: StepKind::Package,
            package: package_id,
            script: doc.package.as_ref().map(|p| p.script.clone()),
            digest_script: doc.package.as_ref().map(|p| digest_normalize(&p.script)),
            update_script: None,
            env: doc.environment.clone(),
            tools: tools.clone(),
            sandbox: sandbox.clone(),
            deps,
            scms: vec![],
            fingerprint_script: doc.fingerprint.clone(),
            deterministic: true,
            shared: doc.shared,
            relocatable: doc.relocatable,
            job_server: false,
            net_access: doc.net_access,
        });

        stack.pop();

        self.graph.packages.push(Package {
            id: package_id,
            name: doc.name.clone(),
            stack: {
                let mut s = stack.clone();
                s.push(doc.name.clone());
                s
            },
            layer: doc.layer.clone(),
            checkout,
            build,
            package: package_step,
        });
        self.resolved.insert(doc.name.clone(), package_id);

        Ok(package_id)
    }

    fn step(&mut self, mut step: Step) -> StepId {
        let id = StepId(self.graph.steps.len() as u32);
        step.id = id;
        self.graph.steps.push(step);

        // References always point at earlier steps, their variant-ids
        // are already present.
        let vid = digest::variant_id(&self.graph, id, |dep| self.graph.variant_id(dep));
        self.graph.variant_ids.push(vid);
        id
    }
}

/// Normalize a script for digesting: per-line trailing whitespace is
/// stripped so cosmetic edits do not count as recipe changes.
pub fn digest_normalize(script: &str) -> String {
    script
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// SCM directories must form a proper forest: no duplicate targets, and
/// nesting is only allowed strictly inside another SCM's directory.
fn validate_scm_layout(scms: &[ScmSpec]) -> Result<(), Error> {
    let mut dirs: Vec<&str> = vec![];
    for scm in scms {
        let dir = scm.directory();
        if dirs.contains(&dir) {
            return Err(Error::ScmCollision(dir.to_owned()));
        }
        dirs.push(dir);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse graph document")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unknown package '{0}' referenced by '{1}'")]
    UnknownPackage(String, String),
    #[error("dependency cycle through '{0}'")]
    DependencyCycle(String),
    #[error("multiple SCMs target directory '{0}'")]
    ScmCollision(String),
}

#[cfg(test)]
mod test {
    use super::*;

    const DOC: &str = r#"
packages:
  - name: tool
    package:
      script: "echo tool"
  - name: lib
    package:
      script: "echo lib"
  - name: root
    depends: [lib]
    tools:
      cc: {package: tool, path: bin}
    checkout:
      scms:
        - scm: import
          url: sources
          dir: src
    build:
      script: "make"
    package:
      script: "make install"
roots: [root]
"#;

    #[test]
    fn resolve_wires_references() {
        let graph = GraphDoc::from_yaml(DOC).unwrap().resolve().unwrap();

        let root = graph.packages().find(|p| p.name == "root").unwrap();
        let build = graph.step(root.build.unwrap());
        let package = graph.step(root.package);

        // build consumes the checkout and the dependency result
        assert_eq!(build.deps.len(), 2);
        assert_eq!(build.deps[0], root.checkout.unwrap());
        assert_eq!(build.tools.get("cc").unwrap().path, "bin");

        // package consumes the build result
        assert_eq!(package.deps, vec![root.build.unwrap()]);
        assert_eq!(graph.roots(), &[root.package]);

        // import scm makes the checkout non-deterministic
        assert!(!graph.step(root.checkout.unwrap()).deterministic);
    }

    #[test]
    fn variant_ids_are_distinct_per_step() {
        let graph = GraphDoc::from_yaml(DOC).unwrap().resolve().unwrap();
        let root = graph.packages().find(|p| p.name == "root").unwrap();

        let checkout = graph.variant_id(root.checkout.unwrap());
        let build = graph.variant_id(root.build.unwrap());
        let package = graph.variant_id(root.package);
        assert_ne!(checkout, build);
        assert_ne!(build, package);
        assert_ne!(checkout, package);
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let doc = r#"
packages:
  - name: a
    depends: [b]
    package: {script: "true"}
  - name: b
    depends: [a]
    package: {script: "true"}
roots: [a]
"#;
        let err = GraphDoc::from_yaml(doc).unwrap().resolve().unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
    }

    #[test]
    fn duplicate_scm_directories_are_rejected() {
        let doc = r#"
packages:
  - name: a
    checkout:
      scms:
        - {scm: import, url: one, dir: src}
        - {scm: import, url: two, dir: src}
    package: {script: "true"}
roots: [a]
"#;
        let err = GraphDoc::from_yaml(doc).unwrap().resolve().unwrap_err();
        assert!(matches!(err, Error::ScmCollision(_)));
    }

    #[test]
    fn script_normalization_strips_trailing_whitespace() {
        assert_eq!(digest_normalize("make -j4   \necho done\t"), "make -j4\necho done");
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    //! Tiny graph construction helpers for unit tests.

    use super::*;

    pub struct StepSpec {
        doc: PackageDoc,
        extra: Vec<PackageDoc>,
    }

    impl StepSpec {
        pub fn package(name: &str) -> Self {
            Self {
                doc: PackageDoc {
                    name: name.to_owned(),
                    package: Some(ScriptDoc {
                        script: "true".into(),
                    }),
                    ..Default::default()
                },
                extra: vec![],
            }
        }

        pub fn script(mut self, script: &str) -> Self {
            self.doc.package = Some(ScriptDoc {
                script: script.to_owned(),
            });
            self
        }

        pub fn env<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
            self.doc.environment = pairs
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            self
        }

        pub fn tool(mut self, name: &str, tool_package: &str, path: &str, libs: &[&str]) -> Self {
            if !self.extra.iter().any(|p| p.name == tool_package) {
                self.extra.push(PackageDoc {
                    name: tool_package.to_owned(),
                    package: Some(ScriptDoc {
                        script: format!("echo {tool_package}"),
                    }),
                    ..Default::default()
                });
            }
            self.doc.tools.insert(
                name.to_owned(),
                ToolDoc {
                    package: tool_package.to_owned(),
                    path: path.to_owned(),
                    libs: libs.iter().map(|&l| l.to_owned()).collect(),
                },
            );
            self
        }
    }

    /// Build a graph with the described root package.
    pub fn graph_with(spec: StepSpec) -> Graph {
        let root = spec.doc.name.clone();
        let mut packages = spec.extra;
        packages.push(spec.doc);
        GraphDoc {
            packages,
            roots: vec![root],
        }
        .resolve()
        .expect("resolve test graph")
    }
}
