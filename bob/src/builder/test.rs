// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scheduler tests on throwaway projects.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use fs_err as fs;

use crate::archive::{FileArchive, MultiArchive};
use crate::config::Config;
use crate::digest::{Digest, Encoder};
use crate::graph::{Graph, GraphDoc};
use crate::project::Project;
use crate::share::LocalShare;

use super::{Builder, Error, Options, Statistics};

struct TestProject {
    dir: tempfile::TempDir,
}

impl TestProject {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp project"),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn project(&self) -> Project {
        Project {
            root: self.root().to_path_buf(),
            config: Config::default(),
        }
    }

    fn graph(&self, yaml: &str) -> Graph {
        GraphDoc::from_yaml(yaml).expect("parse graph").resolve().expect("resolve graph")
    }

    async fn build(&self, yaml: &str, options: Options) -> Result<Statistics, Error> {
        self.build_with(yaml, options, |b| b).await
    }

    async fn build_with(
        &self,
        yaml: &str,
        options: Options,
        customize: impl FnOnce(Builder) -> Builder,
    ) -> Result<Statistics, Error> {
        let graph = self.graph(yaml);
        let roots = graph.roots().to_vec();
        let builder = customize(Builder::new(self.project(), graph, options));

        let local = tokio::task::LocalSet::new();
        local.run_until(builder.cook(&roots, false)).await
    }

    /// The single `dist` workspace of a package.
    fn dist(&self, package: &str) -> PathBuf {
        self.root().join(format!("work/{package}/dist/1/workspace"))
    }

    fn src(&self, package: &str) -> PathBuf {
        self.root().join(format!("work/{package}/src/1/workspace"))
    }
}

const SIMPLE: &str = r#"
packages:
  - name: root
    package:
      script: "echo ok > result.txt"
roots: [root]
"#;

#[tokio::test]
async fn simple_build() {
    let test = TestProject::new();

    let stats = test.build(SIMPLE, Options::default()).await.unwrap();
    assert_eq!(stats.packages_built, 1);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "ok\n"
    );

    // Idempotence: nothing runs the second time
    let stats = test.build(SIMPLE, Options::default()).await.unwrap();
    assert_eq!(stats.packages_built, 0);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "ok\n"
    );
}

fn dependency_graph(lib_line: &str) -> String {
    format!(
        r#"
packages:
  - name: liba
    package:
      script: "echo {lib_line} > lib.txt"
  - name: libb
    package:
      script: "echo constant > lib.txt"
  - name: root
    depends: [liba, libb]
    build:
      script: "cat \"$1\"/lib.txt > result.txt && echo root >> result.txt"
    package:
      script: "cp \"$1\"/result.txt ."
roots: [root]
"#
    )
}

#[tokio::test]
async fn dependency_change_triggers_rebuild() {
    let test = TestProject::new();

    let stats = test.build(&dependency_graph("lib"), Options::default()).await.unwrap();
    assert_eq!(stats.packages_built, 3);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "lib\nroot\n"
    );

    // Only the changed dependency and its consumer run again
    let stats = test.build(&dependency_graph("lib-update"), Options::default()).await.unwrap();
    assert_eq!(stats.packages_built, 2);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "lib-update\nroot\n"
    );
}

const CHECKOUT: &str = r#"
packages:
  - name: root
    checkout:
      scms:
        - scm: url
          url: input.txt
    build:
      script: "cat \"$1\"/input.txt > result.txt"
    package:
      script: "cp \"$1\"/result.txt ."
roots: [root]
"#;

#[tokio::test]
async fn build_only_updates_local_sources() {
    let test = TestProject::new();
    fs::write(test.root().join("input.txt"), "foo").unwrap();

    test.build(CHECKOUT, Options::default()).await.unwrap();
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "foo"
    );

    // Source changes are picked up by the update path
    fs::write(test.root().join("input.txt"), "bar").unwrap();
    let options = Options {
        build_only: true,
        ..Options::default()
    };
    test.build(CHECKOUT, options).await.unwrap();
    assert_eq!(
        fs::read_to_string(test.src("root").join("input.txt")).unwrap(),
        "bar"
    );
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "bar"
    );
}

fn scm_graph(file: &str) -> String {
    format!(
        r#"
packages:
  - name: root
    checkout:
      scms:
        - scm: url
          url: {file}
          dir: src
    package:
      script: "cp -r \"$1\"/src ."
roots: [root]
"#
    )
}

#[tokio::test]
async fn incompatible_scm_change_moves_to_attic() {
    let test = TestProject::new();
    fs::write(test.root().join("first.txt"), "one").unwrap();
    fs::write(test.root().join("second.txt"), "two").unwrap();

    test.build(&scm_graph("first.txt"), Options::default()).await.unwrap();
    let src = test.src("root");
    assert!(src.join("src/first.txt").exists());

    // Different file name: no in-place switch possible
    test.build(&scm_graph("second.txt"), Options::default()).await.unwrap();
    assert!(src.join("src/second.txt").exists());
    assert!(!src.join("src/first.txt").exists());

    // The old checkout went to the attic, with its spec on record
    let attic: Vec<_> = fs::read_dir(src.parent().unwrap().join("attic"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(attic.len(), 1);
    assert!(attic[0].join("first.txt").exists());

    let state = crate::state::PersistentState::open(test.root()).unwrap();
    let recorded: Vec<_> = state.attic().map(|(path, _)| path.clone()).collect();
    assert_eq!(recorded, vec![attic[0].display().to_string()]);
    state.finalize();
}

#[tokio::test]
async fn attic_disabled_fails_instead() {
    let test = TestProject::new();
    fs::write(test.root().join("first.txt"), "one").unwrap();
    fs::write(test.root().join("second.txt"), "two").unwrap();

    test.build(&scm_graph("first.txt"), Options::default()).await.unwrap();

    let options = Options {
        attic: false,
        ..Options::default()
    };
    let err = test.build(&scm_graph("second.txt"), options).await.unwrap_err();
    assert!(matches!(err, Error::Build(_)));
}

fn pinned_graph(test: &TestProject, content: &str) -> (String, Digest) {
    use sha1::Digest as _;

    fs::write(test.root().join("pinned.txt"), content).unwrap();
    let pin = Digest(sha1::Sha1::digest(content.as_bytes()).into());
    let yaml = format!(
        r#"
packages:
  - name: root
    checkout:
      scms:
        - scm: url
          url: pinned.txt
          digest: {pin}
    package:
      script: "cp \"$1\"/pinned.txt ."
roots: [root]
"#
    );
    (yaml, pin)
}

#[tokio::test]
async fn wrong_live_build_id_prediction_restarts_once() {
    let test = TestProject::new();
    let archive_dir = tempfile::tempdir().unwrap();
    let (yaml, pin) = pinned_graph(&test, "payload");

    // The checkout combines per-SCM live-build-ids
    let live_id = {
        let mut enc = Encoder::new();
        enc.put_digest(pin);
        enc.finish()
    };

    // Seed the archive with a lying translation
    {
        let mut archive = MultiArchive::new();
        archive.add(Box::new(FileArchive::new(archive_dir.path())), true, true, false);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(archive.upload_live_build_id(live_id, Digest([0xEE; 20])))
            .await
            .unwrap();
    }

    let options = Options {
        download: super::DownloadMode::Yes,
        ..Options::default()
    };
    let stats = test
        .build_with(&yaml, options, |b| {
            let mut archive = MultiArchive::new();
            archive.add(Box::new(FileArchive::new(archive_dir.path())), true, false, false);
            b.with_archive(archive)
        })
        .await
        .unwrap();

    // The prediction was wrong: the build restarted and produced the
    // real content, no stale artifacts kept
    assert_eq!(stats.checkouts, 1);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("pinned.txt")).unwrap(),
        "payload"
    );
}

#[tokio::test]
async fn artifacts_roundtrip_through_archive() {
    let archive_dir = tempfile::tempdir().unwrap();

    // First builder uploads
    let test1 = TestProject::new();
    let options = Options {
        upload: true,
        ..Options::default()
    };
    let stats = test1
        .build_with(SIMPLE, options, |b| {
            let mut archive = MultiArchive::new();
            archive.add(Box::new(FileArchive::new(archive_dir.path())), false, true, false);
            b.with_archive(archive)
        })
        .await
        .unwrap();
    assert_eq!(stats.packages_built, 1);

    // Second builder downloads instead of building
    let test2 = TestProject::new();
    let options = Options {
        download: super::DownloadMode::Yes,
        ..Options::default()
    };
    let stats = test2
        .build_with(SIMPLE, options, |b| {
            let mut archive = MultiArchive::new();
            archive.add(Box::new(FileArchive::new(archive_dir.path())), true, false, false);
            b.with_archive(archive)
        })
        .await
        .unwrap();
    assert_eq!(stats.packages_built, 0);
    assert_eq!(stats.packages_downloaded, 1);
    assert_eq!(
        fs::read_to_string(test2.dist("root").join("result.txt")).unwrap(),
        "ok\n"
    );
    assert!(test2.dist("root").parent().unwrap().join("audit.json.gz").exists());
}

const SHARED: &str = r#"
packages:
  - name: root
    shared: true
    package:
      script: "echo ok > result.txt"
roots: [root]
"#;

#[tokio::test]
async fn shared_packages_are_reused_across_projects() {
    let share_dir = tempfile::tempdir().unwrap();

    let options = Options {
        use_shared: true,
        install_shared: true,
        ..Options::default()
    };

    let test1 = TestProject::new();
    let stats = test1
        .build_with(SHARED, options.clone(), |b| {
            b.with_share(Rc::new(LocalShare::new(share_dir.path())))
        })
        .await
        .unwrap();
    assert_eq!(stats.packages_built, 1);

    // Workspace is now a pointer into the shared location
    assert!(test1.dist("root").is_symlink());
    assert_eq!(
        fs::read_to_string(test1.dist("root").join("result.txt")).unwrap(),
        "ok\n"
    );

    // A second project picks up the shared package without building
    let test2 = TestProject::new();
    let stats = test2
        .build_with(SHARED, options, |b| {
            b.with_share(Rc::new(LocalShare::new(share_dir.path())))
        })
        .await
        .unwrap();
    assert_eq!(stats.packages_built, 0);
    assert_eq!(
        fs::read_to_string(test2.dist("root").join("result.txt")).unwrap(),
        "ok\n"
    );

    // Both point at the same location
    assert_eq!(
        fs::read_link(test1.dist("root")).unwrap(),
        fs::read_link(test2.dist("root")).unwrap()
    );
}

#[tokio::test]
async fn failing_script_reports_build_error() {
    let test = TestProject::new();
    let yaml = r#"
packages:
  - name: root
    package:
      script: "exit 3"
roots: [root]
"#;

    let err = test.build(yaml, Options::default()).await.unwrap_err();
    match err {
        Error::Build(e) => {
            assert!(e.message.contains("returned with 3"), "message: {}", e.message);
            assert_eq!(e.stack, vec!["root".to_owned()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn keep_going_collects_all_errors() {
    let test = TestProject::new();
    let yaml = r#"
packages:
  - name: bad1
    package:
      script: "exit 1"
  - name: bad2
    package:
      script: "exit 2"
roots: [bad1, bad2]
"#;

    let options = Options {
        keep_going: true,
        ..Options::default()
    };
    let err = test.build(yaml, options).await.unwrap_err();
    assert_eq!(err.errors().len(), 2);
}

#[tokio::test]
async fn checkout_only_skips_build_and_package() {
    let test = TestProject::new();
    fs::write(test.root().join("input.txt"), "foo").unwrap();

    let options = Options {
        checkout_only: true,
        ..Options::default()
    };
    let stats = test.build(CHECKOUT, options).await.unwrap();
    assert_eq!(stats.checkouts, 1);
    assert_eq!(stats.packages_built, 0);
    assert!(test.src("root").join("input.txt").exists());
    assert!(!test.dist("root").join("result.txt").exists());
}

#[tokio::test]
async fn parallel_build_produces_same_result() {
    let test = TestProject::new();
    let options = Options {
        jobs: 4,
        ..Options::default()
    };
    let stats = test.build(&dependency_graph("lib"), options).await.unwrap();
    assert_eq!(stats.packages_built, 3);
    assert_eq!(
        fs::read_to_string(test.dist("root").join("result.txt")).unwrap(),
        "lib\nroot\n"
    );
}

#[tokio::test]
async fn force_rebuilds_everything() {
    let test = TestProject::new();
    test.build(SIMPLE, Options::default()).await.unwrap();

    let options = Options {
        force: true,
        ..Options::default()
    };
    let stats = test.build(SIMPLE, options).await.unwrap();
    assert_eq!(stats.packages_built, 1);
}
