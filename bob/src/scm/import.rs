// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Plain directory import.
//!
//! Copies a directory from inside the project into the workspace. Used
//! for sources that live next to the recipes. Always local and never
//! deterministic, the source may change at any time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Error, Scm, ScmContext, ScmSpec, Status, Taint};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSpec {
    /// Source directory, relative to the project root.
    pub url: String,
    #[serde(default = "default_dir")]
    pub dir: String,
}

fn default_dir() -> String {
    ".".into()
}

pub struct ImportScm {
    spec: ImportSpec,
}

impl ImportScm {
    pub fn new(spec: ImportSpec) -> Self {
        Self { spec }
    }
}

#[async_trait(?Send)]
impl Scm for ImportScm {
    fn spec(&self) -> ScmSpec {
        ScmSpec::Import(self.spec.clone())
    }

    fn directory(&self) -> &str {
        &self.spec.dir
    }

    fn digest_script(&self) -> String {
        format!("import {}", self.spec.url)
    }

    fn is_deterministic(&self) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn invoke(&self, ctx: &ScmContext, _fresh_checkout: bool) -> Result<(), Error> {
        let source = ctx.project_root.join(&self.spec.url);
        let target = ctx.workspace.join(&self.spec.dir);

        tokio::task::spawn_blocking(move || util::copy_dir(&source, &target))
            .await
            .map_err(std::io::Error::other)??;

        Ok(())
    }

    fn can_switch(&self, old: &ScmSpec) -> bool {
        // A fresh copy over the old content is always possible
        matches!(old, ScmSpec::Import(_))
    }

    async fn switch(&self, ctx: &ScmContext, _old: &ScmSpec) -> Result<(), Error> {
        self.invoke(ctx, false).await
    }

    async fn status(&self, ctx: &ScmContext) -> Status {
        let mut status = Status::default();
        let source = ctx.project_root.join(&self.spec.url);
        if !source.is_dir() {
            status.add(Taint::Error, format!("import source {} missing", self.spec.url));
        }
        status
    }
}
