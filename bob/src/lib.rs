// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

pub use self::builder::Builder;
pub use self::config::Config;
pub use self::digest::Digest;
pub use self::graph::{Graph, Package, Step, StepKind};
pub use self::project::Project;
pub use self::state::PersistentState;

pub mod archive;
pub mod audit;
pub mod builder;
pub mod config;
pub mod digest;
pub mod dirhash;
pub mod graph;
pub mod invoker;
pub mod layers;
pub mod project;
pub mod scm;
pub mod share;
pub mod state;
pub mod util;
