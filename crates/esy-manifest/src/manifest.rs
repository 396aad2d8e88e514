use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A normalized build description: the single internal shape both esy-json
/// and opam manifests collapse into at the loader boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BuildManifest {
    pub name: Option<String>,
    pub version: Option<Version>,
    pub build_type: BuildType,
    pub build: Option<Commands>,
    pub install: Option<Commands>,
    /// Alternate build commands used in place of `build` when planning a
    /// dev sandbox; see the Task Planner's `dev` handling.
    pub build_dev: Option<Commands>,
    pub exported_env: BTreeMap<String, ExportedEnvEntry>,
    pub build_env: BTreeMap<String, String>,
    pub patches: Vec<Patch>,
    pub substs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildType {
    #[default]
    InSource,
    JbuilderLike,
    OutOfSource,
    Unsafe,
}

/// A version string tagged by the format it came from — opam version
/// strings are not guaranteed to be semver, so the origin is retained for
/// hash stability even though both render the same to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Version {
    Npm(String),
    Opam(String),
}

impl Version {
    pub fn as_str(&self) -> &str {
        match self {
            Version::Npm(v) | Version::Opam(v) => v,
        }
    }
}

/// A build or install command plan, tagged by the manifest dialect that
/// produced it. `EsyCommands` always wins when folded over by an override
/// (§4.2): overrides only ever carry esy-style command lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Commands {
    Opam(Vec<Vec<String>>),
    Esy(Vec<Vec<String>>),
}

impl Commands {
    pub fn as_lists(&self) -> &[Vec<String>] {
        match self {
            Commands::Opam(c) | Commands::Esy(c) => c,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvScope {
    Local,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedEnvEntry {
    pub value: String,
    pub scope: EnvScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub path: PathBuf,
    pub filter: Option<String>,
}

impl BuildManifest {
    /// A manifest with neither `build` nor `install` is valid (no-op).
    pub fn is_noop(&self) -> bool {
        self.build.is_none() && self.install.is_none()
    }

    /// Coerce `name` into the `@opam/` scope unless it already carries one,
    /// per the opam->BuildManifest mapping (scenario 2 of the testable
    /// properties).
    pub fn scope_opam_name(mut self) -> Self {
        if let Some(name) = self.name.take() {
            self.name = Some(if name.starts_with("@opam/") {
                name
            } else {
                format!("@opam/{name}")
            });
        }
        self
    }
}
